use async_trait::async_trait;
use kconnect_protocol::{ConnectError, ConnectResult};

use crate::target::SshTarget;

/// Source of an SSH password when no key or agent identity is accepted.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    async fn password(&self, target: &SshTarget) -> ConnectResult<String>;
}

/// Reads the password from the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl PasswordPrompt for TerminalPrompt {
    async fn password(&self, target: &SshTarget) -> ConnectResult<String> {
        let message = format!("{target} password: ");
        tokio::task::spawn_blocking(move || rpassword::prompt_password(message))
            .await
            .map_err(|error| ConnectError::Authentication(format!("password prompt failed: {error}")))?
            .map_err(ConnectError::from)
    }
}

/// A password known up front, e.g. read from the environment.
#[derive(Clone)]
pub struct FixedPassword(String);

impl FixedPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }
}

impl std::fmt::Debug for FixedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedPassword(<redacted>)")
    }
}

#[async_trait]
impl PasswordPrompt for FixedPassword {
    async fn password(&self, _target: &SshTarget) -> ConnectResult<String> {
        Ok(self.0.clone())
    }
}
