//! Authentication parameters shared with the message-signing layer.
//!
//! A [`Session`] owns the key and signature scheme written into a connection
//! file, plus the history of message digests already seen (replay
//! detection). Signing itself happens elsewhere.

use std::fmt;

use indexmap::IndexSet;

use crate::error::{ConnectError, ConnectResult};

pub const DEFAULT_SIGNATURE_SCHEME: &str = "hmac-sha256";

const SUPPORTED_DIGESTS: &[&str] = &["md5", "sha1", "sha224", "sha256", "sha384", "sha512"];
const DIGEST_HISTORY_SIZE: usize = 1 << 16;

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    key: Vec<u8>,
    signature_scheme: String,
    digest_history: IndexSet<Vec<u8>>,
}

impl Session {
    /// A session with a fresh random key.
    pub fn new() -> Self {
        Self::with_key(uuid::Uuid::new_v4().to_string().into_bytes())
    }

    pub fn with_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            signature_scheme: DEFAULT_SIGNATURE_SCHEME.to_owned(),
            digest_history: IndexSet::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn set_key(&mut self, key: impl Into<Vec<u8>>) {
        self.key = key.into();
    }

    pub fn signature_scheme(&self) -> &str {
        &self.signature_scheme
    }

    /// Accepts `hmac-<digest>` for the digests the signing layer supports.
    pub fn set_signature_scheme(&mut self, scheme: &str) -> ConnectResult<()> {
        let scheme = scheme.to_ascii_lowercase();
        let digest = scheme
            .strip_prefix("hmac-")
            .ok_or_else(|| ConnectError::InvalidSignatureScheme(scheme.clone()))?;
        if !SUPPORTED_DIGESTS.contains(&digest) {
            return Err(ConnectError::InvalidSignatureScheme(scheme));
        }
        self.signature_scheme = scheme;
        Ok(())
    }

    /// Records a digest, returning `false` if it was already seen.
    pub fn record_digest(&mut self, digest: impl Into<Vec<u8>>) -> bool {
        let inserted = self.digest_history.insert(digest.into());
        if self.digest_history.len() > DIGEST_HISTORY_SIZE {
            // cull the oldest 10%
            let excess = DIGEST_HISTORY_SIZE / 10;
            self.digest_history.drain(..excess);
        }
        inserted
    }

    pub fn digest_history_len(&self) -> usize {
        self.digest_history.len()
    }

    /// Copy of this session with an independent, empty digest history.
    pub fn fork(&self) -> Self {
        Self {
            key: self.key.clone(),
            signature_scheme: self.signature_scheme.clone(),
            digest_history: IndexSet::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &"<redacted>")
            .field("signature_scheme", &self.signature_scheme)
            .field("digest_history", &self.digest_history.len())
            .finish()
    }
}
