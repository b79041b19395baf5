use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kconnect_connection::{
    KernelConnection, default_search_paths, find_connection_file, read_connection_file,
    runtime_dir,
};
use kconnect_kernel::{KernelConnector, KernelConnectorBuilder};
use kconnect_protocol::{ConnectError, KernelId, KernelSpec, Transport};
use kconnect_provisioning::ProvisionerFactory;
use kconnect_tunnel::{TerminalPrompt, TunnelSource, tunnel_to_kernel};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "kconnect")]
#[command(about = "Kernel connection files, lookups, and SSH tunnels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a connection file with fresh ports and a fresh key.
    Write {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "tcp")]
        transport: Transport,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, default_value = "")]
        kernel_name: String,
    },
    /// Resolve a connection file name or glob to an absolute path.
    Find {
        pattern: String,
        /// Extra directories searched before the defaults.
        #[arg(long = "path")]
        paths: Vec<PathBuf>,
    },
    /// Print a connection file with its key redacted.
    Show { file: PathBuf },
    /// Forward a remote kernel's ports over SSH until interrupted.
    Tunnel {
        file: PathBuf,
        /// `[user@]host[:port]`
        #[arg(long)]
        server: String,
        #[arg(long, env = "KCONNECT_SSH_KEY")]
        key: Option<PathBuf>,
        /// Where to write the connection file for the local end.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Prepare connection files for a number of local kernels and hold
    /// them until interrupted.
    Prepare {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Kernel ids to use instead of `count` generated ones.
        #[arg(long = "id")]
        ids: Vec<String>,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value = "tcp")]
        transport: Transport,
        #[arg(long, default_value = "kernel")]
        display_name: String,
    },
    /// List registered kernel provisioners.
    Provisioners,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Write {
            file,
            transport,
            ip,
            kernel_name,
        } => {
            let mut connection = KernelConnection::new()
                .with_transport(transport)
                .with_kernel_name(kernel_name);
            if let Some(file) = file {
                connection.set_connection_file(file);
            }
            if let Some(ip) = ip {
                connection.set_ip(ip);
            }
            let path = connection.write_connection_file()?;
            info!(path = %path.display(), ports = ?connection.ports(), "connection file written");
            println!("{}", path.display());
        }
        Command::Find { pattern, paths } => {
            let mut search_paths = paths;
            search_paths.extend(default_search_paths());
            let path = find_connection_file(&pattern, &search_paths)?;
            println!("{}", path.display());
        }
        Command::Show { file } => {
            let patch = read_connection_file(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut rendered = serde_json::to_value(&patch)?;
            if let Some(key) = rendered.get_mut("key") {
                *key = Value::String("<redacted>".to_owned());
            }
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
        Command::Tunnel {
            file,
            server,
            key,
            output,
        } => {
            let remote = TunnelSource::from(file.clone()).load()?;
            let tunnel = tunnel_to_kernel(file, &server, key.as_deref(), &TerminalPrompt).await?;
            let local = tunnel.local_connection_info(&remote);
            let rendered = local.to_json_pretty()?;
            match output {
                Some(output) => {
                    kconnect_connection::secure_write(&output, rendered.as_bytes())?;
                    info!(path = %output.display(), "local connection file written");
                }
                None => println!("{rendered}"),
            }
            info!(server = %tunnel.target(), ports = ?tunnel.local_ports(), "tunnel open");
            wait_for_interrupt().await;
            tunnel.close().await?;
        }
        Command::Prepare {
            count,
            ids,
            dir,
            transport,
            display_name,
        } => {
            let connector = KernelConnectorBuilder::new(dir.unwrap_or_else(runtime_dir))
                .transport(transport)
                .build();
            let spec = KernelSpec::new(display_name);
            let ids = if ids.is_empty() {
                vec![None; count]
            } else {
                ids.into_iter().map(|id| Some(KernelId::from(id))).collect()
            };
            for (kernel_id, path) in prepare_kernels(&connector, &spec, ids).await? {
                println!("{kernel_id}\t{}", path.display());
            }
            wait_for_interrupt().await;
            connector.release_all().await?;
            info!("released all kernels");
        }
        Command::Provisioners => {
            let factory = ProvisionerFactory::with_builtins();
            for (name, locator) in factory.provisioner_entries() {
                let marker = if name == factory.default_provisioner_name() {
                    " (default)"
                } else {
                    ""
                };
                println!("{name}\t{locator}{marker}");
            }
        }
    }
    Ok(())
}

/// Prepares one kernel per id. If any of them fails, the ones already
/// prepared are released before the error is returned.
async fn prepare_kernels(
    connector: &KernelConnector,
    spec: &KernelSpec,
    ids: Vec<Option<KernelId>>,
) -> Result<Vec<(KernelId, PathBuf)>> {
    let mut prepared = Vec::with_capacity(ids.len());
    for kernel_id in ids {
        let result = async {
            let kernel_id = connector.prepare_kernel(kernel_id, spec).await?;
            let path = connector.connection_file(&kernel_id).await?;
            Ok::<_, ConnectError>((kernel_id, path))
        }
        .await;
        match result {
            Ok(kernel) => prepared.push(kernel),
            Err(error) => {
                if let Err(release_error) = connector.release_all().await {
                    warn!(error = %release_error, "failed to release prepared kernels");
                }
                return Err(error).context("preparing kernels");
            }
        }
    }
    Ok(prepared)
}

async fn wait_for_interrupt() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to install Ctrl+C handler");
    }
}
