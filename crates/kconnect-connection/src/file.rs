use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use kconnect_ports::select_random_ports;
use kconnect_protocol::{
    ConnectError, ConnectResult, ConnectionInfo, ConnectionInfoPatch, LOCALHOST, Transport,
};
use tracing::{debug, instrument, trace};

/// Writes `info` as a connection file, allocating every port still unset.
///
/// tcp ports are collected as one batch of simultaneously bound sockets
/// before any of them is assigned; ipc ports are the lowest indexes whose
/// `{ip}-{index}` path does not exist yet. Without a `path` a fresh
/// `kernel-*.json` is created in the temp directory. Returns the path and
/// the info as written.
#[instrument(skip(info), fields(transport = %info.transport, ip = %info.ip))]
pub fn write_connection_file(
    path: Option<&Path>,
    mut info: ConnectionInfo,
) -> ConnectResult<(PathBuf, ConnectionInfo)> {
    if info.ip.is_empty() {
        info.ip = LOCALHOST.to_owned();
    }
    if std::str::from_utf8(&info.key).is_err() {
        return Err(ConnectError::InvalidKey("key must be UTF-8 text".to_owned()));
    }

    let path = match path {
        Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
        _ => temp_connection_path()?,
    };

    let unset = info.ports.unset_channels();
    let fresh = match info.transport {
        Transport::Tcp => select_random_ports(&info.ip, unset.len())?,
        Transport::Ipc => next_ipc_indexes(&info.ip, unset.len()),
    };
    for (channel, port) in unset.into_iter().zip(fresh) {
        info.ports.set(channel, port);
    }

    let contents = info.to_json_pretty()?;
    secure_write(&path, contents.as_bytes())?;
    mark_directory_sticky(&path);

    debug!(path = %path.display(), ports = ?info.ports, "wrote connection file");
    Ok((path, info))
}

/// Reads a connection file without applying it anywhere.
pub fn read_connection_file(path: &Path) -> ConnectResult<ConnectionInfoPatch> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Creates `path` readable and writable by its owner only and writes
/// `contents`. Any previous file at `path` is replaced. The file is opened
/// with create-new so it never exists with wider permissions; if writing
/// fails the partial file is removed.
pub fn secure_write(path: &Path, contents: &[u8]) -> ConnectResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    let result = restrict_to_owner(&file, path).and_then(|()| {
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    });
    if result.is_err() {
        drop(file);
        let _ = fs::remove_file(path);
    }
    result
}

#[cfg(unix)]
fn restrict_to_owner(file: &File, path: &Path) -> ConnectResult<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    let mode = file.metadata()?.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(ConnectError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &File, _path: &Path) -> ConnectResult<()> {
    Ok(())
}

/// Sets the sticky bit on the file's directory so other users cannot
/// remove or replace it. Failures are ignored.
#[cfg(unix)]
fn mark_directory_sticky(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    const S_ISVTX: u32 = 0o1000;

    let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return;
    };
    let Ok(metadata) = fs::metadata(dir) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if mode & S_ISVTX != 0 {
        return;
    }
    if let Err(error) = fs::set_permissions(dir, fs::Permissions::from_mode(mode | S_ISVTX)) {
        trace!(%error, dir = %dir.display(), "could not mark directory sticky");
    }
}

#[cfg(not(unix))]
fn mark_directory_sticky(_path: &Path) {}

fn temp_connection_path() -> ConnectResult<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("kernel-")
        .suffix(".json")
        .tempfile()?;
    Ok(file.into_temp_path().keep().map_err(io::Error::from)?)
}

fn next_ipc_indexes(ip: &str, count: usize) -> Vec<u16> {
    let mut indexes = Vec::with_capacity(count);
    let mut next: u16 = 1;
    for _ in 0..count {
        while Path::new(&format!("{ip}-{next}")).exists() {
            next += 1;
        }
        indexes.push(next);
        next += 1;
    }
    indexes
}
