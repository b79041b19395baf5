use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::Glob;
use kconnect_protocol::{ConnectError, ConnectResult};
use tracing::debug;

/// Overrides the directory kernels keep their connection files in.
pub const RUNTIME_DIR_ENV: &str = "KCONNECT_RUNTIME_DIR";

/// Runtime directory for connection files, honouring [`RUNTIME_DIR_ENV`].
pub fn runtime_dir() -> PathBuf {
    runtime_dir_from(std::env::var_os(RUNTIME_DIR_ENV))
}

pub fn runtime_dir_from(env_value: Option<OsString>) -> PathBuf {
    if let Some(dir) = env_value.filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("kconnect").join("runtime"))
        .unwrap_or_else(|| std::env::temp_dir().join("kconnect").join("runtime"))
}

/// The current directory, then the runtime directory.
pub fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("."), runtime_dir()]
}

/// Finds a connection file and returns its absolute path.
///
/// An exact name (or absolute path) is tried first. Otherwise `filename` is
/// a glob over file names in each search path, wrapped as `*filename*` when
/// it has no wildcard of its own; among several matches the most recently
/// accessed one wins. Hidden files only match a pattern that itself starts
/// with a dot.
pub fn find_connection_file(filename: &str, search_paths: &[PathBuf]) -> ConnectResult<PathBuf> {
    if let Some(found) = find_exact(filename, search_paths)? {
        return Ok(found);
    }

    let pattern = if filename.contains(['*', '?', '[']) {
        filename.to_owned()
    } else {
        format!("*{filename}*")
    };
    let include_hidden = pattern.starts_with('.');
    let matcher = Glob::new(&pattern)
        .map_err(|error| ConnectError::InvalidPattern(format!("{pattern}: {error}")))?
        .compile_matcher();

    let mut matches = Vec::new();
    for dir in search_paths {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut found = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name().is_some_and(|name| {
                    (include_hidden || !name.to_string_lossy().starts_with('.'))
                        && matcher.is_match(Path::new(name))
                })
            })
            .collect::<Vec<_>>();
        found.sort();
        for path in found {
            matches.push(std::path::absolute(path)?);
        }
    }

    debug!(pattern, matches = matches.len(), "searched for connection file");
    if matches.len() > 1 {
        // stable sort: among equal access times the last collected wins
        matches.sort_by_key(|path| access_time(path));
    }
    matches
        .pop()
        .ok_or_else(|| ConnectError::ConnectionFileNotFound {
            name: filename.to_owned(),
            search_paths: search_paths.to_vec(),
        })
}

fn find_exact(filename: &str, search_paths: &[PathBuf]) -> ConnectResult<Option<PathBuf>> {
    let candidate = Path::new(filename);
    if candidate.is_absolute() {
        return Ok(candidate.is_file().then(|| candidate.to_path_buf()));
    }
    for dir in search_paths {
        let path = dir.join(candidate);
        if path.is_file() {
            return Ok(Some(std::path::absolute(path)?));
        }
    }
    Ok(None)
}

fn access_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|metadata| metadata.accessed())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
