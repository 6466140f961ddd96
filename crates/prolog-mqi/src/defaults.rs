use std::{env, path::PathBuf, time::Duration};

/// How long to wait for the launched server to print its port and password.
pub(crate) const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `stop` waits for the child to exit after `halt.` before killing it.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a single frame payload; larger headers are protocol faults.
pub(crate) const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
/// Portable ceiling for `sun_path`; longer generated socket paths are refused.
pub(crate) const MAX_SOCKET_PATH_BYTES: usize = 92;

pub(crate) const PROLOG_PATH_ENV: &str = "PROLOG_PATH";
pub(crate) const DEFAULT_PROLOG_BINARY: &str = "swipl";

pub(crate) fn default_prolog_path() -> PathBuf {
    env::var_os(PROLOG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROLOG_BINARY))
}
