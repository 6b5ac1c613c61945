//! Default configuration constants.

/// Agent backend base URL.
pub(super) const DEFAULT_BASE_URL: &str = "http://localhost:8000";
/// User id sent with run and play requests.
pub(super) const DEFAULT_USER_ID: &str = "local";
/// Connect and create-request timeout.
pub(super) const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Delay between a finished sandbox session and the next start.
pub(super) const DEFAULT_SANDBOX_COOLDOWN_MS: u64 = 1_500;
/// Threads kept per project.
pub(super) const DEFAULT_MAX_THREADS: usize = crate::persist::DEFAULT_MAX_THREADS;
/// Local state directory, relative to the working directory.
pub(super) const DEFAULT_STATE_DIR: &str = ".tether";
/// Local config file name.
pub(super) const CONFIG_FILE_NAME: &str = "tether.toml";
/// Directory under the user config root.
pub(super) const CONFIG_DIR_NAME: &str = "tether";
