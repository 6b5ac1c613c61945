//! Error types shared across the client engine.

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// Errors from the HTTP surface (run creation, event streams, play sessions).
#[derive(Debug)]
pub enum ApiError {
    /// Network / reqwest-level error.
    Http(reqwest::Error),
    /// Non-2xx status from the server.
    Status { code: u16, body: String },
    /// The server answered with a body we could not interpret.
    InvalidResponse(String),
    /// The event stream broke mid-flight.
    Stream(String),
}

impl ApiError {
    /// Build a status error, trimming oversized bodies.
    pub fn status(code: u16, body: String) -> Self {
        Self::Status {
            code,
            body: crate::textutil::truncate_with_suffix_by_chars(&body, 2_000, "..."),
        }
    }

    /// HTTP status code, when the error came from a non-2xx response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::Http(inner) => inner.status().map(|s| s.as_u16()),
            Self::InvalidResponse(_) | Self::Stream(_) => None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http: {e}"),
            Self::Status { code, body } => write!(f, "status {code}: {body}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

// ---------------------------------------------------------------------------
// PersistError
// ---------------------------------------------------------------------------

/// Errors from the on-disk project/thread store.
#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Json(e) => write!(f, "json: {e}"),
            Self::Invalid(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// ---------------------------------------------------------------------------
// GateError
// ---------------------------------------------------------------------------

/// Rejected execution-gate decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The run is not present in the store.
    UnknownRun(String),
    /// The action is missing, not an exec request, or already decided.
    NotAwaitingDecision { run_id: String, action_id: String },
    /// Another accepted request still owns the sandbox.
    SandboxBusy { run_id: String, action_id: String },
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRun(run_id) => write!(f, "unknown run `{run_id}`"),
            Self::NotAwaitingDecision { run_id, action_id } => write!(
                f,
                "action `{action_id}` in run `{run_id}` is not awaiting an execution decision"
            ),
            Self::SandboxBusy { run_id, action_id } => write!(
                f,
                "sandbox is still executing request `{action_id}` for run `{run_id}`"
            ),
        }
    }
}

impl std::error::Error for GateError {}

// ---------------------------------------------------------------------------
// SandboxError
// ---------------------------------------------------------------------------

/// Errors from the sandbox session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// A session is already starting or running.
    Busy,
    /// Credentials arrived for a session that is no longer starting.
    NotStarting,
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "a sandbox session is already active"),
            Self::NotStarting => write!(f, "no sandbox session is starting"),
        }
    }
}

impl std::error::Error for SandboxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e = ConfigError::from(io_err);
        let s = e.to_string();
        assert!(s.starts_with("io:"), "got: {s}");
        assert!(s.contains("file not found"));
    }

    #[test]
    fn config_error_from_toml() {
        let toml_err: toml::de::Error = toml::from_str::<toml::Value>("x = [unclosed").unwrap_err();
        let e = ConfigError::from(toml_err);
        assert!(e.to_string().starts_with("toml:"));
    }

    #[test]
    fn api_status_error_reports_code() {
        let err = ApiError::status(503, "unavailable".to_string());
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.to_string(), "status 503: unavailable");
    }

    #[test]
    fn api_status_error_truncates_huge_bodies() {
        let err = ApiError::status(500, "x".repeat(5_000));
        let ApiError::Status { body, .. } = err else {
            panic!("expected status variant");
        };
        assert!(body.ends_with("..."));
        assert!(body.chars().count() <= 2_003);
    }

    #[test]
    fn persist_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(PersistError::from(json_err).to_string().starts_with("json:"));
    }

    #[test]
    fn gate_error_display_names_action() {
        let err = GateError::NotAwaitingDecision {
            run_id: "r1".into(),
            action_id: "tc_3".into(),
        };
        assert!(err.to_string().contains("tc_3"));
    }
}
