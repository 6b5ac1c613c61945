//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`TETHER_BASE_URL`, `TETHER_USER_ID`,
//!    `TETHER_MODEL`, `TETHER_TIMEOUT_SECS`, `TETHER_STATE_DIR`,
//!    `TETHER_SANDBOX_COOLDOWN_MS`)
//! 2. TOML file specified via `--config`
//! 3. `./tether.toml` in the current directory
//! 4. `$XDG_CONFIG_HOME/tether/tether.toml` (or the platform config dir)
//! 5. Built-in defaults

mod defaults;
mod env;
mod loader;
mod sources;
mod types;

pub use loader::{load_config, load_config_with_source};
pub use sources::ConfigSource;
pub use types::{Config, LogConfig, SandboxConfig, ServerConfig, ThreadsConfig};

/// A resolved config plus the file it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: ConfigSource,
}

#[cfg(test)]
mod tests {
    use super::loader::load_config_from_sources;
    use super::*;
    use crate::error::ConfigError;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn load_with(
        files: &[(&str, &str)],
        env: &[(&str, &str)],
        path_override: Option<&str>,
    ) -> Result<LoadedConfig, ConfigError> {
        let files: HashMap<PathBuf, String> = files
            .iter()
            .map(|(p, t)| (PathBuf::from(p), t.to_string()))
            .collect();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from_sources(
            path_override,
            |path: &Path| {
                files.get(path).cloned().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "missing")
                })
            },
            |name| env.get(name).cloned(),
            || Some(PathBuf::from("/cfg")),
        )
    }

    #[test]
    fn defaults_are_sensible() {
        let c = Config::default();
        assert_eq!(c.server.base_url, "http://localhost:8000");
        assert_eq!(c.server.user_id, "local");
        assert_eq!(c.server.model, None);
        assert_eq!(c.server.timeout_secs, 30);
        assert_eq!(c.sandbox.cooldown_ms, 1_500);
        assert_eq!(c.threads.max_threads, 10);
        assert_eq!(c.threads.state_dir, ".tether");
        assert_eq!(c.log.filter, None);
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let loaded = load_with(&[], &[], None).unwrap();
        assert_eq!(loaded.source, ConfigSource::BuiltInDefaults);
        assert_eq!(loaded.config, Config::default());
    }

    #[test]
    fn parse_partial_toml() {
        let toml = r#"
            [server]
            base_url = "https://agent.example.com"
            model = "gpt-large"

            [sandbox]
            runtime = "python3.13"
        "#;
        let loaded = load_with(&[("tether.toml", toml)], &[], None).unwrap();
        assert_eq!(loaded.source, ConfigSource::Local);
        let c = loaded.config;
        assert_eq!(c.server.base_url, "https://agent.example.com");
        assert_eq!(c.server.model.as_deref(), Some("gpt-large"));
        assert_eq!(c.server.user_id, "local");
        assert_eq!(c.sandbox.runtime.as_deref(), Some("python3.13"));
        assert_eq!(c.sandbox.cooldown_ms, 1_500);
    }

    #[test]
    fn precedence_explicit_over_local_over_global() {
        let files = [
            ("custom.toml", "[server]\nuser_id = \"explicit\"\n"),
            ("tether.toml", "[server]\nuser_id = \"local\"\n"),
            ("/cfg/tether/tether.toml", "[server]\nuser_id = \"global\"\n"),
        ];
        let explicit = load_with(&files, &[], Some("custom.toml")).unwrap();
        assert_eq!(explicit.config.server.user_id, "explicit");

        let local = load_with(&files, &[], None).unwrap();
        assert_eq!(local.config.server.user_id, "local");

        let global = load_with(&files[2..], &[], None).unwrap();
        assert_eq!(global.config.server.user_id, "global");
        assert_eq!(
            global.source,
            ConfigSource::Global(PathBuf::from("/cfg/tether/tether.toml"))
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_with(&[], &[], Some("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let toml = "[server]\nbase_url = \"https://file.example.com\"\n";
        let loaded = load_with(
            &[("tether.toml", toml)],
            &[
                ("TETHER_BASE_URL", "https://env.example.com"),
                ("TETHER_TIMEOUT_SECS", "0"),
                ("TETHER_SANDBOX_COOLDOWN_MS", "250"),
                ("TETHER_STATE_DIR", "/tmp/tether-state"),
                ("TETHER_MODEL", "  "),
            ],
            None,
        )
        .unwrap();
        let c = loaded.config;
        assert_eq!(c.server.base_url, "https://env.example.com");
        assert_eq!(c.server.timeout_secs, 1);
        assert_eq!(c.sandbox.cooldown_ms, 250);
        assert_eq!(c.threads.state_dir, "/tmp/tether-state");
        assert_eq!(c.server.model, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load_with(&[], &[("TETHER_TIMEOUT_SECS", "soon")], None).unwrap_err();
        assert!(err.to_string().contains("TETHER_TIMEOUT_SECS"));

        let err = load_with(&[("tether.toml", "[server]\nbase_url = \"ftp://x\"\n")], &[], None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = load_with(&[("tether.toml", "[threads]\nmax_threads = 0\n")], &[], None)
            .unwrap_err();
        assert!(err.to_string().contains("max_threads"));

        let err = load_with(&[("tether.toml", "[server]\nbogus = 1\n")], &[], None).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
