//! `TETHER_*` environment overrides.

use crate::error::ConfigError;

use super::Config;

pub(super) fn apply_env_overrides<FEnv>(
    config: &mut Config,
    env_lookup: &FEnv,
) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(url) = non_empty(env_lookup, "TETHER_BASE_URL") {
        config.server.base_url = url;
    }
    if let Some(user_id) = non_empty(env_lookup, "TETHER_USER_ID") {
        config.server.user_id = user_id;
    }
    if let Some(model) = non_empty(env_lookup, "TETHER_MODEL") {
        config.server.model = Some(model);
    }
    if let Some(timeout) = non_empty(env_lookup, "TETHER_TIMEOUT_SECS") {
        // Clamp to at least 1 second.
        config.server.timeout_secs = parse_u64("TETHER_TIMEOUT_SECS", &timeout)?.max(1);
    }
    if let Some(dir) = non_empty(env_lookup, "TETHER_STATE_DIR") {
        config.threads.state_dir = dir;
    }
    if let Some(cooldown) = non_empty(env_lookup, "TETHER_SANDBOX_COOLDOWN_MS") {
        config.sandbox.cooldown_ms = parse_u64("TETHER_SANDBOX_COOLDOWN_MS", &cooldown)?;
    }
    Ok(())
}

fn non_empty<FEnv>(env_lookup: &FEnv, name: &str) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    env_lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "invalid {name} value `{value}`: expected a non-negative integer"
        ))
    })
}
