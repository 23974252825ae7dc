/// Environment prefix for crate-scoped settings.
const ENV_PREFIX: &str = "BREAKWATER_";

/// Look up a configuration value from the environment.
///
/// A `BREAKWATER_`-prefixed variable wins over the bare name, so
/// deployments can scope settings to this crate without renaming variables
/// shared with other services.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .or_else(|_| std::env::var(key))
        .ok()
}
