//! Merge rules: defaults first, files next, environment last.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("storage.backend", "sled")?
        .set_default("logging.level", "info")
}

/// Environment overrides, e.g. `COURSEGEN__ENGINE__MAX_ATTEMPTS=5`.
pub fn with_env_overrides(
    builder: ConfigBuilder<DefaultState>,
) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix("COURSEGEN")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}
