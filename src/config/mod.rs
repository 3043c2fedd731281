mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    CorrelationSettings, ExecutorSettings, LoggingSettings, RelayEnvironment, RelaySettings,
    Settings,
};

/// Loads the configuration from `config/default` and `CCS_*` environment
/// variables (after reading a `.env` file, if any), merged onto the defaults.
///
/// Nested keys use a double underscore: `CCS_RELAY__SENDER_ID`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    load_config_from("config/default")
}

/// Like `load_config`, reading the file at `path` (extension optional) and
/// without touching `.env`.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("CCS")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
