use tracing::Level;

use crate::config::LoggingSettings;

/// Maps a configured level name onto a `tracing::Level`.
///
/// Unknown names fall back to `INFO` rather than failing startup.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Initialize the global `tracing` subscriber.
///
/// Uses `try_init` so tests and embedding applications can call this more
/// than once; only the first call installs a subscriber.
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(default_level))
        .with_target(true)
        .try_init();
}

/// Initialize logging from the `[logging]` configuration section.
pub fn init_from_settings(settings: &LoggingSettings) {
    init(&settings.level);
}
