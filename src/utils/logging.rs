/// Installs the global `tracing` subscriber.
///
/// `level` comes from `log.level` (`NT4__LOG__LEVEL` in the environment).
/// Unknown names fall back to `info`.
pub fn init(level: &str) {
    let max_level = match level.trim().to_ascii_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    // try_init: the binary and every test may call this
    let _ = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .try_init();
}
