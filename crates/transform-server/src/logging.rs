//! Logging bootstrap built on `tracing`/`tracing-subscriber`, the direct
//! replacement for the original's per-process `spdlog::set_level` call
//! (`gst-transformer.cpp`). `CallSession` opens its own `request_id`-tagged
//! span per call (spec §4.6 Stage 0); this just configures the global
//! subscriber and its minimum level once at startup.

use tracing_subscriber::EnvFilter;

/// Maps the CLI's `{trace|debug|info|notice|warn|error}` vocabulary onto a
/// `tracing` level. `notice` has no direct `tracing` equivalent; it is
/// folded into `warn`, the closest severity below `error`.
fn normalize_level(level: &str) -> &str {
    match level {
        "notice" => "warn",
        other => other,
    }
}

pub fn init(level: &str) {
    let filter = EnvFilter::try_new(normalize_level(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_notice_to_warn() {
        assert_eq!(normalize_level("notice"), "warn");
        assert_eq!(normalize_level("debug"), "debug");
    }
}
