use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable holding `EnvFilter` directives for the cache's logs.
pub const LOG_ENV_VAR: &str = "COMPCACHE_LOG";

static TRACING_INIT: Once = Once::new();

/// Builds the filter from `directives`, accepting bare levels (`debug`) as well as full
/// directive strings (`compcache=debug,warn`). Invalid input falls back to `warn`.
pub fn env_filter(directives: Option<&str>) -> tracing_subscriber::EnvFilter {
    let fallback = || {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
    };
    match directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directives) => {
            let directives = match directives.to_ascii_lowercase().as_str() {
                "warning" => "warn".to_owned(),
                _ => directives.to_owned(),
            };
            tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| fallback())
        }
        None => fallback(),
    }
}

/// Installs a stderr fmt subscriber filtered by `COMPCACHE_LOG`.
///
/// Compiler stdout is part of the cached result, so logs never go there. Safe to call more
/// than once; only the first call (and only if no other global subscriber exists) installs.
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        let filter = env_filter(std::env::var(LOG_ENV_VAR).ok().as_deref());
        let fmt = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_ansi(false);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_levels_and_directives() {
        use tracing_subscriber::filter::LevelFilter;

        let level = |directives| env_filter(directives).max_level_hint();
        assert_eq!(level(Some("debug")), Some(LevelFilter::DEBUG));
        assert_eq!(level(Some("WARNING")), Some(LevelFilter::WARN));
        assert_eq!(level(Some("compcache=trace")), Some(LevelFilter::TRACE));
        assert_eq!(level(None), Some(LevelFilter::WARN));
    }

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        tracing::warn!(target = "compcache", "logging initialized twice");
    }
}
