use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_ONCE: Once = Once::new();
static ENV_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

/// Level requested through `DOT_EXPORTER_LOG`/`RUST_LOG`, resolved once per process.
pub fn env_level() -> LevelFilter {
    *ENV_LEVEL.get_or_init(|| {
        std::env::var("DOT_EXPORTER_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .as_deref()
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Info)
    })
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize the stderr logger based on `DOT_EXPORTER_LOG`/`RUST_LOG`.
///
/// Safe to call multiple times; the logger is installed on first call. Stdout
/// stays reserved for the event stream.
pub fn init_logging() {
    init_logging_at(None);
}

/// Like [`init_logging`], with an explicit level taking precedence over the
/// environment. Returns the level in effect.
pub fn init_logging_at(level: Option<&str>) -> LevelFilter {
    let lvl = parse_level(level).unwrap_or_else(env_level);
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(lvl));
        let mut builder = env_logger::Builder::from_env(env);
        if level.is_some() {
            builder.filter_level(lvl);
        }
        let _ = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .target(env_logger::Target::Stderr)
            .try_init();
    });
    log::set_max_level(lvl);
    lvl
}
