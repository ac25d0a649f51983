//! Log output for the CLI: human-readable or JSON lines on stderr.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! ChefQuest crates and HTTP internals stay at `warn`.

use chefquest_core::types::LoggingConfig;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(&config.level, std::env::var("RUST_LOG").is_ok());
        if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    });
}

fn build_filter(level: &str, rust_log_set: bool) -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    if rust_log_set {
        return filter;
    }
    let level = parse_level(level);
    ["chefquest", "chefquest_core"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(["h2=warn", "hyper=warn", "reqwest=warn"].map(String::from))
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(filter, |filter, directive| filter.add_directive(directive))
}

pub fn parse_level(raw: &str) -> Level {
    match raw.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}
