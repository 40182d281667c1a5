use std::{env, str::FromStr};

use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_DIRECTIVE: &str = "info";

pub fn configure_logging() -> Result<(), anyhow::Error> {
    configure_logging_with_default(DEFAULT_LOG_DIRECTIVE)
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_directive`,
/// and `LOG_FORMAT=json` switches to structured output.
pub fn configure_logging_with_default(default_directive: &str) -> Result<(), anyhow::Error> {
    let directive = env::var("RUST_LOG").unwrap_or_else(|_| default_directive.to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_str(directive.as_str())?)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stdout);

    let subscriber = if env::var("LOG_FORMAT").unwrap_or("text".to_string()) == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if let Err(e) = subscriber {
        warn!(
            "Failed to initialize logging, potentially because we have initialized logging already: {}",
            e
        );
    }

    Ok(())
}
