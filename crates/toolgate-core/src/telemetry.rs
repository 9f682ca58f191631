//! Centralised tracing initialisation for processes embedding toolgate.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Later calls
//! are ignored because the global subscriber can only be set once.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` emits newline-delimited JSON, one object per event.
/// * `level` is the default verbosity when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .ok();
    }
}

/// Pick a level from the config's debug flag.
pub fn level_for(debug: bool) -> Level {
    if debug {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }

    #[test]
    fn debug_flag_selects_level() {
        assert_eq!(level_for(true), Level::DEBUG);
        assert_eq!(level_for(false), Level::INFO);
    }
}
