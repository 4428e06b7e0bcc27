use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber. `RUST_LOG` wins over the verbose switch.
pub fn init(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
    let default = if enabled { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if enabled {
        info("verbose logging enabled");
    }
}

pub fn verbose_enabled() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
}

pub fn stage(stage: &str, message: impl AsRef<str>) {
    tracing::info!(stage, "{}", message.as_ref());
}

pub fn verbose(message: impl AsRef<str>) {
    if verbose_enabled() {
        tracing::debug!("{}", message.as_ref());
    }
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_truthy_flags() {
        for raw in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(raw), "{raw}");
        }
        for raw in ["", "0", "off", "nope"] {
            assert!(!parse_bool(raw), "{raw}");
        }
    }
}
