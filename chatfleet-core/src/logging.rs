use std::sync::Arc;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. The `json` format
/// is meant for log shippers, anything else renders human-readable output.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = normalize_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let writer = open_log_file(config.file_path.as_deref())?;

    if config.format == "json" {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_line_number(true);
        match writer {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    } else {
        let layer = fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .with_target(true)
            .with_line_number(false);
        match writer {
            Some(file) => registry.with(layer.with_ansi(false).with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    }

    Ok(())
}

fn open_log_file(path: Option<&str>) -> anyhow::Result<Option<Arc<std::fs::File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Some(Arc::new(file)))
}

fn normalize_level(level: &str) -> anyhow::Result<String> {
    let lowered = level.to_lowercase();
    match lowered.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(lowered),
        "warning" => Ok("warn".to_string()),
        // Full filter directives such as "chatfleet=debug,redis=warn"
        directive if directive.contains('=') => Ok(level.to_string()),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("info").unwrap(), "info");
        assert_eq!(normalize_level("WARNING").unwrap(), "warn");
        assert!(normalize_level("chatfleet_core=debug,info").is_ok());
        assert!(normalize_level("loud").is_err());
    }
}
