use crate::settings::LogSettings;

/// Installs the process-wide logger. `RUST_LOG` wins over `[log] level`.
#[cfg(feature = "observability")]
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if settings.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(not(feature = "observability"))]
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.level.as_str()))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_installs_once_per_process() {
        let settings = LogSettings::default();
        // another test may have installed it first
        let _ = init_logging(&settings);
        assert!(init_logging(&settings).is_err());
    }
}
