use std::sync::Once;

use log::LevelFilter;

/// Variable consulted when no explicit filter is configured.
pub const FILTER_ENV: &str = "RUST_LOG";

/// GPU stack modules that log adapter probing and validation chatter.
const GPU_STACK: [&str; 3] = ["wgpu_core", "wgpu_hal", "naga"];

/// Logger configuration.
///
/// Filter precedence: `env_filter`, then [`FILTER_ENV`], then `level` with
/// the GPU stack capped at `gpu_level`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `env_logger` filter syntax (e.g. "info,vellum_engine=debug").
    pub env_filter: Option<String>,
    pub level: LevelFilter,
    pub gpu_level: LevelFilter,
    pub write_style: env_logger::WriteStyle,
    /// Millisecond timestamps; useful when timing backend switches.
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            env_filter: None,
            level: LevelFilter::Info,
            gpu_level: LevelFilter::Warn,
            write_style: env_logger::WriteStyle::Auto,
            timestamps: false,
        }
    }
}

impl LoggingConfig {
    /// Debug output for this crate, with timestamps.
    pub fn verbose() -> Self {
        Self {
            env_filter: Some(format!("info,{}=debug", env!("CARGO_CRATE_NAME"))),
            timestamps: true,
            ..Self::default()
        }
    }

    fn builder(&self) -> env_logger::Builder {
        let mut builder = env_logger::Builder::new();

        let from_env = std::env::var(FILTER_ENV).ok();
        match self.env_filter.as_deref().or(from_env.as_deref()) {
            Some(filter) => {
                builder.parse_filters(filter);
            }
            None => {
                builder.filter_level(self.level);
                for module in GPU_STACK {
                    builder.filter_module(module, self.gpu_level.min(self.level));
                }
            }
        }

        builder.write_style(self.write_style);
        if self.timestamps {
            builder.format_timestamp_millis();
        } else {
            builder.format_timestamp(None);
        }
        builder
    }
}

static INIT: Once = Once::new();

/// Installs `env_logger` as the global logger.
///
/// Only the first call has an effect. Call it early in `main`, before the
/// runtime opens a backend.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        if let Err(e) = config.builder().try_init() {
            eprintln!("logger already installed: {e}");
            return;
        }
        log::debug!("logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_stack_never_logs_louder_than_the_base_level() {
        let config = LoggingConfig {
            level: LevelFilter::Error,
            gpu_level: LevelFilter::Debug,
            ..LoggingConfig::default()
        };
        assert_eq!(config.gpu_level.min(config.level), LevelFilter::Error);
    }

    #[test]
    fn verbose_targets_this_crate() {
        let filter = LoggingConfig::verbose().env_filter.unwrap();
        assert!(filter.ends_with("vellum_engine=debug"));
    }

    #[test]
    fn repeated_init_is_ignored() {
        init_logging(LoggingConfig::default());
        init_logging(LoggingConfig::verbose());
        log::info!("still one logger");
    }
}
