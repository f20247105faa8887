//! Tracing subscriber setup for hosts embedding the call manager
//!
//! The audio orchestrator and the admission policy are the chatty parts of
//! the crate, so each can be given its own level on top of the base one.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{CallManagerError, CallManagerResult};

/// Log target of the audio state machines and their orchestrator
pub const AUDIO_TARGET: &str = "rvoip_call_manager_core::audio";

/// Log target of the admission policy and the request process
pub const ADMISSION_TARGET: &str = "rvoip_call_manager_core::admission";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base level for everything
    pub level: Level,
    /// Overrides `level` for [`AUDIO_TARGET`]
    pub audio_level: Option<Level>,
    /// Overrides `level` for [`ADMISSION_TARGET`]
    pub admission_level: Option<Level>,
    pub json: bool,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            audio_level: None,
            admission_level: None,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }

    /// Trace call-state and device transitions without raising the base level
    pub fn with_audio_level(mut self, level: Level) -> Self {
        self.audio_level = Some(level);
        self
    }

    pub fn with_admission_level(mut self, level: Level) -> Self {
        self.admission_level = Some(level);
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Filter directives, base level first
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![level_name(self.level)];
        for (target, level) in [(AUDIO_TARGET, self.audio_level), (ADMISSION_TARGET, self.admission_level)] {
            if let Some(level) = level {
                directives.push(format!("{}={}", target, level_name(level)));
            }
        }
        directives
    }

    /// `RUST_LOG` with the configured directives added on top
    pub fn env_filter(&self) -> CallManagerResult<EnvFilter> {
        self.directives()
            .into_iter()
            .try_fold(EnvFilter::from_default_env(), |filter, directive| {
                let parsed = Directive::from_str(&directive).map_err(|e| {
                    CallManagerError::config(format!("bad log directive {}: {}", directive, e))
                })?;
                Ok(filter.add_directive(parsed))
            })
    }
}

fn level_name(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> CallManagerResult<()> {
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(config.env_filter()?)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let result = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };

    result.map_err(|e| CallManagerError::config(format!("logging setup failed: {}", e)))
}

/// Parse a level name such as `debug` or `WARN`
pub fn parse_log_level(level: &str) -> CallManagerResult<Level> {
    Level::from_str(level).map_err(|_| CallManagerError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_module_levels_become_directives() {
        let config = LoggingConfig::new(Level::WARN).with_audio_level(Level::TRACE);
        assert_eq!(
            config.directives(),
            vec!["warn".to_string(), "rvoip_call_manager_core::audio=trace".to_string()]
        );

        let config = config.with_admission_level(Level::DEBUG);
        assert_eq!(config.directives().len(), 3);
        assert_eq!(config.directives()[2], "rvoip_call_manager_core::admission=debug");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_default_is_info_only() {
        let config = LoggingConfig::default();
        assert_eq!(config.directives(), vec!["info".to_string()]);
        assert!(!config.json);
    }

    #[test]
    #[serial]
    fn test_second_setup_fails() {
        let config = LoggingConfig::default().with_file_info();
        // Another test may have installed one already; the second call must fail either way.
        let _ = setup_logging(&config);
        assert!(setup_logging(&config).is_err());
    }
}
