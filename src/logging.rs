use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// `log` backend writing text or JSON lines to stdout and/or files, each
/// target with its own level filter.
pub struct CustomLogger {
    targets: Vec<LogTarget>,
    default_level: LogLevel,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut writers = Vec::new();
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("File log target requires a path".to_string())
                    })?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            default_level,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Logger already initialized: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Most verbose level any target wants.
    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|t| self.target_filter(t))
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn target_filter(&self, target: &LogTarget) -> LevelFilter {
        target.level.unwrap_or(self.default_level).to_level_filter()
    }

    fn should_log(&self, level: log::Level, target: &LogTarget) -> bool {
        level <= self.target_filter(target)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets.iter().any(|t| self.should_log(metadata.level(), t))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if self.should_log(record.level(), target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

// Used when the config file has no `logging` block
pub fn init_fallback(log_level: Option<LogLevel>, log_format: Option<LogFormat>) {
    let level = log_level.unwrap_or_default().to_string();
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if log_format == Some(LogFormat::Json) {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }

    // A logger may already be installed (tests); keep it.
    let _ = builder.try_init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_log_level_and_format() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
        assert!(parse_log_level("verbose").is_err());
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_file_target_requires_path() {
        let config = LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        };
        assert!(CustomLogger::new(config).is_err());
    }

    #[test]
    fn test_per_target_levels() {
        let dir = tempdir().unwrap();
        let config = LoggingConfig {
            level: Some(LogLevel::Warn),
            format: Some(LogFormat::Json),
            targets: Some(vec![
                LogTarget {
                    output_type: LogOutputType::File,
                    path: Some(dir.path().join("proxy.log")),
                    level: Some(LogLevel::Debug),
                },
                LogTarget {
                    output_type: LogOutputType::Stdout,
                    path: None,
                    level: None,
                },
            ]),
        };
        let logger = CustomLogger::new(config).unwrap();

        assert_eq!(logger.max_level(), LevelFilter::Debug);
        assert!(logger.should_log(log::Level::Debug, &logger.targets[0]));
        assert!(!logger.should_log(log::Level::Info, &logger.targets[1]));
        assert!(logger.should_log(log::Level::Error, &logger.targets[1]));
    }

    #[test]
    fn test_file_target_writes_json_lines() {
        use log::Log;

        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let config = LoggingConfig {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Json),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: Some(path.clone()),
                level: None,
            }]),
        };
        let logger = CustomLogger::new(config).unwrap();

        logger.log(
            &Record::builder()
                .args(format_args!("conn-7: retired"))
                .level(log::Level::Info)
                .target("forward_relay::worker")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("dropped"))
                .level(log::Level::Debug)
                .target("forward_relay::worker")
                .build(),
        );
        logger.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry["level"], "info");
        assert_eq!(entry["message"], "conn-7: retired");
    }
}
