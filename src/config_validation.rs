//! Startup validation of the engine configuration.

use crate::config::Config;
use crate::error::ProxyError;

/// Ports at or below this value are refused.
pub const MIN_LISTEN_PORT_EXCLUSIVE: u16 = 1024;

const MIN_HEADER_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }

    /// Collapse into a `ProxyError::Config` listing every error.
    pub fn into_result(self) -> Result<Self, ProxyError> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(ProxyError::Config(self.errors.join("; ")))
        }
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();

        self.validate_listen_address(&mut result);
        self.validate_workers(&mut result);
        self.validate_buffers(&mut result);
        self.validate_timeouts(&mut result);

        result
    }

    fn validate_listen_address(&self, result: &mut ValidationResult) {
        let addr = self.config.listen_addr;

        if addr.port() <= MIN_LISTEN_PORT_EXCLUSIVE {
            result.add_error(format!(
                "Port must be > {} (got {})",
                MIN_LISTEN_PORT_EXCLUSIVE,
                addr.port()
            ));
        }

        if addr.ip().is_unspecified() {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes the proxy to external networks",
                addr.ip()
            ));
            result.add_suggestion(
                "Consider binding the proxy to an internal interface only".to_string(),
            );
        }

        if self.config.listen_backlog == 0 {
            result.add_error("Listen backlog must be at least 1".to_string());
        }
    }

    fn validate_workers(&self, result: &mut ValidationResult) {
        match self.config.worker_threads {
            0 => result.add_error("At least one worker is required".to_string()),
            n if n > 64 => result.add_warning(format!(
                "{} workers is far more than needed; each worker multiplexes many connections",
                n
            )),
            _ => {}
        }
    }

    fn validate_buffers(&self, result: &mut ValidationResult) {
        if self.config.max_header_size < MIN_HEADER_SIZE {
            result.add_error(format!(
                "max_header_size must be at least {} bytes (got {})",
                MIN_HEADER_SIZE, self.config.max_header_size
            ));
        } else if self.config.max_header_size > 1024 * 1024 {
            result.add_warning(format!(
                "Large max_header_size ({} bytes) lets a single client hold a lot of memory",
                self.config.max_header_size
            ));
        }

        if self.config.relay_buffer_size == 0 {
            result.add_error("relay_buffer_size must be greater than 0".to_string());
        }
    }

    fn validate_timeouts(&self, result: &mut ValidationResult) {
        if self.config.connect_timeout_secs == 0 {
            result.add_error("connect_timeout_secs must be greater than 0".to_string());
        }
        if self.config.request_timeout_secs == 0 {
            result.add_error("request_timeout_secs must be greater than 0".to_string());
        }
        if self.config.request_timeout_secs > 300 {
            result.add_warning(format!(
                "Long request timeout ({}s) lets idle clients tie up a worker",
                self.config.request_timeout_secs
            ));
        }
    }
}
