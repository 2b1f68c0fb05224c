#![allow(clippy::result_large_err)]

use super::RuntimeConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration rules
    pub fn validate(config: &RuntimeConfig) -> Result<(), AppError> {
        if config.sandbox.pool_size == 0 {
            return Err(invalid("sandbox.pool_size must be at least 1"));
        }

        if config.sandbox.wall_time_seconds == 0 || config.sandbox.cpu_time_seconds == 0 {
            return Err(invalid("sandbox time limits must be greater than zero"));
        }

        if config.builder.timeout_seconds == 0 {
            return Err(invalid("builder.timeout_seconds must be greater than zero"));
        }

        if config.builder.output_file.trim().is_empty() {
            return Err(invalid("builder.output_file cannot be empty"));
        }

        if config.code.timeout_seconds == 0 {
            return Err(invalid("code.timeout_seconds must be greater than zero"));
        }

        if config.code.runtime_command.trim().is_empty() {
            return Err(invalid("code.runtime_command cannot be empty"));
        }

        if config.run.max_time_seconds == 0 {
            return Err(invalid("run.max_time_seconds must be greater than zero"));
        }

        if config.jobs.concurrency == 0 {
            return Err(invalid("jobs.concurrency must be at least 1"));
        }

        if config.jobs.max_attempts == 0 {
            return Err(invalid("jobs.max_attempts must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("CFG-003")
}
