use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let compiled =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
            message: format!("Failed to compile JSON schema: {}", e),
        })?;

    let error_messages: Vec<String> = compiled
        .iter_errors(json_value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    // Quarantine must never exceed block, otherwise messages that should
    // be held for review would sail through as clean.
    if config.workflow.quarantine_threshold > config.workflow.block_threshold {
        return Err(ConfigError::Validation {
            message: format!(
                "quarantine_threshold ({}) must not exceed block_threshold ({})",
                config.workflow.quarantine_threshold, config.workflow.block_threshold
            ),
        });
    }

    if config.workflow.minimum_confidence > 100 {
        return Err(ConfigError::Validation {
            message: "minimum_confidence must be between 0 and 100".to_string(),
        });
    }

    if config.queue.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "queue.max_attempts must be at least 1".to_string(),
        });
    }

    if config.queue.base_retry_delay_secs > config.queue.max_retry_delay_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "queue.base_retry_delay_secs ({}) must not exceed max_retry_delay_secs ({})",
                config.queue.base_retry_delay_secs, config.queue.max_retry_delay_secs
            ),
        });
    }

    for pattern in &config.parser.ticket_patterns {
        validate_capture_pattern("ticket_patterns", pattern)?;
    }

    for field in &config.parser.custom_fields {
        validate_capture_pattern(&field.name, &field.pattern)?;
    }

    for pattern in config
        .security
        .suspicious_patterns
        .iter()
        .chain(&config.security.suspicious_subject_patterns)
        .chain(&config.security.malicious_url_patterns)
    {
        if let Err(e) = regex::Regex::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                name: "security".to_string(),
                reason: format!("'{}': {}", pattern, e),
            });
        }
    }

    let mut rule_ids = std::collections::HashSet::new();
    for rule in &config.mapping.rules {
        if !rule_ids.insert(&rule.id) {
            return Err(ConfigError::InvalidRule {
                id: rule.id.clone(),
                reason: "Duplicate rule ID".to_string(),
            });
        }

        if rule.condition.field_count() != 1 {
            return Err(ConfigError::InvalidRule {
                id: rule.id.clone(),
                reason: "Exactly one match field must be set".to_string(),
            });
        }
    }

    Ok(())
}

/// Compiles a pattern and requires at least one capture group.
fn validate_capture_pattern(name: &str, pattern: &str) -> Result<(), ConfigError> {
    let compiled = regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    if compiled.captures_len() < 2 {
        return Err(ConfigError::InvalidPattern {
            name: name.to_string(),
            reason: "Pattern must contain a capture group".to_string(),
        });
    }

    Ok(())
}
