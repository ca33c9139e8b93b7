use toml::{Table, Value};

use super::defaults;
use crate::core::errors::BrainError;

pub fn validate_config(config: &Table) -> Result<(), BrainError> {
    validate_optional_string_field(config, "secret", "secret")?;

    if let Some(brain) = expect_optional_table(config, "brain")? {
        validate_enum_field(brain, "brain.backend", "backend", &["kv", "sql"])?;
        validate_non_empty_string_field(brain, "brain.path", "path")?;
        validate_integer_field(brain, "brain.order", "order", 1, defaults::MAX_ORDER)?;
        validate_enum_field(
            brain,
            "brain.canon",
            "canon",
            &["identity", "lowercase", "folded"],
        )?;
    }

    if let Some(speak) = expect_optional_table(config, "speak")? {
        validate_integer_field(
            speak,
            "speak.max_steps",
            "max_steps",
            1,
            defaults::MAX_STEPS_LIMIT,
        )?;
        validate_integer_field(
            speak,
            "speak.max_chars",
            "max_chars",
            1,
            defaults::MAX_CHARS_LIMIT,
        )?;
    }

    if let Some(log) = expect_optional_table(config, "log")? {
        validate_enum_field(
            log,
            "log.level",
            "level",
            &["trace", "debug", "info", "warn", "error"],
        )?;
        validate_enum_field(log, "log.format", "format", &["text", "json"])?;
        validate_non_empty_string_field(log, "log.dir", "dir")?;
    }

    Ok(())
}

fn expect_optional_table<'a>(root: &'a Table, key: &str) -> Result<Option<&'a Table>, BrainError> {
    match root.get(key) {
        Some(Value::Table(table)) => Ok(Some(table)),
        Some(_) => Err(config_type_error(key, "table")),
        None => Ok(None),
    }
}

fn validate_integer_field(
    section: &Table,
    path: &str,
    key: &str,
    min: i64,
    max: i64,
) -> Result<(), BrainError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_integer() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(BrainError::Config(format!(
            "invalid value at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_enum_field(
    section: &Table,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), BrainError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if !allowed.contains(&text) {
        return Err(BrainError::Config(format!(
            "invalid value at '{}': expected one of {}",
            path,
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn validate_optional_string_field(section: &Table, path: &str, key: &str) -> Result<(), BrainError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_str().is_none() {
        return Err(config_type_error(path, "string"));
    }
    Ok(())
}

fn validate_non_empty_string_field(
    section: &Table,
    path: &str,
    key: &str,
) -> Result<(), BrainError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if text.trim().is_empty() {
        return Err(BrainError::Config(format!(
            "invalid value at '{}': value cannot be empty",
            path
        )));
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> BrainError {
    BrainError::Config(format!("invalid value at '{}': expected {}", path, expected))
}
