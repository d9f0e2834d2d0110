//! Validation helpers for configuration values.
use std::ops::RangeInclusive;
use std::time::Duration;

/// Log levels accepted in configuration.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validates if a given string is a valid file path.
///
/// # Arguments
///
/// * `path` - The string to validate.
///
/// # Returns
///
/// * `Ok(())` if the file path is valid.
/// * `Err(&'static str)` if the file path is invalid.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is not empty (ignoring surrounding whitespace).
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.trim().is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}

/// Validates a log level name (case-insensitive).
pub fn is_valid_log_level(level: &str) -> Result<(), &'static str> {
    if LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err("Log level must be one of: trace, debug, info, warn, error")
    }
}

/// Validates that a duration is strictly positive.
pub fn is_positive_duration(value: Duration) -> Result<(), &'static str> {
    if value.is_zero() {
        Err("Duration must be greater than zero")
    } else {
        Ok(())
    }
}

/// Validates a `(lower, upper)` pair: both finite and `lower < upper`.
pub fn is_ordered_bounds(lower: f64, upper: f64) -> Result<(), &'static str> {
    if !lower.is_finite() || !upper.is_finite() {
        return Err("Bounds must be finite numbers");
    }
    if lower < upper {
        Ok(())
    } else {
        Err("Lower bound must be below upper bound")
    }
}
