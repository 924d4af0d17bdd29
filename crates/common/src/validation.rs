//! Input validation for values that arrive from operators or callers.

use anyhow::{anyhow, Result};

/// Maximum length for record ids (face, cluster, identity, camera)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for identity names
pub const MAX_NAME_LENGTH: usize = 512;

/// Maximum length for identity descriptions
pub const MAX_DESCRIPTION_LENGTH: usize = 4096;

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate a record id or a cache source key (camera id)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.chars().any(|c| c.is_control()) {
        return Err(anyhow!("{} contains control characters", field_name));
    }

    Ok(())
}

pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_NAME_LENGTH, field_name)?;
    Ok(())
}

pub fn validate_description(description: Option<&str>) -> Result<()> {
    match description {
        Some(d) => validate_length(d, MAX_DESCRIPTION_LENGTH, "description"),
        None => Ok(()),
    }
}

/// Validate value is within an inclusive range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    // written so NaN fails too
    if !(value >= min && value <= max) {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

pub fn validate_positive_millis(ms: u64, field_name: &str) -> Result<()> {
    if ms == 0 {
        return Err(anyhow!("{} must be greater than 0", field_name));
    }
    Ok(())
}
