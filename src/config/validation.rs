//! Backend validation.
//!
//! # Responsibilities
//! - Per backend: the name is usable as a single URL path segment and is
//!   not reserved, and the command is non-empty
//! - Per set: at most one default backend, no name used twice
//!
//! # Design Decisions
//! - A backend that fails its own checks is skipped by the caller; only
//!   set-level collisions are fatal
//! - Set validation returns all errors, not just the first

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::BackendSpec;

/// Path segments a backend name may not take.
pub const RESERVED_NAMES: &[&str] = &["status"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("more than one default backend configured")]
    MultipleDefaults,

    #[error("backend name must not be empty")]
    EmptyName,

    #[error("backend name '{0}' contains characters not allowed in a path segment")]
    InvalidName(String),

    #[error("backend name '{0}' is reserved")]
    ReservedName(String),

    #[error("backend name '{0}' is configured more than once")]
    DuplicateName(String),

    #[error("backend '{0}' has an empty command")]
    EmptyCommand(String),
}

/// Check a single name for use as a route segment.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
    if !valid_chars || name == "." || name == ".." {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(ValidationError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Check one backend on its own.
pub fn validate_spec(spec: &BackendSpec) -> Result<(), ValidationError> {
    if let Some(name) = &spec.name {
        validate_name(name)?;
    }
    if spec.command.trim().is_empty() {
        return Err(ValidationError::EmptyCommand(spec.label().to_string()));
    }
    Ok(())
}

/// Check a backend set for namespace collisions.
pub fn validate_specs(specs: &[BackendSpec]) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut defaults = 0usize;

    for spec in specs {
        match &spec.name {
            None => {
                defaults += 1;
                if defaults == 2 {
                    errors.push(ValidationError::MultipleDefaults);
                }
            }
            Some(name) => {
                if !seen.insert(name.as_str()) {
                    errors.push(ValidationError::DuplicateName(name.clone()));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
