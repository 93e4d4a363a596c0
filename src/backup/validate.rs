//! Validation functions for configuration values.
//!
//! Hooked into `#[validate(custom(function = ...))]` attributes on the
//! configuration structs. Job names are checked by the job registry.

use validator::ValidationError;

use std::path::Path;

/// Job identifiers end up in file names and log lines, so they are kept to
/// `[A-Za-z0-9_]+`.
pub fn is_valid_job_name<S: AsRef<str>>(name: S) -> bool {
    let name = name.as_ref();
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_not_blank<S: AsRef<str>>(value: S) -> Result<(), ValidationError> {
    if value.as_ref().trim().is_empty() {
        return Err(ValidationError::new("Blank").with_message("value must not be blank".into()));
    }

    Ok(())
}

/// A directory that is missing is fine, it is created when the run starts
/// (and left alone by a dry run). Something else at that path is not.
pub fn validate_dir_if_exists<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() && !dir.is_dir() {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} is not a directory", dir).into()));
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_if_exists(dir)?;
    if !dir.exists() {
        return Ok(());
    }
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}
