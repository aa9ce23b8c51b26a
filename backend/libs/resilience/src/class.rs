//! Error classification used to drive retry decisions and dead-letter triage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of a failed operation.
///
/// Transient and Unknown errors are retried up to the policy limit. Permanent,
/// Validation and Schema errors fail fast; the last three are kept apart so
/// operators can triage dead-lettered events by cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Network blip, lock contention, temporarily unavailable dependency
    Transient,
    /// Malformed payload, constraint violation
    Permanent,
    /// Event failed validation rules of the destination
    Validation,
    /// Event does not match the destination schema
    Schema,
    /// Not classified by the caller
    Unknown,
}

impl ErrorClass {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Validation => "validation",
            ErrorClass::Schema => "schema",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient" => Ok(ErrorClass::Transient),
            "permanent" => Ok(ErrorClass::Permanent),
            "validation" => Ok(ErrorClass::Validation),
            "schema" => Ok(ErrorClass::Schema),
            "unknown" => Ok(ErrorClass::Unknown),
            other => Err(format!("Unknown error class: {}", other)),
        }
    }
}
