//! Error handling.

use std::error::Error as StdError;

use displaydoc::Display;

pub type FerryResult<T> = Result<T, FerryError>;

/// An error.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum FerryError {
    /// Invalid relation name "{name}"
    InvalidRelationName { name: String },

    /// Invalid portable type "{name}"
    InvalidPortableType { name: String },

    /// Invalid {kind} status code {code}
    InvalidStatusCode { kind: &'static str, code: i16 },

    /// Cannot {event} a {machine} that is {from}
    InvalidTransition {
        machine: &'static str,
        from: &'static str,
        event: &'static str,
    },
}

impl FerryError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRelationName { .. } => "InvalidRelationName",
            Self::InvalidPortableType { .. } => "InvalidPortableType",
            Self::InvalidStatusCode { .. } => "InvalidStatusCode",
            Self::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}

impl StdError for FerryError {}
