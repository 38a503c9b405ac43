//! Error types for qualify-core

use thiserror::Error;

use crate::registry::RegistryError;
use crate::stack::StackError;

/// Errors raised by the qualification engine
#[derive(Debug, Error)]
pub enum QualifyError {
    /// No endpoint could be resolved for a contact; the contact is treated as orphaned
    #[error("Unable to find an endpoint to qualify contact {0}")]
    EndpointNotFound(String),

    /// A management request named an endpoint the registry does not know
    #[error("Unable to retrieve endpoint {0}")]
    UnknownEndpoint(String),

    #[error("No AoRs configured for endpoint {0}")]
    NoAorsConfigured(String),

    /// Contact ids must carry an AOR prefix delimited by ";@" or "@@"
    #[error("Invalid contact id: {0}")]
    InvalidContactId(String),

    #[error("No contact status for contact {0}")]
    StatusNotFound(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("SIP stack error: {0}")]
    Stack(#[from] StackError),

    #[error("Task queue error: {0}")]
    TaskQueue(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, QualifyError>;

impl From<config::ConfigError> for QualifyError {
    fn from(err: config::ConfigError) -> Self {
        QualifyError::Config(err.to_string())
    }
}
