//! Registry interface
//!
//! The registry is the object store that owns contacts, AORs, endpoints and
//! contact status records. The qualification engine only needs the narrow
//! set of operations defined by [`Registry`]: whole-record retrieval and
//! writes, field-predicate queries and a change-notification stream.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{Aor, Contact, ContactStatus, Endpoint};

pub mod memory;

pub use memory::MemoryRegistry;

/// Errors reported by a registry backend
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Change notification for an object kind the engine observes
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    ContactCreated(Arc<Contact>),
    ContactUpdated(Arc<Contact>),
    ContactDeleted(Arc<Contact>),
    AorCreated(Arc<Aor>),
    AorUpdated(Arc<Aor>),
    AorDeleted(Arc<Aor>),
}

/// A single field condition of a registry query
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPredicate {
    Eq(String, String),
    NotEq(String, String),
    Gt(String, String),
    Le(String, String),
    /// SQL style pattern where `%` matches any run of characters
    Like(String, String),
}

impl FieldPredicate {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        FieldPredicate::Eq(field.to_string(), value.into())
    }

    pub fn not_eq(field: &str, value: impl Into<String>) -> Self {
        FieldPredicate::NotEq(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<String>) -> Self {
        FieldPredicate::Gt(field.to_string(), value.into())
    }

    pub fn le(field: &str, value: impl Into<String>) -> Self {
        FieldPredicate::Le(field.to_string(), value.into())
    }

    pub fn like(field: &str, pattern: impl Into<String>) -> Self {
        FieldPredicate::Like(field.to_string(), pattern.into())
    }

    fn field(&self) -> &str {
        match self {
            FieldPredicate::Eq(field, _)
            | FieldPredicate::NotEq(field, _)
            | FieldPredicate::Gt(field, _)
            | FieldPredicate::Le(field, _)
            | FieldPredicate::Like(field, _) => field,
        }
    }

    /// Evaluate the predicate against an object; unknown fields never match
    pub fn matches(&self, object: &dyn FieldSource) -> bool {
        let Some(actual) = object.field(self.field()) else {
            return false;
        };

        match self {
            FieldPredicate::Eq(_, expected) => actual == *expected,
            FieldPredicate::NotEq(_, expected) => actual != *expected,
            FieldPredicate::Gt(_, expected) => compare_values(&actual, expected) == Ordering::Greater,
            FieldPredicate::Le(_, expected) => compare_values(&actual, expected) != Ordering::Greater,
            FieldPredicate::Like(_, pattern) => like_match(&actual, pattern),
        }
    }
}

/// True when every predicate matches
pub fn matches_all(object: &dyn FieldSource, predicates: &[FieldPredicate]) -> bool {
    predicates.iter().all(|predicate| predicate.matches(object))
}

/// Numeric comparison when both sides parse as numbers, lexical otherwise
fn compare_values(actual: &str, expected: &str) -> Ordering {
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

fn like_match(value: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    let Some(mut rest) = value.strip_prefix(first) else {
        return false;
    };

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}

/// Field access used to evaluate query predicates
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<String>;
}

impl FieldSource for Contact {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "uri" => Some(self.uri.clone()),
            "aor" => Some(self.aor.clone()),
            "qualify_frequency" => Some(self.qualify_frequency.to_string()),
            "qualify_timeout" => Some(self.qualify_timeout.to_string()),
            "authenticate_qualify" => Some(self.authenticate_qualify.to_string()),
            "outbound_proxy" => Some(self.outbound_proxy.clone().unwrap_or_default()),
            "endpoint" => Some(self.endpoint_name.clone().unwrap_or_default()),
            "expiration_time" => Some(
                self.expiration_time
                    .map(|expiration| expiration.timestamp())
                    .unwrap_or(0)
                    .to_string(),
            ),
            "user_agent" => Some(self.user_agent.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

impl FieldSource for Aor {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "qualify_frequency" => Some(self.qualify_frequency.to_string()),
            "qualify_timeout" => Some(self.qualify_timeout.to_string()),
            "authenticate_qualify" => Some(self.authenticate_qualify.to_string()),
            "contact" => Some(self.permanent_contacts.join(",")),
            _ => None,
        }
    }
}

impl FieldSource for Endpoint {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "context" => Some(self.context.clone()),
            "aors" => Some(self.aors.clone()),
            _ => None,
        }
    }
}

/// Object store consumed by the qualification engine.
///
/// Status records are read and written whole; the backend is responsible
/// for its own internal concurrency control.
///
/// A contact record may carry its own qualify policy. Records with a
/// `qualify_frequency` of 0 are qualified with the policy of their AOR.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn retrieve_contact(&self, id: &str) -> RegistryResult<Option<Arc<Contact>>>;

    async fn retrieve_aor(&self, id: &str) -> RegistryResult<Option<Arc<Aor>>>;

    async fn retrieve_endpoint(&self, id: &str) -> RegistryResult<Option<Arc<Endpoint>>>;

    async fn retrieve_contact_status(&self, id: &str) -> RegistryResult<Option<ContactStatus>>;

    async fn create_contact_status(&self, status: ContactStatus) -> RegistryResult<()>;

    async fn update_contact_status(&self, status: ContactStatus) -> RegistryResult<()>;

    async fn delete_contact_status(&self, id: &str) -> RegistryResult<()>;

    async fn query_aors(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Aor>>>;

    async fn query_contacts(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Contact>>>;

    async fn query_endpoints(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Endpoint>>>;

    /// All contacts belonging to an AOR
    async fn aor_contacts(&self, aor: &Aor) -> RegistryResult<Vec<Arc<Contact>>>;

    /// Mark a persistent endpoint as online
    async fn set_endpoint_online(&self, endpoint: &str) -> RegistryResult<()>;

    /// Subscribe to contact and AOR change notifications
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}
