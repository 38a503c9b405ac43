//! Core types for qualify-core

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QualifyError, Result};

/// Delimiter between the AOR and the sequence of a dynamic (registered) contact id
pub const DYNAMIC_CONTACT_DELIMITER: &str = ";@";

/// Delimiter between the AOR and the sequence of a static (configured) contact id
pub const STATIC_CONTACT_DELIMITER: &str = "@@";

/// Reachability of a contact as derived from its qualify results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    /// Status record exists but the contact was never qualified
    Created,
    /// Qualify disabled or result indeterminate
    Unknown,
    /// Last probe was answered
    Available,
    /// Last probe timed out or failed
    Unavailable,
    /// Record is being torn down
    Removed,
}

impl ReachabilityState {
    /// Display label used by management and dialplan consumers
    pub fn label(&self) -> &'static str {
        match self {
            ReachabilityState::Unavailable => "Unreachable",
            ReachabilityState::Available => "Reachable",
            ReachabilityState::Unknown => "Unknown",
            ReachabilityState::Created => "Created",
            ReachabilityState::Removed => "Removed",
        }
    }

    /// Abbreviated label for tabular output
    pub fn short_label(&self) -> &'static str {
        match self {
            ReachabilityState::Unavailable => "Unavail",
            ReachabilityState::Available => "Avail",
            ReachabilityState::Unknown => "Unknown",
            ReachabilityState::Created => "Created",
            ReachabilityState::Removed => "Removed",
        }
    }
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Display string for a contact status
pub fn contact_status_label(status: ReachabilityState) -> &'static str {
    status.label()
}

/// Abbreviated display string for a contact status
pub fn contact_short_status_label(status: ReachabilityState) -> &'static str {
    status.short_label()
}

/// A registered or statically configured contact of an AOR.
///
/// Contacts are owned by the registry. The engine only ever reads them and
/// shares them as `Arc<Contact>` between schedule entries and in-flight probes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub uri: String,
    pub aor: String,
    /// Seconds between qualify probes, 0 disables qualification
    pub qualify_frequency: u32,
    /// Seconds to wait for a probe response
    pub qualify_timeout: f64,
    pub authenticate_qualify: bool,
    pub outbound_proxy: Option<String>,
    pub endpoint_name: Option<String>,
    /// `None` for permanent contacts
    pub expiration_time: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub via_addr: Option<String>,
    pub via_port: u16,
    pub call_id: Option<String>,
    pub path: Option<String>,
}

impl Contact {
    /// Create a contact with qualification disabled
    pub fn new(id: impl Into<String>, aor: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aor: aor.into(),
            uri: uri.into(),
            qualify_timeout: 3.0,
            ..Default::default()
        }
    }

    /// Set the qualify interval and timeout
    pub fn with_qualify(mut self, frequency: u32, timeout: f64) -> Self {
        self.qualify_frequency = frequency;
        self.qualify_timeout = timeout;
        self
    }

    /// Bind the contact to a named endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_name = Some(endpoint.into());
        self
    }

    /// Set the registration expiration, making the contact non-permanent
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration_time = Some(expiration);
        self
    }

    /// Whether the contact was configured rather than registered
    pub fn is_permanent(&self) -> bool {
        self.expiration_time.is_none()
    }

    /// Probe timeout as a duration with millisecond resolution
    pub fn qualify_timeout_duration(&self) -> Duration {
        Duration::from_millis((self.qualify_timeout.max(0.0) * 1000.0) as u64)
    }

    /// Copy of this contact carrying the qualify policy of its AOR
    pub fn with_aor_policy(&self, aor: &Aor) -> Contact {
        Contact {
            qualify_frequency: aor.qualify_frequency,
            qualify_timeout: aor.qualify_timeout,
            authenticate_qualify: aor.authenticate_qualify,
            ..self.clone()
        }
    }
}

/// Address of record: a named group of contacts carrying the default qualify policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aor {
    pub id: String,
    pub qualify_frequency: u32,
    pub qualify_timeout: f64,
    pub authenticate_qualify: bool,
    /// URIs of statically configured contacts
    pub permanent_contacts: Vec<String>,
}

impl Aor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            qualify_timeout: 3.0,
            ..Default::default()
        }
    }

    pub fn with_qualify(mut self, frequency: u32, timeout: f64) -> Self {
        self.qualify_frequency = frequency;
        self.qualify_timeout = timeout;
        self
    }

    pub fn with_permanent_contact(mut self, uri: impl Into<String>) -> Self {
        self.permanent_contacts.push(uri.into());
        self
    }
}

/// Configured SIP endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    /// Dialplan context used to answer inbound OPTIONS
    pub context: String,
    /// Comma separated AOR names
    pub aors: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, context: impl Into<String>, aors: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: context.into(),
            aors: aors.into(),
        }
    }

    /// AOR names with surrounding whitespace stripped, empty items skipped
    pub fn aor_names(&self) -> impl Iterator<Item = &str> {
        self.aors.split(',').map(str::trim).filter(|name| !name.is_empty())
    }

    /// Exact membership test against the AOR list
    pub fn has_aor(&self, aor: &str) -> bool {
        !aor.is_empty() && self.aor_names().any(|name| name == aor)
    }
}

/// Extract the AOR name from a contact id
pub fn aor_from_contact_id(id: &str) -> Option<&str> {
    id.find(DYNAMIC_CONTACT_DELIMITER)
        .or_else(|| id.find(STATIC_CONTACT_DELIMITER))
        .map(|pos| &id[..pos])
}

/// Persisted reachability record of a single contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactStatus {
    /// Same as the id of the contact it tracks
    pub id: String,
    pub aor: String,
    pub uri: String,
    pub status: ReachabilityState,
    pub last_status: ReachabilityState,
    /// Last measured round trip in microseconds, 0 when unknown
    pub rtt: u64,
    /// Send time of the outstanding probe
    pub rtt_start: Option<DateTime<Utc>>,
    /// Re-announce the current status without changing it
    pub refresh: bool,
}

impl ContactStatus {
    /// Allocate a status for the given contact id
    pub fn new(id: &str) -> Result<Self> {
        let aor = aor_from_contact_id(id);
        debug_assert!(aor.is_some(), "contact id {} has no AOR delimiter", id);
        let aor = aor.ok_or_else(|| QualifyError::InvalidContactId(id.to_string()))?;

        Ok(Self {
            id: id.to_string(),
            aor: aor.to_string(),
            uri: String::new(),
            status: ReachabilityState::Created,
            last_status: ReachabilityState::Unknown,
            rtt: 0,
            rtt_start: None,
            refresh: false,
        })
    }
}
