//! Management operations
//!
//! Operator facing qualify commands and contact status reports. Front-ends
//! (CLI, manager interface) call into [`QualifyManagement`] and render the
//! returned values; nothing here writes to a terminal or socket.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::{QualifyError, Result};
use crate::probe::ProbeDispatcher;
use crate::registry::Registry;
use crate::types::{Aor, Contact, Endpoint, ReachabilityState};

/// Result of an operator requested probe of one contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactQualifyOutcome {
    pub aor: String,
    pub contact_id: String,
    pub uri: String,
    /// The probe was handed to the SIP stack
    pub sent: bool,
    pub error: Option<String>,
}

/// Status detail of one contact, as reported to management clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContactStatusReport {
    #[serde(rename = "AOR")]
    pub aor: String,
    #[serde(rename = "URI")]
    pub uri: String,
    pub user_agent: String,
    /// Registration expiry as a unix timestamp, 0 for permanent contacts
    pub reg_expire: i64,
    pub via_address: Option<String>,
    #[serde(rename = "CallID")]
    pub call_id: Option<String>,
    pub status: ReachabilityState,
    /// `None` when the status is unknown
    #[serde(serialize_with = "serialize_roundtrip")]
    pub roundtrip_usec: Option<u64>,
    pub endpoint_name: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub authenticate_qualify: bool,
    pub outbound_proxy: String,
    pub path: String,
    pub qualify_frequency: u32,
    pub qualify_timeout: f64,
}

fn serialize_roundtrip<S: Serializer>(rtt: &Option<u64>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match rtt {
        Some(rtt) => serializer.serialize_u64(*rtt),
        None => serializer.serialize_str("N/A"),
    }
}

impl ContactStatusReport {
    /// Round trip as displayed to operators
    pub fn roundtrip_label(&self) -> String {
        match self.roundtrip_usec {
            Some(rtt) => rtt.to_string(),
            None => "N/A".to_string(),
        }
    }

    /// Render as a `ContactStatusDetail` manager event
    pub fn to_event_lines(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContactStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event: ContactStatusDetail\r\n")?;
        write!(f, "AOR: {}\r\n", self.aor)?;
        write!(f, "URI: {}\r\n", self.uri)?;
        write!(f, "UserAgent: {}\r\n", self.user_agent)?;
        write!(f, "RegExpire: {}\r\n", self.reg_expire)?;
        if let Some(via) = &self.via_address {
            write!(f, "ViaAddress: {}\r\n", via)?;
        }
        if let Some(call_id) = &self.call_id {
            write!(f, "CallID: {}\r\n", call_id)?;
        }
        write!(f, "Status: {}\r\n", self.status.label())?;
        write!(f, "RoundtripUsec: {}\r\n", self.roundtrip_label())?;
        write!(f, "EndpointName: {}\r\n", self.endpoint_name)?;
        write!(f, "ID: {}\r\n", self.id)?;
        write!(f, "AuthenticateQualify: {}\r\n", u8::from(self.authenticate_qualify))?;
        write!(f, "OutboundProxy: {}\r\n", self.outbound_proxy)?;
        write!(f, "Path: {}\r\n", self.path)?;
        write!(f, "QualifyFrequency: {}\r\n", self.qualify_frequency)?;
        write!(f, "QualifyTimeout: {:.3}\r\n", self.qualify_timeout)
    }
}

/// Qualify commands and status reports for operators
pub struct QualifyManagement {
    registry: Arc<dyn Registry>,
    dispatcher: Arc<ProbeDispatcher>,
}

impl QualifyManagement {
    pub fn new(registry: Arc<dyn Registry>, dispatcher: Arc<ProbeDispatcher>) -> Self {
        Self { registry, dispatcher }
    }

    /// Probe every contact of every AOR of an endpoint as that endpoint
    pub async fn qualify_endpoint(&self, endpoint_id: &str) -> Result<Vec<ContactQualifyOutcome>> {
        let endpoint = self.endpoint_with_aors(endpoint_id).await?;
        info!("Sending qualify to endpoint {}", endpoint.id);

        let mut outcomes = Vec::new();
        for (aor, contacts) in self.endpoint_contacts(&endpoint).await? {
            for contact in contacts {
                let mut outcome = ContactQualifyOutcome {
                    aor: aor.id.clone(),
                    contact_id: contact.id.clone(),
                    uri: contact.uri.clone(),
                    sent: true,
                    error: None,
                };

                if let Err(e) = self.dispatcher.qualify_contact(Some(endpoint.clone()), contact).await {
                    warn!("Could not qualify contact {}: {}", outcome.uri, e);
                    outcome.sent = false;
                    outcome.error = Some(e.to_string());
                }
                outcomes.push(outcome);
            }
        }

        Ok(outcomes)
    }

    /// Queue a probe of every contact of an endpoint and return how many
    /// were queued. The endpoint is only validated; each contact resolves
    /// its own endpoint when the probe runs.
    pub async fn queue_endpoint_qualify(&self, endpoint_id: &str) -> Result<usize> {
        let endpoint = self.endpoint_with_aors(endpoint_id).await?;

        let mut queued = 0;
        for (_, contacts) in self.endpoint_contacts(&endpoint).await? {
            for contact in contacts {
                match self.dispatcher.push_qualify(contact) {
                    Ok(()) => queued += 1,
                    Err(e) => warn!("Unable to queue qualify: {}", e),
                }
            }
        }

        debug!("Endpoint {} found, queued {} qualifies", endpoint.id, queued);
        Ok(queued)
    }

    /// Status report of one contact
    pub async fn format_contact_status(&self, contact: &Contact, endpoint: Option<&Endpoint>) -> Result<ContactStatusReport> {
        let status = self.registry.retrieve_contact_status(&contact.id).await?;

        let (state, rtt) = match status {
            Some(status) if status.status != ReachabilityState::Unknown => (status.status, Some(status.rtt)),
            Some(status) => (status.status, None),
            None => (ReachabilityState::Unknown, None),
        };

        let via_address = contact
            .via_addr
            .as_deref()
            .filter(|addr| !addr.is_empty())
            .map(|addr| match contact.via_port {
                0 => addr.to_string(),
                port => format!("{}:{}", addr, port),
            });

        let endpoint_name = match endpoint {
            Some(endpoint) => endpoint.id.clone(),
            None => contact.endpoint_name.clone().unwrap_or_default(),
        };

        Ok(ContactStatusReport {
            aor: contact.aor.clone(),
            uri: contact.uri.clone(),
            user_agent: contact.user_agent.clone().unwrap_or_default(),
            reg_expire: contact.expiration_time.map(|expiry| expiry.timestamp()).unwrap_or(0),
            via_address,
            call_id: contact.call_id.clone().filter(|call_id| !call_id.is_empty()),
            status: state,
            roundtrip_usec: rtt,
            endpoint_name,
            id: contact.id.clone(),
            authenticate_qualify: contact.authenticate_qualify,
            outbound_proxy: contact.outbound_proxy.clone().unwrap_or_default(),
            path: contact.path.clone().unwrap_or_default(),
            qualify_frequency: contact.qualify_frequency,
            qualify_timeout: contact.qualify_timeout,
        })
    }

    /// Status reports of every contact on every AOR of an endpoint
    pub async fn format_endpoint_contacts(&self, endpoint: &Endpoint) -> Result<Vec<ContactStatusReport>> {
        let mut reports = Vec::new();
        for (_, contacts) in self.endpoint_contacts(endpoint).await? {
            for contact in contacts {
                reports.push(self.format_contact_status(&contact, Some(endpoint)).await?);
            }
        }
        Ok(reports)
    }

    async fn endpoint_with_aors(&self, endpoint_id: &str) -> Result<Arc<Endpoint>> {
        let endpoint = self
            .registry
            .retrieve_endpoint(endpoint_id)
            .await?
            .ok_or_else(|| QualifyError::UnknownEndpoint(endpoint_id.to_string()))?;

        if endpoint.aor_names().next().is_none() {
            return Err(QualifyError::NoAorsConfigured(endpoint.id.clone()));
        }
        Ok(endpoint)
    }

    /// Contacts of each existing AOR listed by the endpoint; missing AORs are skipped
    async fn endpoint_contacts(&self, endpoint: &Endpoint) -> Result<Vec<(Arc<Aor>, Vec<Arc<Contact>>)>> {
        let mut found = Vec::new();
        for name in endpoint.aor_names() {
            let Some(aor) = self.registry.retrieve_aor(name).await? else {
                continue;
            };
            let contacts = self.registry.aor_contacts(&aor).await?;
            found.push((aor, contacts));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: ReachabilityState, rtt: Option<u64>) -> ContactStatusReport {
        ContactStatusReport {
            aor: "alice".to_string(),
            uri: "sip:alice@192.0.2.10:5060".to_string(),
            user_agent: "Softphone/1.0".to_string(),
            reg_expire: 0,
            via_address: Some("192.0.2.10:5060".to_string()),
            call_id: None,
            status,
            roundtrip_usec: rtt,
            endpoint_name: "alice".to_string(),
            id: "alice;@1".to_string(),
            authenticate_qualify: false,
            outbound_proxy: String::new(),
            path: String::new(),
            qualify_frequency: 30,
            qualify_timeout: 3.0,
        }
    }

    #[test]
    fn test_unknown_roundtrip_is_not_available() {
        let unknown = report(ReachabilityState::Unknown, None);
        let json = serde_json::to_value(&unknown).unwrap();
        assert_eq!(json["RoundtripUsec"], "N/A");
        assert_eq!(json["Status"], "unknown");
        assert!(unknown.to_event_lines().contains("RoundtripUsec: N/A\r\n"));

        let available = report(ReachabilityState::Available, Some(1520));
        let json = serde_json::to_value(&available).unwrap();
        assert_eq!(json["RoundtripUsec"], 1520);
        assert_eq!(json["AOR"], "alice");
    }

    #[test]
    fn test_event_lines() {
        let lines = report(ReachabilityState::Available, Some(1520)).to_event_lines();
        assert!(lines.starts_with("Event: ContactStatusDetail\r\n"));
        assert!(lines.contains("Status: Reachable\r\n"));
        assert!(lines.contains("ViaAddress: 192.0.2.10:5060\r\n"));
        assert!(lines.ends_with("QualifyTimeout: 3.000\r\n"));
        assert!(lines.contains("AuthenticateQualify: 0\r\n"));
        assert!(!lines.contains("CallID"));
    }
}
