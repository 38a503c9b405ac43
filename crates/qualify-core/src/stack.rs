//! SIP stack interface
//!
//! Message construction, transactions and transport belong to the SIP stack.
//! The engine describes what it wants sent with [`OutboundRequest`] and
//! [`OutboundResponse`] and learns the result of an out-of-dialog request
//! through a [`PendingTransaction`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::types::{Contact, Endpoint};

/// SIP method used for qualify probes
pub const OPTIONS: &str = "OPTIONS";

/// Errors reported by the SIP stack
#[derive(Debug, Error)]
pub enum StackError {
    #[error("Unable to create request: {0}")]
    RequestCreation(String),

    #[error("Invalid outbound proxy: {0}")]
    InvalidOutboundProxy(String),

    #[error("Unable to send request: {0}")]
    Send(String),

    #[error("Unable to send response: {0}")]
    Response(String),
}

pub type StackResult<T> = std::result::Result<T, StackError>;

/// Final state of an out-of-dialog client transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// A response was received, whatever its status code
    Response { status_code: u16 },
    /// No response within the transaction timeout
    Timeout,
    /// The transport reported a failure after the request was sent
    TransportError(String),
    /// The transaction ended for any other reason
    Terminated(String),
}

/// Receives the outcome of a sent request
pub type PendingTransaction = oneshot::Receiver<TransactionOutcome>;

/// Request the stack should serialize and send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    /// Request-URI, normally the contact URI
    pub target: String,
    pub endpoint: String,
    pub outbound_proxy: Option<String>,
    /// Route set recorded at registration
    pub path: Option<String>,
    pub authenticate: bool,
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    /// Request addressed to a contact on behalf of an endpoint
    pub fn for_contact(method: &str, endpoint: &Endpoint, contact: &Contact) -> Self {
        Self {
            method: method.to_string(),
            target: contact.uri.clone(),
            endpoint: endpoint.id.clone(),
            outbound_proxy: None,
            path: contact.path.clone(),
            authenticate: contact.authenticate_qualify,
            headers: Vec::new(),
        }
    }
}

/// Response the stack should send for a received request
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
}

impl OutboundResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Request received from a peer, after endpoint identification
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Stack handle used to answer the request
    pub request_id: String,
    pub method: String,
    /// Scheme of the request-URI
    pub uri_scheme: String,
    /// User part of the request-URI
    pub user: Option<String>,
    /// Endpoint the request was identified as coming from
    pub endpoint: Option<Arc<Endpoint>>,
}

/// Capability headers the stack advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityHeader {
    Accept,
    Allow,
    Supported,
}

impl CapabilityHeader {
    pub fn name(&self) -> &'static str {
        match self {
            CapabilityHeader::Accept => "Accept",
            CapabilityHeader::Allow => "Allow",
            CapabilityHeader::Supported => "Supported",
        }
    }
}

/// Operations the engine needs from the SIP stack
pub trait SipStack: Send + Sync {
    /// Build an out-of-dialog request to a contact
    fn create_request(&self, method: &str, endpoint: &Endpoint, contact: &Contact) -> StackResult<OutboundRequest> {
        if contact.uri.is_empty() {
            return Err(StackError::RequestCreation(format!("contact {} has no URI", contact.id)));
        }
        Ok(OutboundRequest::for_contact(method, endpoint, contact))
    }

    /// Route the request through an outbound proxy
    fn set_outbound_proxy(&self, request: &mut OutboundRequest, proxy: &str) -> StackResult<()> {
        let proxy = proxy.trim();
        if !(proxy.starts_with("sip:") || proxy.starts_with("sips:")) {
            return Err(StackError::InvalidOutboundProxy(proxy.to_string()));
        }
        request.outbound_proxy = Some(proxy.to_string());
        Ok(())
    }

    /// Send a request; the returned receiver yields the transaction outcome
    fn send_out_of_dialog(
        &self,
        request: OutboundRequest,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> StackResult<PendingTransaction>;

    /// Current value of a capability header, if any
    fn capability(&self, header: CapabilityHeader) -> Option<String>;

    /// Send a response to a received request
    fn send_response(&self, request_id: &str, response: OutboundResponse) -> StackResult<()>;
}
