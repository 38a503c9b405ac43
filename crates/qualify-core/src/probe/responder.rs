//! Inbound OPTIONS handling
//!
//! Peers poll us with OPTIONS just as we poll them. The answer only depends
//! on whether we are shutting down and whether the addressed extension
//! exists; contact status records are never touched here.

use std::sync::Arc;

use tracing::{debug, error};

use crate::stack::{CapabilityHeader, InboundRequest, OPTIONS, OutboundResponse, SipStack, StackResult};
use crate::system::SystemState;

const DEFAULT_ENCODING: &str = "text/plain";
const DEFAULT_LANGUAGE: &str = "en";

/// Dialplan lookup used to validate the user part of an inbound OPTIONS
pub trait ExtensionLookup: Send + Sync {
    fn exists_extension(&self, context: &str, exten: &str) -> bool;
}

/// Answers OPTIONS requests received from identified endpoints
pub struct OptionsResponder {
    stack: Arc<dyn SipStack>,
    extensions: Arc<dyn ExtensionLookup>,
    system: Arc<SystemState>,
    ignore_uri_user_options: bool,
}

impl OptionsResponder {
    pub fn new(
        stack: Arc<dyn SipStack>,
        extensions: Arc<dyn ExtensionLookup>,
        system: Arc<SystemState>,
        ignore_uri_user_options: bool,
    ) -> Self {
        Self {
            stack,
            extensions,
            system,
            ignore_uri_user_options,
        }
    }

    /// Handle a received request. Returns `false` when the request is not
    /// ours to answer (not OPTIONS, or from an unidentified peer).
    pub fn on_rx_request(&self, request: &InboundRequest) -> bool {
        if !request.method.eq_ignore_ascii_case(OPTIONS) {
            return false;
        }

        let Some(code) = self.response_code(request) else {
            return false;
        };

        debug!("Answering OPTIONS {} with {}", request.request_id, code);
        if let Err(e) = self.send_options_response(&request.request_id, code) {
            error!("Unable to send response ({})", e);
        }
        true
    }

    /// Status code an OPTIONS request should be answered with
    pub fn response_code(&self, request: &InboundRequest) -> Option<u16> {
        let endpoint = request.endpoint.as_ref()?;

        let scheme = request.uri_scheme.to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Some(416);
        }

        let exten = request
            .user
            .as_deref()
            .map(|user| self.truncate_user_options(user))
            .unwrap_or_default();

        let code = if self.system.is_shutting_down() {
            // Not taking new calls; most likely a server availability poll
            503
        } else if !exten.is_empty() && !self.extensions.exists_extension(&endpoint.context, exten) {
            404
        } else {
            200
        };
        Some(code)
    }

    fn truncate_user_options<'a>(&self, user: &'a str) -> &'a str {
        if self.ignore_uri_user_options {
            user.split(';').next().unwrap_or(user)
        } else {
            user
        }
    }

    fn send_options_response(&self, request_id: &str, code: u16) -> StackResult<()> {
        let mut response = OutboundResponse::new(code);

        for header in [CapabilityHeader::Accept, CapabilityHeader::Allow, CapabilityHeader::Supported] {
            if let Some(value) = self.stack.capability(header) {
                response.add_header(header.name(), value);
            }
        }
        response.add_header("Accept-Encoding", DEFAULT_ENCODING);
        response.add_header("Accept-Language", DEFAULT_LANGUAGE);

        self.stack.send_response(request_id, response)
    }
}
