//! Qualify probes
//!
//! [`ProbeDispatcher`] sends one OPTIONS request to a contact and feeds the
//! transaction outcome back into the [`ContactStatusStore`]. The response to
//! a probe arrives on the SIP stack's side; the dispatcher moves the contact
//! into a completion task that owns it until the outcome is known, so the
//! contact is released exactly once whichever way the transaction ends.
//!
//! [`OptionsResponder`] answers OPTIONS requests sent to us by peers.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{QualifyError, Result};
use crate::registry::{FieldPredicate, Registry};
use crate::scheduler::ScheduleTable;
use crate::stack::{OPTIONS, PendingTransaction, SipStack, TransactionOutcome};
use crate::status::ContactStatusStore;
use crate::task_queue::TaskQueue;
use crate::types::{Contact, Endpoint, ReachabilityState};

pub mod responder;

pub use responder::{ExtensionLookup, OptionsResponder};

/// Sends qualify probes and records their outcome
pub struct ProbeDispatcher {
    registry: Arc<dyn Registry>,
    stack: Arc<dyn SipStack>,
    statuses: Arc<ContactStatusStore>,
    schedules: Arc<ScheduleTable>,
    tasks: Arc<TaskQueue>,
}

impl ProbeDispatcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        stack: Arc<dyn SipStack>,
        statuses: Arc<ContactStatusStore>,
        schedules: Arc<ScheduleTable>,
        tasks: Arc<TaskQueue>,
    ) -> Self {
        Self {
            registry,
            stack,
            statuses,
            schedules,
            tasks,
        }
    }

    /// Queue a probe of the contact on the worker task queue
    pub fn push_qualify(self: &Arc<Self>, contact: Arc<Contact>) -> Result<()> {
        let dispatcher = self.clone();
        let task_name = format!("qualify:{}", contact.id);

        self.tasks.push(task_name, async move {
            if let Err(e) = dispatcher.qualify_contact(None, contact).await {
                debug!("Qualify task failed: {}", e);
            }
        })
    }

    /// Send an OPTIONS probe to a contact.
    ///
    /// Without an explicit endpoint one is resolved from the contact. A
    /// contact no endpoint claims can never be qualified and is purged.
    /// Returns once the request is sent; the outcome is recorded later.
    pub async fn qualify_contact(&self, endpoint: Option<Arc<Endpoint>>, contact: Arc<Contact>) -> Result<()> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => match self.resolve_endpoint(&contact).await? {
                Some(endpoint) => endpoint,
                None => {
                    warn!(
                        "Unable to find an endpoint to qualify contact {}. Deleting this contact",
                        contact.uri
                    );
                    self.purge_contact(&contact).await;
                    return Err(QualifyError::EndpointNotFound(contact.uri.clone()));
                }
            },
        };

        let mut request = self.stack.create_request(OPTIONS, &endpoint, &contact).map_err(|e| {
            error!("Unable to create request to qualify contact {}: {}", contact.uri, e);
            QualifyError::from(e)
        })?;

        if let Some(proxy) = contact.outbound_proxy.as_deref().filter(|proxy| !proxy.is_empty()) {
            self.stack.set_outbound_proxy(&mut request, proxy).map_err(|e| {
                error!(
                    "Unable to apply outbound proxy on request to qualify contact {}: {}",
                    contact.uri, e
                );
                QualifyError::from(e)
            })?;
        }

        self.statuses.init_probe_start(&contact).await;

        let pending = match self
            .stack
            .send_out_of_dialog(request, &endpoint, contact.qualify_timeout_duration())
        {
            Ok(pending) => pending,
            Err(e) => {
                error!("Unable to send request to qualify contact {}: {}", contact.uri, e);
                self.statuses
                    .update(&contact, ReachabilityState::Unavailable, false)
                    .await;
                return Err(e.into());
            }
        };

        debug!("Sent qualify request to contact {} via endpoint {}", contact.uri, endpoint.id);

        let statuses = self.statuses.clone();
        tokio::spawn(complete_probe(statuses, contact, pending));

        Ok(())
    }

    /// Find the endpoint a contact should be qualified as
    pub async fn resolve_endpoint(&self, contact: &Contact) -> Result<Option<Arc<Endpoint>>> {
        if let Some(name) = contact.endpoint_name.as_deref().filter(|name| !name.is_empty()) {
            if let Some(endpoint) = self.registry.retrieve_endpoint(name).await? {
                return Ok(Some(endpoint));
            }
        }

        self.find_an_endpoint(contact).await
    }

    /// Reverse lookup of an endpoint listing the contact's AOR.
    ///
    /// The registry query is a pattern match, so "abc" also returns an
    /// endpoint with AOR "aaabccc"; membership is checked exactly afterwards.
    async fn find_an_endpoint(&self, contact: &Contact) -> Result<Option<Arc<Endpoint>>> {
        if contact.aor.is_empty() {
            return Ok(None);
        }

        let pattern = format!("%{}%", contact.aor);
        let endpoints = self
            .registry
            .query_endpoints(&[FieldPredicate::like("aors", pattern)])
            .await?;

        Ok(endpoints.into_iter().find(|endpoint| endpoint.has_aor(&contact.aor)))
    }

    /// Stop qualifying a contact and drop its status record
    pub async fn purge_contact(&self, contact: &Contact) {
        self.schedules.unschedule(&contact.id);

        if let Err(e) = self.statuses.delete(contact).await {
            error!("Unable to purge contact status for contact {}: {}", contact.uri, e);
        }
    }
}

async fn complete_probe(statuses: Arc<ContactStatusStore>, contact: Arc<Contact>, pending: PendingTransaction) {
    let state = match pending.await {
        Ok(TransactionOutcome::Response { status_code }) => {
            debug!("Contact {} answered qualify with {}", contact.uri, status_code);
            ReachabilityState::Available
        }
        Ok(TransactionOutcome::Timeout) => {
            debug!("Qualify of contact {} timed out", contact.uri);
            ReachabilityState::Unavailable
        }
        Ok(TransactionOutcome::TransportError(reason)) => {
            debug!("Qualify of contact {} failed: {}", contact.uri, reason);
            ReachabilityState::Unavailable
        }
        Ok(TransactionOutcome::Terminated(reason)) => {
            error!("Unexpected transaction outcome qualifying contact {}: {}", contact.uri, reason);
            ReachabilityState::Unavailable
        }
        Err(_) => {
            warn!("Qualify transaction for contact {} ended without an outcome", contact.uri);
            ReachabilityState::Unavailable
        }
    };

    statuses.update(&contact, state, false).await;
}
