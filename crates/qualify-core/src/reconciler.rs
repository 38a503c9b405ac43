//! Lifecycle reconciliation
//!
//! Keeps the set of scheduled contacts consistent with configuration. The
//! reconciler consumes registry change notifications and translates them
//! into scheduler and status store operations:
//!
//! | Event           | Action                                                    |
//! |-----------------|-----------------------------------------------------------|
//! | contact created | probe now, then every `qualify_frequency`                 |
//! | contact updated | refresh the current status                                |
//! | contact deleted | unschedule and drop the status record                     |
//! | AOR created     | apply AOR policy to its contacts, reschedule with jitter  |
//! | AOR updated     | same as created                                           |
//! | AOR deleted     | unschedule its contacts, statuses are left untouched      |
//!
//! Contact records without a qualify frequency of their own are handled with
//! the policy of their AOR on every path.
//!
//! A full reload ([`LifecycleReconciler::qualify_and_schedule_all`]) throws
//! every schedule away and rebuilds it from the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::probe::ProbeDispatcher;
use crate::registry::{FieldPredicate, Registry, RegistryEvent};
use crate::scheduler::QualifyScheduler;
use crate::status::{ContactStatusStore, PermanentContactHandler};
use crate::types::{Aor, Contact, ReachabilityState};

/// Delay before the first probe of a contact scheduled in bulk.
///
/// Spreads probes uniformly over `[0, min(max_initial, frequency))` seconds
/// so a reload does not probe every contact at once. A `max_initial` of 0
/// means no cap.
pub fn initial_qualify_delay(max_initial: u32, frequency: u32) -> Duration {
    let base = if max_initial != 0 && max_initial < frequency {
        max_initial
    } else {
        frequency
    };

    let fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_millis((f64::from(base) * 1000.0 * fraction) as u64)
}

/// Applies registry changes to the scheduler and the status store
pub struct LifecycleReconciler {
    registry: Arc<dyn Registry>,
    statuses: Arc<ContactStatusStore>,
    dispatcher: Arc<ProbeDispatcher>,
    scheduler: Arc<QualifyScheduler>,
    max_initial_qualify_time: u32,
}

impl LifecycleReconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        statuses: Arc<ContactStatusStore>,
        dispatcher: Arc<ProbeDispatcher>,
        scheduler: Arc<QualifyScheduler>,
        max_initial_qualify_time: u32,
    ) -> Self {
        Self {
            registry,
            statuses,
            dispatcher,
            scheduler,
            max_initial_qualify_time,
        }
    }

    /// Consume registry notifications until cancelled or the channel closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<RegistryEvent>, cancel_token: CancellationToken) {
        debug!("Qualify reconciler listening for registry events");

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                received = events.recv() => received,
            };

            match received {
                Ok(event) => self.handle_event(event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} registry events, rescheduling all contacts", missed);
                    if let Err(e) = self.qualify_and_schedule_all().await {
                        error!("Unable to reschedule contacts: {}", e);
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Registry event stream closed");
                    break;
                }
            }
        }
    }

    /// Apply one registry change
    pub async fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::ContactCreated(contact) => self.contact_created(contact).await,
            RegistryEvent::ContactUpdated(contact) => self.contact_updated(contact).await,
            RegistryEvent::ContactDeleted(contact) => self.contact_deleted(contact).await,
            RegistryEvent::AorCreated(aor) | RegistryEvent::AorUpdated(aor) => self.aor_modified(&aor).await,
            RegistryEvent::AorDeleted(aor) => self.aor_deleted(&aor).await,
        }
    }

    pub async fn contact_created(&self, contact: Arc<Contact>) {
        let contact = self.with_inherited_policy(contact).await;
        self.qualify_and_schedule(contact).await;
    }

    /// A registration refresh re-announces the current status
    pub async fn contact_updated(&self, contact: Arc<Contact>) {
        let contact = self.with_inherited_policy(contact).await;
        self.statuses
            .update(&contact, ReachabilityState::Available, true)
            .await;
    }

    pub async fn contact_deleted(&self, contact: Arc<Contact>) {
        self.dispatcher.purge_contact(&contact).await;
    }

    /// Reschedule every contact of a created or updated AOR with its policy
    pub async fn aor_modified(&self, aor: &Aor) {
        let contacts = match self.registry.aor_contacts(aor).await {
            Ok(contacts) => contacts,
            Err(e) => {
                error!("Unable to retrieve contacts of AOR {}: {}", aor.id, e);
                return;
            }
        };

        for contact in contacts {
            self.qualify_and_schedule_contact(Arc::new(contact.with_aor_policy(aor)))
                .await;
        }
    }

    /// Stop qualifying the contacts of a deleted AOR
    pub async fn aor_deleted(&self, aor: &Aor) {
        match self.registry.aor_contacts(aor).await {
            Ok(contacts) => {
                for contact in contacts {
                    self.scheduler.unschedule(&contact.id);
                }
            }
            Err(e) => warn!("Unable to retrieve contacts of deleted AOR {}: {}", aor.id, e),
        }

        // Entries whose contacts already left the registry
        let orphaned = self.scheduler.unschedule_for_aor(&aor.id);
        if orphaned > 0 {
            debug!("Unscheduled {} orphaned contacts of AOR {}", orphaned, aor.id);
        }
    }

    /// Rebuild the schedules of one AOR after it was applied
    pub async fn update_options(&self, aor: &Aor) {
        self.scheduler.unschedule_for_aor(&aor.id);
        self.aor_modified(aor).await;
    }

    /// Probe a contact right away and then at its full interval.
    ///
    /// With qualification disabled the contact is reported `Unknown`.
    pub async fn qualify_and_schedule(&self, contact: Arc<Contact>) {
        self.scheduler.unschedule(&contact.id);

        if contact.qualify_frequency == 0 {
            self.statuses
                .update(&contact, ReachabilityState::Unknown, false)
                .await;
            return;
        }

        if let Err(e) = self.dispatcher.push_qualify(contact.clone()) {
            error!("Unable to queue qualify of contact {}: {}", contact.uri, e);
        }

        let interval = Duration::from_secs(u64::from(contact.qualify_frequency));
        if let Err(e) = self.scheduler.schedule(contact, interval) {
            error!("Unable to schedule qualify: {}", e);
        }
    }

    /// Schedule a contact with a randomized first probe.
    ///
    /// With qualification disabled the contact is reported `Unknown`.
    pub async fn qualify_and_schedule_contact(&self, contact: Arc<Contact>) {
        self.scheduler.unschedule(&contact.id);

        if contact.qualify_frequency == 0 {
            self.statuses
                .update(&contact, ReachabilityState::Unknown, false)
                .await;
            return;
        }

        let delay = initial_qualify_delay(self.max_initial_qualify_time, contact.qualify_frequency);
        if let Err(e) = self.scheduler.schedule(contact, delay) {
            error!("Unable to schedule qualify: {}", e);
        }
    }

    /// Contact records without a qualify frequency of their own take the
    /// policy of their AOR
    async fn with_inherited_policy(&self, contact: Arc<Contact>) -> Arc<Contact> {
        if contact.qualify_frequency != 0 || contact.aor.is_empty() {
            return contact;
        }

        match self.registry.retrieve_aor(&contact.aor).await {
            Ok(Some(aor)) => Arc::new(contact.with_aor_policy(&aor)),
            Ok(None) => contact,
            Err(e) => {
                warn!("Unable to retrieve AOR {} of contact {}: {}", contact.aor, contact.uri, e);
                contact
            }
        }
    }

    /// Re-read a contact's AOR policy and qualify it right away.
    ///
    /// Skipped when the contact is already scheduled, which is the case when
    /// its creation event was handled first, and when the contact left the
    /// registry while its status record was being recreated.
    pub async fn qualify_and_schedule_aor_contact(&self, contact: Arc<Contact>) {
        if contact.aor.is_empty() || self.scheduler.is_scheduled(&contact.id) {
            return;
        }

        match self.registry.retrieve_contact(&contact.id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("Contact {} no longer exists, not qualifying", contact.uri);
                return;
            }
            Err(e) => {
                error!("Unable to retrieve contact {}: {}", contact.uri, e);
                return;
            }
        }

        let aor = match self.registry.retrieve_aor(&contact.aor).await {
            Ok(Some(aor)) => aor,
            Ok(None) => {
                debug!("AOR {} of contact {} not found", contact.aor, contact.uri);
                return;
            }
            Err(e) => {
                error!("Unable to retrieve AOR {}: {}", contact.aor, e);
                return;
            }
        };

        self.qualify_and_schedule(Arc::new(contact.with_aor_policy(&aor)))
            .await;
    }

    /// Unschedule everything, then schedule every qualified AOR contact and
    /// every contact with its own qualify frequency
    pub async fn qualify_and_schedule_all(&self) -> Result<()> {
        let qualified = [FieldPredicate::gt("qualify_frequency", "0")];

        let released = self.scheduler.unschedule_all();
        debug!("Released {} qualify schedules", released);

        let aors = self.registry.query_aors(&qualified).await?;
        for aor in &aors {
            self.aor_modified(aor).await;
        }

        let contacts = self.registry.query_contacts(&qualified).await?;
        for contact in contacts {
            self.qualify_and_schedule_contact(contact).await;
        }

        info!(
            "Qualifying {} contacts across {} AORs",
            self.scheduler.scheduled_count(),
            aors.len()
        );
        Ok(())
    }

    /// Mark endpoints online that will never be qualified.
    ///
    /// Covers AORs with permanent contacts but no qualify frequency, and
    /// unexpired registrations without a qualify frequency.
    pub async fn update_all_unqualified_endpoints(&self) -> Result<()> {
        let aors = self
            .registry
            .query_aors(&[
                FieldPredicate::not_eq("contact", ""),
                FieldPredicate::le("qualify_frequency", "0"),
            ])
            .await?;
        for aor in aors {
            self.mark_aor_endpoints_online(&aor).await?;
        }

        let now = Utc::now().timestamp();
        let contacts = self
            .registry
            .query_contacts(&[
                FieldPredicate::gt("expiration_time", now.to_string()),
                FieldPredicate::le("qualify_frequency", "0"),
            ])
            .await?;
        for contact in contacts {
            let Some(endpoint) = contact.endpoint_name.as_deref().filter(|name| !name.is_empty()) else {
                continue;
            };
            if let Err(e) = self.registry.set_endpoint_online(endpoint).await {
                warn!(
                    "Unable to find persistent endpoint '{}' for contact '{}/{}': {}",
                    endpoint, contact.aor, contact.uri, e
                );
            }
        }

        Ok(())
    }

    async fn mark_aor_endpoints_online(&self, aor: &Aor) -> Result<()> {
        if aor.id.is_empty() {
            return Ok(());
        }

        let endpoints = self
            .registry
            .query_endpoints(&[FieldPredicate::like("aors", format!("%{}%", aor.id))])
            .await?;

        for endpoint in endpoints.iter().filter(|endpoint| endpoint.has_aor(&aor.id)) {
            if let Err(e) = self.registry.set_endpoint_online(&endpoint.id).await {
                warn!(
                    "Unable to find persistent endpoint '{}' for aor '{}': {}",
                    endpoint.id, aor.id, e
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PermanentContactHandler for LifecycleReconciler {
    async fn permanent_contact_created(&self, contact: Arc<Contact>) {
        self.qualify_and_schedule_aor_contact(contact).await;
    }
}
