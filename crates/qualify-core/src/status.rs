//! Contact status store and reachability state machine
//!
//! [`ContactStatusStore`] is the only writer of [`ContactStatus`] records.
//! Every qualify result, registration refresh and probe start goes through
//! it, and it decides what is actually written:
//!
//! ```text
//!   find_or_create ──▶ Created ──probe answered──▶ Available
//!                        │   └────probe failed───▶ Unavailable
//!                        └─qualify disabled──────▶ Unknown
//! ```
//!
//! Writes are last-write-wins. The only serialization is the creation lock,
//! which guarantees a single record per contact id.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{QualifyError, Result};
use crate::registry::Registry;
use crate::system::SystemState;
use crate::task_queue::TaskQueue;
use crate::types::{Contact, ContactStatus, ReachabilityState};

/// Receives permanent contacts that appeared after startup
#[async_trait]
pub trait PermanentContactHandler: Send + Sync {
    async fn permanent_contact_created(&self, contact: Arc<Contact>);
}

/// Reads and writes contact status records through the registry
pub struct ContactStatusStore {
    registry: Arc<dyn Registry>,
    system: Arc<SystemState>,
    tasks: Arc<TaskQueue>,
    creation_lock: Mutex<()>,
    permanent_contact_handler: OnceLock<Weak<dyn PermanentContactHandler>>,
}

impl ContactStatusStore {
    pub fn new(registry: Arc<dyn Registry>, system: Arc<SystemState>, tasks: Arc<TaskQueue>) -> Self {
        Self {
            registry,
            system,
            tasks,
            creation_lock: Mutex::new(()),
            permanent_contact_handler: OnceLock::new(),
        }
    }

    /// Install the handler qualifying permanent contacts created after boot.
    ///
    /// Only the first handler is kept.
    pub fn set_permanent_contact_handler(&self, handler: Weak<dyn PermanentContactHandler>) {
        if self.permanent_contact_handler.set(handler).is_err() {
            debug!("Permanent contact handler already installed");
        }
    }

    /// Current status of a contact, if one was created
    pub async fn get(&self, contact_id: &str) -> Result<Option<ContactStatus>> {
        Ok(self.registry.retrieve_contact_status(contact_id).await?)
    }

    /// Retrieve the status of a contact, creating it in the `Created` state if absent
    pub async fn find_or_create(&self, contact: &Arc<Contact>) -> Result<ContactStatus> {
        let _guard = self.creation_lock.lock().await;

        if let Some(status) = self.registry.retrieve_contact_status(&contact.id).await? {
            return Ok(status);
        }

        let mut status = ContactStatus::new(&contact.id)?;
        status.uri = contact.uri.clone();

        if let Err(e) = self.registry.create_contact_status(status.clone()).await {
            error!("Unable to persist contact status for contact {}: {}", contact.uri, e);
            return Err(e.into());
        }

        // Contacts that existed at startup are picked up by the initial reload
        if self.system.is_fully_booted() && contact.is_permanent() {
            self.queue_permanent_contact(contact.clone());
        }

        info!(
            target: "qualify_stats",
            contact = %contact.id,
            state = status.status.label(),
            "Contact status created"
        );

        Ok(status)
    }

    fn queue_permanent_contact(&self, contact: Arc<Contact>) {
        let Some(handler) = self.permanent_contact_handler.get().and_then(Weak::upgrade) else {
            return;
        };

        let task_name = format!("qualify-permanent-contact:{}", contact.id);
        if let Err(e) = self.tasks.push(task_name, async move {
            handler.permanent_contact_created(contact).await;
        }) {
            error!("Unable to queue qualify of new permanent contact: {}", e);
        }
    }

    /// Apply a status transition.
    ///
    /// A refresh re-announces the current status. While the record is still
    /// `Created` a refresh is dropped if a qualify result is on its way, and
    /// turned into a regular `Unknown` update when none ever will be.
    ///
    /// Returns the record written, or `None` when nothing was written.
    pub async fn update(
        &self,
        contact: &Arc<Contact>,
        value: ReachabilityState,
        is_refresh: bool,
    ) -> Option<ContactStatus> {
        let status = match self.find_or_create(contact).await {
            Ok(status) => status,
            Err(e) => {
                error!("Unable to find contact status for contact {}: {}", contact.uri, e);
                return None;
            }
        };

        let mut is_refresh = is_refresh;
        let mut value = value;
        if is_refresh && status.status == ReachabilityState::Created {
            if contact.qualify_frequency != 0 || status.rtt_start.is_some() {
                return None;
            }
            is_refresh = false;
            value = ReachabilityState::Unknown;
        }

        let update = if is_refresh {
            ContactStatus {
                uri: contact.uri.clone(),
                refresh: true,
                ..status
            }
        } else {
            let rtt = match (value, status.rtt_start) {
                (ReachabilityState::Available, Some(start)) => elapsed_micros(start, Utc::now()),
                _ => 0,
            };
            let update = ContactStatus {
                uri: contact.uri.clone(),
                last_status: status.status,
                status: value,
                rtt,
                rtt_start: None,
                refresh: false,
                ..status
            };

            info!(
                target: "qualify_result",
                contact = %update.id,
                status = update.status.label(),
                rtt = update.rtt,
                "AOR contact qualify result"
            );
            update
        };

        if let Err(e) = self.registry.update_contact_status(update.clone()).await {
            error!("Unable to update contact status for contact {}: {}", contact.uri, e);
            return None;
        }

        debug!(
            "Contact {} status {} -> {} (refresh: {})",
            update.id, update.last_status, update.status, update.refresh
        );
        Some(update)
    }

    /// Record the send time of a probe so its round trip can be measured
    pub async fn init_probe_start(&self, contact: &Arc<Contact>) -> Option<ContactStatus> {
        let status = match self.find_or_create(contact).await {
            Ok(status) => status,
            Err(e) => {
                error!("Unable to find contact status for contact {}: {}", contact.uri, e);
                return None;
            }
        };

        let update = ContactStatus {
            rtt_start: Some(Utc::now()),
            refresh: false,
            ..status
        };

        if let Err(e) = self.registry.update_contact_status(update.clone()).await {
            error!("Unable to update contact status for contact {}: {}", contact.uri, e);
            return None;
        }
        Some(update)
    }

    /// Remove the status of a contact; absent records are ignored
    pub async fn delete(&self, contact: &Contact) -> Result<()> {
        if self.registry.retrieve_contact_status(&contact.id).await?.is_none() {
            return Ok(());
        }

        self.registry.delete_contact_status(&contact.id).await.map_err(|e| {
            error!("Unable to delete contact status for contact {}: {}", contact.uri, e);
            QualifyError::from(e)
        })
    }
}

fn elapsed_micros(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start)
        .num_microseconds()
        .map(|micros| micros.max(0) as u64)
        .unwrap_or(u64::MAX)
}
