//! Qualification scheduler
//!
//! Every contact with a non-zero qualify frequency owns one timer task. The
//! task sleeps until its deadline, checks that the contact's AOR still
//! exists, pushes a probe onto the worker queue and re-arms itself with the
//! contact's interval.
//!
//! ```text
//!  schedule ──▶ ScheduleTable[id] = entry(generation, token)
//!                     │
//!                     ▼
//!   timer ── sleep ──▶ fire ──▶ AOR gone? ── yes ─▶ remove own entry, stop
//!     ▲                            │ no
//!     └──── interval ◀── push probe┘
//! ```
//!
//! All removal goes through the [`ScheduleTable`]. Removing an entry cancels
//! its token, and a timer only ever removes the entry carrying its own
//! generation, so a timer firing on stale data can neither bring back a
//! removed entry nor remove the entry that replaced it. Removers never wait
//! on a timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::{QualifyError, Result};
use crate::probe::ProbeDispatcher;
use crate::registry::Registry;
use crate::types::Contact;

/// A contact that is being qualified periodically
#[derive(Debug)]
pub struct ScheduleEntry {
    generation: u64,
    contact: Arc<Contact>,
    cancel_token: CancellationToken,
}

impl ScheduleEntry {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contact(&self) -> &Arc<Contact> {
        &self.contact
    }
}

/// Scheduled contacts keyed by contact id
#[derive(Debug, Default)]
pub struct ScheduleTable {
    entries: DashMap<String, ScheduleEntry>,
    next_generation: AtomicU64,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, cancelling any entry it replaces
    fn insert(&self, contact: Arc<Contact>, cancel_token: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = ScheduleEntry {
            generation,
            contact: contact.clone(),
            cancel_token,
        };

        if let Some(replaced) = self.entries.insert(contact.id.clone(), entry) {
            replaced.cancel_token.cancel();
        }
        generation
    }

    /// Remove and cancel the entry of a contact. Returns `false` if none existed.
    pub fn unschedule(&self, contact_id: &str) -> bool {
        match self.entries.remove(contact_id) {
            Some((_, entry)) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the entry only if it is still the given generation
    fn remove_if_current(&self, contact_id: &str, generation: u64) -> bool {
        match self
            .entries
            .remove_if(contact_id, |_, entry| entry.generation == generation)
        {
            Some((_, entry)) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove and cancel every entry matching the predicate
    pub fn unschedule_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ScheduleEntry) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if predicate(entry) {
                entry.cancel_token.cancel();
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn unschedule_all(&self) -> usize {
        self.unschedule_matching(|_| true)
    }

    pub fn contains(&self, contact_id: &str) -> bool {
        self.entries.contains_key(contact_id)
    }

    /// Contact held by the current entry of an id
    pub fn contact(&self, contact_id: &str) -> Option<Arc<Contact>> {
        self.entries.get(contact_id).map(|entry| entry.contact.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drives periodic qualification of scheduled contacts
pub struct QualifyScheduler {
    table: Arc<ScheduleTable>,
    dispatcher: Arc<ProbeDispatcher>,
    registry: Arc<dyn Registry>,
    shutdown_token: CancellationToken,
    timers: TaskTracker,
    shutdown_timeout: Duration,
}

impl QualifyScheduler {
    pub fn new(
        table: Arc<ScheduleTable>,
        dispatcher: Arc<ProbeDispatcher>,
        registry: Arc<dyn Registry>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            table,
            dispatcher,
            registry,
            shutdown_token: CancellationToken::new(),
            timers: TaskTracker::new(),
            shutdown_timeout,
        }
    }

    /// Start qualifying a contact, first after `initial_delay` and then
    /// every `qualify_frequency` seconds.
    pub fn schedule(self: &Arc<Self>, contact: Arc<Contact>, initial_delay: Duration) -> Result<()> {
        debug_assert!(contact.qualify_frequency != 0);
        if contact.qualify_frequency == 0 {
            return Err(QualifyError::Config(format!(
                "contact {} has qualification disabled",
                contact.id
            )));
        }

        if self.shutdown_token.is_cancelled() {
            error!("Unable to schedule qualify for contact {}: scheduler stopped", contact.uri);
            return Err(QualifyError::TaskQueue("scheduler stopped".to_string()));
        }

        let cancel_token = self.shutdown_token.child_token();
        let generation = self.table.insert(contact.clone(), cancel_token.clone());

        debug!(
            "Scheduled qualify of contact {} in {:?}, then every {}s",
            contact.uri, initial_delay, contact.qualify_frequency
        );

        self.timers.spawn(run_timer(
            Arc::downgrade(self),
            generation,
            contact,
            cancel_token,
            initial_delay,
        ));
        Ok(())
    }

    /// Stop qualifying a contact; a no-op when it is not scheduled
    pub fn unschedule(&self, contact_id: &str) -> bool {
        self.table.unschedule(contact_id)
    }

    /// Stop qualifying every contact of an AOR
    pub fn unschedule_for_aor(&self, aor_id: &str) -> usize {
        self.table.unschedule_matching(|entry| entry.contact.aor == aor_id)
    }

    pub fn unschedule_all(&self) -> usize {
        self.table.unschedule_all()
    }

    pub fn is_scheduled(&self, contact_id: &str) -> bool {
        self.table.contains(contact_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.table.len()
    }

    /// Contact a schedule entry currently qualifies
    pub fn scheduled_contact(&self, contact_id: &str) -> Option<Arc<Contact>> {
        self.table.contact(contact_id)
    }

    pub fn table(&self) -> &Arc<ScheduleTable> {
        &self.table
    }

    /// Handle one firing. Returns the delay until the next firing, or `None`
    /// when the timer should stop.
    async fn on_fire(&self, generation: u64, contact: &Arc<Contact>, cancel_token: &CancellationToken) -> Option<Duration> {
        let interval = Duration::from_secs(u64::from(contact.qualify_frequency));

        // The AOR may have been removed from configuration under us
        match self.registry.retrieve_aor(&contact.aor).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("AOR {} is gone, no longer qualifying contact {}", contact.aor, contact.uri);
                self.table.remove_if_current(&contact.id, generation);
                return None;
            }
            Err(e) => {
                warn!("Unable to check AOR {} of contact {}: {}", contact.aor, contact.uri, e);
                return Some(interval);
            }
        }

        if cancel_token.is_cancelled() {
            return None;
        }

        if let Err(e) = self.dispatcher.push_qualify(contact.clone()) {
            warn!("Unable to queue qualify of contact {}: {}", contact.uri, e);
        }

        Some(interval)
    }

    /// Cancel every timer and release the schedule table
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.timers.close();

        if tokio::time::timeout(self.shutdown_timeout, self.timers.wait())
            .await
            .is_err()
        {
            warn!("Qualify timers still running after {:?}", self.shutdown_timeout);
        }

        let released = self.table.unschedule_all();
        debug!("Qualify scheduler stopped, released {} entries", released);
    }
}

async fn run_timer(
    scheduler: Weak<QualifyScheduler>,
    generation: u64,
    contact: Arc<Contact>,
    cancel_token: CancellationToken,
    initial_delay: Duration,
) {
    let mut deadline = Instant::now() + initial_delay;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };

        match scheduler.on_fire(generation, &contact, &cancel_token).await {
            Some(interval) => deadline += interval,
            None => break,
        }
    }
}
