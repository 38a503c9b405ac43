//! In-memory registry backed by DashMap

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;
use tracing::debug;

use super::{FieldPredicate, Registry, RegistryError, RegistryEvent, RegistryResult, matches_all};
use crate::types::{Aor, Contact, ContactStatus, Endpoint};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory registry.
///
/// Configuration objects are added through the `add_*`/`update_*`/`remove_*`
/// helpers, which publish the matching [`RegistryEvent`]. Status records are
/// written by the engine through the [`Registry`] trait.
pub struct MemoryRegistry {
    contacts: DashMap<String, Arc<Contact>>,
    aors: DashMap<String, Arc<Aor>>,
    endpoints: DashMap<String, Arc<Endpoint>>,
    statuses: DashMap<String, ContactStatus>,
    online_endpoints: DashSet<String>,
    events: broadcast::Sender<RegistryEvent>,
    status_writes: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            contacts: DashMap::new(),
            aors: DashMap::new(),
            endpoints: DashMap::new(),
            statuses: DashMap::new(),
            online_endpoints: DashSet::new(),
            events,
            status_writes: AtomicUsize::new(0),
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine, nothing is observing yet
        if self.events.send(event).is_err() {
            debug!("Registry event dropped, no subscribers");
        }
    }

    /// Add a contact and announce its creation
    pub fn add_contact(&self, contact: Contact) -> Arc<Contact> {
        let contact = Arc::new(contact);
        self.contacts.insert(contact.id.clone(), contact.clone());
        self.publish(RegistryEvent::ContactCreated(contact.clone()));
        contact
    }

    /// Replace a contact (e.g. registration refresh) and announce the update
    pub fn update_contact(&self, contact: Contact) -> Arc<Contact> {
        let contact = Arc::new(contact);
        self.contacts.insert(contact.id.clone(), contact.clone());
        self.publish(RegistryEvent::ContactUpdated(contact.clone()));
        contact
    }

    pub fn remove_contact(&self, id: &str) -> Option<Arc<Contact>> {
        let (_, contact) = self.contacts.remove(id)?;
        self.publish(RegistryEvent::ContactDeleted(contact.clone()));
        Some(contact)
    }

    pub fn add_aor(&self, aor: Aor) -> Arc<Aor> {
        let aor = Arc::new(aor);
        self.aors.insert(aor.id.clone(), aor.clone());
        self.publish(RegistryEvent::AorCreated(aor.clone()));
        aor
    }

    pub fn update_aor(&self, aor: Aor) -> Arc<Aor> {
        let aor = Arc::new(aor);
        self.aors.insert(aor.id.clone(), aor.clone());
        self.publish(RegistryEvent::AorUpdated(aor.clone()));
        aor
    }

    pub fn remove_aor(&self, id: &str) -> Option<Arc<Aor>> {
        let (_, aor) = self.aors.remove(id)?;
        self.publish(RegistryEvent::AorDeleted(aor.clone()));
        Some(aor)
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) -> Arc<Endpoint> {
        let endpoint = Arc::new(endpoint);
        self.endpoints.insert(endpoint.id.clone(), endpoint.clone());
        endpoint
    }

    pub fn remove_endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.remove(id).map(|(_, endpoint)| endpoint)
    }

    pub fn is_endpoint_online(&self, id: &str) -> bool {
        self.online_endpoints.contains(id)
    }

    /// Number of status creates, updates and deletes applied so far
    pub fn status_write_count(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Snapshot of a status record
    pub fn contact_status(&self, id: &str) -> Option<ContactStatus> {
        self.statuses.get(id).map(|entry| entry.clone())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn retrieve_contact(&self, id: &str) -> RegistryResult<Option<Arc<Contact>>> {
        Ok(self.contacts.get(id).map(|entry| entry.clone()))
    }

    async fn retrieve_aor(&self, id: &str) -> RegistryResult<Option<Arc<Aor>>> {
        Ok(self.aors.get(id).map(|entry| entry.clone()))
    }

    async fn retrieve_endpoint(&self, id: &str) -> RegistryResult<Option<Arc<Endpoint>>> {
        Ok(self.endpoints.get(id).map(|entry| entry.clone()))
    }

    async fn retrieve_contact_status(&self, id: &str) -> RegistryResult<Option<ContactStatus>> {
        Ok(self.contact_status(id))
    }

    async fn create_contact_status(&self, status: ContactStatus) -> RegistryResult<()> {
        match self.statuses.entry(status.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::AlreadyExists(status.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(status);
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn update_contact_status(&self, status: ContactStatus) -> RegistryResult<()> {
        match self.statuses.get_mut(&status.id) {
            Some(mut existing) => {
                *existing = status;
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RegistryError::NotFound(status.id)),
        }
    }

    async fn delete_contact_status(&self, id: &str) -> RegistryResult<()> {
        match self.statuses.remove(id) {
            Some(_) => {
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    async fn query_aors(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Aor>>> {
        Ok(self
            .aors
            .iter()
            .filter(|entry| matches_all(entry.value().as_ref(), predicates))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn query_contacts(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Contact>>> {
        Ok(self
            .contacts
            .iter()
            .filter(|entry| matches_all(entry.value().as_ref(), predicates))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn query_endpoints(&self, predicates: &[FieldPredicate]) -> RegistryResult<Vec<Arc<Endpoint>>> {
        Ok(self
            .endpoints
            .iter()
            .filter(|entry| matches_all(entry.value().as_ref(), predicates))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn aor_contacts(&self, aor: &Aor) -> RegistryResult<Vec<Arc<Contact>>> {
        let mut contacts: Vec<Arc<Contact>> = self
            .contacts
            .iter()
            .filter(|entry| entry.value().aor == aor.id)
            .map(|entry| entry.value().clone())
            .collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(contacts)
    }

    async fn set_endpoint_online(&self, endpoint: &str) -> RegistryResult<()> {
        if !self.endpoints.contains_key(endpoint) {
            return Err(RegistryError::NotFound(endpoint.to_string()));
        }
        self.online_endpoints.insert(endpoint.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
