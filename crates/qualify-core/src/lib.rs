//! # Qualify-Core
//!
//! SIP contact qualification for RVoIP.
//!
//! This crate keeps track of whether the registered and configured contacts
//! of the server are reachable:
//! - Periodic SIP OPTIONS probes per contact, with a randomized first probe
//! - A reachability state machine with round-trip time measurement
//! - Reconciliation of probe schedules with contact and AOR changes
//! - Answers to OPTIONS requests received from peers
//! - Operator commands and contact status reports
//!
//! ## Architecture
//!
//! The SIP stack and the object store are not part of this crate. They are
//! consumed through the [`SipStack`] and [`Registry`] traits;
//! [`MemoryRegistry`] is an in-memory registry for embedding and tests.
//! [`QualifyEngine`] wires everything together and owns the process-wide
//! state between [`QualifyEngine::start`] and [`QualifyEngine::stop`].

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod management;
pub mod probe;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod stack;
pub mod status;
pub mod system;
pub mod task_queue;
pub mod types;

pub use config::{LoggingSettings, QualifyConfig};
pub use engine::{QualifyEngine, QualifyEngineBuilder};
pub use error::{QualifyError, Result};
pub use logging::{LoggingConfig, init_from_config, setup_logging};
pub use management::{ContactQualifyOutcome, ContactStatusReport, QualifyManagement};
pub use probe::{ExtensionLookup, OptionsResponder, ProbeDispatcher};
pub use reconciler::{LifecycleReconciler, initial_qualify_delay};
pub use registry::{FieldPredicate, MemoryRegistry, Registry, RegistryError, RegistryEvent};
pub use scheduler::{QualifyScheduler, ScheduleTable};
pub use stack::{
    CapabilityHeader, InboundRequest, OutboundRequest, OutboundResponse, PendingTransaction, SipStack, StackError,
    TransactionOutcome,
};
pub use status::ContactStatusStore;
pub use system::SystemState;
pub use task_queue::TaskQueue;
pub use types::{
    Aor, Contact, ContactStatus, Endpoint, ReachabilityState, contact_short_status_label, contact_status_label,
};
