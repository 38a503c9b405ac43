//! Qualification engine
//!
//! [`QualifyEngine`] owns every process-wide piece of the qualify subsystem
//! and wires them together:
//!
//! ```text
//!            registry events
//!                  │
//!                  ▼
//!        ┌─────────────────────┐        ┌────────────────────┐
//!        │ LifecycleReconciler │───────▶│  QualifyScheduler  │
//!        └─────────────────────┘        └────────────────────┘
//!                  │                              │ timer fires
//!                  ▼                              ▼
//!        ┌─────────────────────┐  push   ┌────────────────────┐
//!        │  ContactStatusStore │◀────────│   ProbeDispatcher  │──▶ SipStack
//!        └─────────────────────┘ result  └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_qualify_core::{QualifyConfig, QualifyEngineBuilder, MemoryRegistry};
//! # use rvoip_qualify_core::{SipStack, ExtensionLookup};
//! # async fn example(stack: Arc<dyn SipStack>, dialplan: Arc<dyn ExtensionLookup>) -> rvoip_qualify_core::Result<()> {
//! let registry = Arc::new(MemoryRegistry::new());
//!
//! let engine = QualifyEngineBuilder::new()
//!     .with_config(QualifyConfig::default())
//!     .with_registry(registry)
//!     .with_stack(stack)
//!     .with_extensions(dialplan)
//!     .build()
//!     .await?;
//!
//! engine.start().await?;
//! // ...
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::QualifyConfig;
use crate::error::{QualifyError, Result};
use crate::management::QualifyManagement;
use crate::probe::{ExtensionLookup, OptionsResponder, ProbeDispatcher};
use crate::reconciler::LifecycleReconciler;
use crate::registry::Registry;
use crate::scheduler::{QualifyScheduler, ScheduleTable};
use crate::stack::SipStack;
use crate::status::{ContactStatusStore, PermanentContactHandler};
use crate::system::SystemState;
use crate::task_queue::TaskQueue;

/// The contact qualification subsystem
pub struct QualifyEngine {
    config: QualifyConfig,
    system: Arc<SystemState>,
    tasks: Arc<TaskQueue>,
    statuses: Arc<ContactStatusStore>,
    dispatcher: Arc<ProbeDispatcher>,
    scheduler: Arc<QualifyScheduler>,
    reconciler: Arc<LifecycleReconciler>,
    registry: Arc<dyn Registry>,
    responder: OptionsResponder,
    management: QualifyManagement,
    event_token: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl QualifyEngine {
    fn new(
        config: QualifyConfig,
        registry: Arc<dyn Registry>,
        stack: Arc<dyn SipStack>,
        extensions: Arc<dyn ExtensionLookup>,
        system: Arc<SystemState>,
    ) -> Self {
        let tasks = Arc::new(TaskQueue::new(
            "qualify",
            config.worker_count,
            config.task_queue_depth,
            config.shutdown_timeout(),
        ));
        let statuses = Arc::new(ContactStatusStore::new(registry.clone(), system.clone(), tasks.clone()));
        let table = Arc::new(ScheduleTable::new());
        let dispatcher = Arc::new(ProbeDispatcher::new(
            registry.clone(),
            stack.clone(),
            statuses.clone(),
            table.clone(),
            tasks.clone(),
        ));
        let scheduler = Arc::new(QualifyScheduler::new(
            table,
            dispatcher.clone(),
            registry.clone(),
            config.shutdown_timeout(),
        ));
        let reconciler = Arc::new(LifecycleReconciler::new(
            registry.clone(),
            statuses.clone(),
            dispatcher.clone(),
            scheduler.clone(),
            config.max_initial_qualify_time,
        ));

        let handler: Arc<dyn PermanentContactHandler> = reconciler.clone();
        statuses.set_permanent_contact_handler(Arc::downgrade(&handler));

        let responder = OptionsResponder::new(stack, extensions, system.clone(), config.ignore_uri_user_options);
        let management = QualifyManagement::new(registry.clone(), dispatcher.clone());

        Self {
            config,
            system,
            tasks,
            statuses,
            dispatcher,
            scheduler,
            reconciler,
            registry,
            responder,
            management,
            event_token: CancellationToken::new(),
            event_loop: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Start following registry changes and schedule every qualified contact
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QualifyError::TaskQueue("qualify engine already stopped".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Qualify engine already started");
            return Ok(());
        }

        // Subscribe first so nothing changing during the initial pass is missed
        let events = self.registry.subscribe();
        let handle = tokio::spawn(
            self.reconciler
                .clone()
                .run(events, self.event_token.child_token()),
        );
        *self.event_loop.lock() = Some(handle);

        if let Err(e) = self.reconciler.update_all_unqualified_endpoints().await {
            error!("Unable to update unqualified endpoints: {}", e);
        }
        self.reconciler.qualify_and_schedule_all().await?;

        info!(
            "Qualify engine started: {} contacts scheduled, {} workers",
            self.scheduler.scheduled_count(),
            self.config.worker_count
        );
        Ok(())
    }

    /// Rebuild every schedule from the registry
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading qualify schedules");
        self.reconciler.qualify_and_schedule_all().await
    }

    /// Stop timers, the event loop and the workers. Safe to call repeatedly
    /// and after a failed or partial start.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping qualify engine");

        self.event_token.cancel();
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Qualify event loop ended abnormally: {}", e);
            }
        }

        self.scheduler.shutdown().await;
        self.tasks.shutdown().await;

        info!("Qualify engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &QualifyConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<SystemState> {
        &self.system
    }

    pub fn statuses(&self) -> &Arc<ContactStatusStore> {
        &self.statuses
    }

    pub fn dispatcher(&self) -> &Arc<ProbeDispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<QualifyScheduler> {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &Arc<LifecycleReconciler> {
        &self.reconciler
    }

    /// Answers OPTIONS requests from peers
    pub fn responder(&self) -> &OptionsResponder {
        &self.responder
    }

    pub fn management(&self) -> &QualifyManagement {
        &self.management
    }

    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }
}

/// Builder for [`QualifyEngine`]
pub struct QualifyEngineBuilder {
    config: Option<QualifyConfig>,
    registry: Option<Arc<dyn Registry>>,
    stack: Option<Arc<dyn SipStack>>,
    extensions: Option<Arc<dyn ExtensionLookup>>,
    system: Option<Arc<SystemState>>,
}

impl QualifyEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
            stack: None,
            extensions: None,
            system: None,
        }
    }

    pub fn with_config(mut self, config: QualifyConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_stack(mut self, stack: Arc<dyn SipStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Dialplan used to validate inbound OPTIONS
    pub fn with_extensions(mut self, extensions: Arc<dyn ExtensionLookup>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Share the host's lifecycle flags; a private instance is used otherwise
    pub fn with_system(mut self, system: Arc<SystemState>) -> Self {
        self.system = Some(system);
        self
    }

    /// Build the engine. Must be called within a tokio runtime.
    pub async fn build(self) -> Result<QualifyEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let registry = self
            .registry
            .ok_or_else(|| QualifyError::Config("Registry not provided".to_string()))?;
        let stack = self
            .stack
            .ok_or_else(|| QualifyError::Config("SIP stack not provided".to_string()))?;
        let extensions = self
            .extensions
            .ok_or_else(|| QualifyError::Config("Extension lookup not provided".to_string()))?;
        let system = self.system.unwrap_or_default();

        Ok(QualifyEngine::new(config, registry, stack, extensions, system))
    }
}

impl Default for QualifyEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
