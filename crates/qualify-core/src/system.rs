//! Process lifecycle flags shared with the rest of the server

use std::sync::atomic::{AtomicBool, Ordering};

/// Startup and shutdown state of the hosting process
#[derive(Debug, Default)]
pub struct SystemState {
    fully_booted: AtomicBool,
    shutting_down: AtomicBool,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once every module finished loading
    pub fn mark_fully_booted(&self) {
        self.fully_booted.store(true, Ordering::SeqCst);
    }

    pub fn is_fully_booted(&self) -> bool {
        self.fully_booted.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
