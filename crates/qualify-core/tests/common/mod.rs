//! Shared test fixtures: a scripted SIP stack and engine harness

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use rvoip_qualify_core::{
    CapabilityHeader, Endpoint, ExtensionLookup, MemoryRegistry, OutboundRequest, OutboundResponse,
    PendingTransaction, QualifyConfig, QualifyEngine, QualifyEngineBuilder, SipStack, StackError, SystemState,
    TransactionOutcome,
};
use rvoip_qualify_core::stack::StackResult;

/// How the scripted stack treats probes to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Answer with the status code after a short delay
    Respond(u16),
    /// Report a timeout once the transaction timeout elapsed
    Timeout,
    /// Refuse to send
    FailSend,
    /// Keep the transaction open until released by the test
    Hold,
}

#[derive(Debug, Clone)]
pub struct SentProbe {
    pub target: String,
    pub endpoint: String,
    pub outbound_proxy: Option<String>,
    pub timeout: Duration,
    pub at: Instant,
}

/// SIP stack double recording every probe
pub struct ScriptedStack {
    default_mode: Mutex<ProbeMode>,
    modes: Mutex<HashMap<String, ProbeMode>>,
    sent: Mutex<Vec<SentProbe>>,
    held: Mutex<Vec<oneshot::Sender<TransactionOutcome>>>,
    responses: Mutex<Vec<(String, OutboundResponse)>>,
}

impl ScriptedStack {
    pub fn new(default_mode: ProbeMode) -> Self {
        Self {
            default_mode: Mutex::new(default_mode),
            modes: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, target: &str, mode: ProbeMode) {
        self.modes.lock().insert(target.to_string(), mode);
    }

    pub fn sent(&self) -> Vec<SentProbe> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, target: &str) -> Vec<SentProbe> {
        self.sent
            .lock()
            .iter()
            .filter(|probe| probe.target == target)
            .cloned()
            .collect()
    }

    /// Complete every held transaction with the outcome
    pub fn release_held(&self, outcome: TransactionOutcome) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let count = held.len();
        for sender in held {
            let _ = sender.send(outcome.clone());
        }
        count
    }

    fn mode_for(&self, target: &str) -> ProbeMode {
        self.modes
            .lock()
            .get(target)
            .copied()
            .unwrap_or(*self.default_mode.lock())
    }
}

impl SipStack for ScriptedStack {
    fn send_out_of_dialog(
        &self,
        request: OutboundRequest,
        _endpoint: &Endpoint,
        timeout: Duration,
    ) -> StackResult<PendingTransaction> {
        let mode = self.mode_for(&request.target);
        if mode == ProbeMode::FailSend {
            return Err(StackError::Send(format!("no route to {}", request.target)));
        }

        self.sent.lock().push(SentProbe {
            target: request.target.clone(),
            endpoint: request.endpoint.clone(),
            outbound_proxy: request.outbound_proxy.clone(),
            timeout,
            at: Instant::now(),
        });

        let (tx, rx) = oneshot::channel();
        match mode {
            ProbeMode::Respond(status_code) => {
                tokio::spawn(async move {
                    // Wall clock delay so the measured round trip is non-zero
                    std::thread::sleep(Duration::from_millis(2));
                    let _ = tx.send(TransactionOutcome::Response { status_code });
                });
            }
            ProbeMode::Timeout => {
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(TransactionOutcome::Timeout);
                });
            }
            ProbeMode::Hold => self.held.lock().push(tx),
            ProbeMode::FailSend => unreachable!(),
        }
        Ok(rx)
    }

    fn capability(&self, header: CapabilityHeader) -> Option<String> {
        match header {
            CapabilityHeader::Allow => Some("OPTIONS, INVITE, ACK, BYE, CANCEL".to_string()),
            _ => None,
        }
    }

    fn send_response(&self, request_id: &str, response: OutboundResponse) -> StackResult<()> {
        self.responses.lock().push((request_id.to_string(), response));
        Ok(())
    }
}

/// Dialplan knowing a fixed set of extensions in every context
pub struct StaticDialplan(pub Vec<&'static str>);

impl ExtensionLookup for StaticDialplan {
    fn exists_extension(&self, _context: &str, exten: &str) -> bool {
        self.0.contains(&exten)
    }
}

pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub stack: Arc<ScriptedStack>,
    pub system: Arc<SystemState>,
    pub engine: QualifyEngine,
}

pub async fn harness(config: QualifyConfig, mode: ProbeMode) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    harness_with(registry, config, mode).await
}

pub async fn harness_with(registry: Arc<MemoryRegistry>, config: QualifyConfig, mode: ProbeMode) -> Harness {
    let stack = Arc::new(ScriptedStack::new(mode));
    let system = Arc::new(SystemState::new());

    let engine = QualifyEngineBuilder::new()
        .with_config(config)
        .with_registry(registry.clone())
        .with_stack(stack.clone())
        .with_extensions(Arc::new(StaticDialplan(vec!["1000"])))
        .with_system(system.clone())
        .build()
        .await
        .expect("engine builds");

    Harness {
        registry,
        stack,
        system,
        engine,
    }
}

/// Let spawned tasks run without advancing the paused clock
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

/// Yield until the condition holds, failing after a bounded number of rounds
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("timed out waiting for {}", what);
}
