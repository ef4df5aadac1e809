//! Scripted transports and manager wiring shared by the integration tests

#![allow(dead_code)]

use appliance_harness::provision::MemoryBackend;
use appliance_harness::{
    Command, ExecutionResult, InstanceId, Transport, TransportError, TransportFactory, VmAddress,
    VmManager,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TICK: Duration = Duration::from_millis(10);

/// Responses every transport built from it replays in order
pub struct Script {
    queued: Mutex<VecDeque<Result<ExecutionResult, TransportError>>>,
    fallback: Result<ExecutionResult, TransportError>,
    commands: Mutex<Vec<String>>,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

impl Script {
    /// Every command succeeds with empty output
    pub fn succeeding() -> Arc<Self> {
        Self::with_fallback(Ok(ExecutionResult::new(0, "", None)))
    }

    /// Responses used once the queue is exhausted
    pub fn with_fallback(fallback: Result<ExecutionResult, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            commands: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, response: Result<ExecutionResult, TransportError>) {
        self.queued.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub struct ScriptedTransport(Arc<Script>);

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&mut self, command: &Command) -> Result<ExecutionResult, TransportError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0
            .commands
            .lock()
            .unwrap()
            .push(command.to_shell_string());

        let next = self.0.queued.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.0.fallback.clone())
    }

    async fn close(&mut self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn factory(script: &Arc<Script>) -> Arc<dyn TransportFactory> {
    let script = script.clone();
    Arc::new(
        move |_: &InstanceId, _: &VmAddress| -> Box<dyn Transport> {
            Box::new(ScriptedTransport(script.clone()))
        },
    )
}

pub fn manager(backend: &MemoryBackend, script: &Arc<Script>) -> VmManager {
    VmManager::new(Arc::new(backend.clone()), factory(script)).with_probe_interval(TICK)
}

pub fn context(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn refused() -> TransportError {
    TransportError::ConnectionRefused {
        host: "10.0.0.1".into(),
        reason: "ssh: connect to host 10.0.0.1 port 22: Connection refused".into(),
    }
}
