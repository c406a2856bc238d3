// ABOUTME: Scripted in-memory Transport, Session, and Prompter implementations.
// ABOUTME: Tests script per-host connect outcomes and per-command channel events.

use async_trait::async_trait;
use fanout::negotiate::Prompter;
use fanout::target::ConnectionDescriptor;
use fanout::transport::{ChannelEvent, CommandChannel, FailureReason, Session, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared observation point into one mock session's lifetime.
#[derive(Clone, Default)]
pub struct SessionProbe {
    pub commands: Arc<Mutex<Vec<String>>>,
    pub inputs: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closes: Arc<AtomicUsize>,
}

impl SessionProbe {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn input_strings(&self) -> Vec<String> {
        self.inputs
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }
}

/// Counts how many mock channels are mid-command at the same moment, so
/// tests can observe whether executions overlapped.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneously executing commands seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// One scripted command: the events its channel will deliver, in order.
pub struct MockSession {
    scripts: VecDeque<Vec<ChannelEvent>>,
    hang: bool,
    gauge: Option<ConcurrencyGauge>,
    probe: SessionProbe,
}

impl MockSession {
    /// Session whose every command immediately exits with `status`.
    pub fn exiting(status: u32) -> (Self, SessionProbe) {
        Self::scripted(vec![vec![ChannelEvent::Exit(status)]])
    }

    /// Session delivering the given event scripts, one per opened command.
    /// Commands opened beyond the script exit 0 with no output.
    pub fn scripted(scripts: Vec<Vec<ChannelEvent>>) -> (Self, SessionProbe) {
        let probe = SessionProbe::default();
        (
            Self {
                scripts: scripts.into(),
                hang: false,
                gauge: None,
                probe: probe.clone(),
            },
            probe,
        )
    }

    /// Session whose commands never finish on their own; their channels
    /// only return once the run is cancelled.
    pub fn hanging() -> (Self, SessionProbe) {
        let probe = SessionProbe::default();
        (
            Self {
                scripts: VecDeque::new(),
                hang: true,
                gauge: None,
                probe: probe.clone(),
            },
            probe,
        )
    }

    /// Session whose command holds `gauge` across a short await before
    /// exiting 0, making overlapping executions visible.
    pub fn gauged(gauge: ConcurrencyGauge) -> (Self, SessionProbe) {
        let probe = SessionProbe::default();
        (
            Self {
                scripts: vec![vec![ChannelEvent::Exit(0)]].into(),
                hang: false,
                gauge: Some(gauge),
                probe: probe.clone(),
            },
            probe,
        )
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open_command(
        &mut self,
        command: &str,
    ) -> fanout::transport::Result<Box<dyn CommandChannel>> {
        self.probe.commands.lock().push(command.to_string());
        let events = self.scripts.pop_front().unwrap_or_else(|| {
            if self.hang {
                Vec::new()
            } else {
                vec![ChannelEvent::Exit(0)]
            }
        });
        Ok(Box::new(MockChannel {
            events: events.into(),
            hang: self.hang,
            gauge: self.gauge.clone(),
            inputs: Arc::clone(&self.probe.inputs),
        }))
    }

    async fn close(&mut self) -> fanout::transport::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
    gauge: Option<ConcurrencyGauge>,
    inputs: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn next_event(&mut self) -> fanout::transport::Result<Option<ChannelEvent>> {
        if let Some(gauge) = self.gauge.take() {
            let now = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gauge.active.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if self.hang {
            return std::future::pending().await;
        }
        Ok(None)
    }

    async fn send_input(&mut self, data: &[u8]) -> fanout::transport::Result<()> {
        self.inputs.lock().push(data.to_vec());
        Ok(())
    }
}

/// What one connect attempt against a host should produce.
pub enum ConnectStep {
    Fail(FailureReason),
    Succeed(MockSession),
}

impl ConnectStep {
    pub fn session_exiting(status: u32) -> (Self, SessionProbe) {
        let (session, probe) = MockSession::exiting(status);
        (ConnectStep::Succeed(session), probe)
    }
}

/// Transport that replays scripted outcomes per host and records every
/// descriptor it was asked to connect with.
#[derive(Default)]
pub struct MockTransport {
    steps: Mutex<HashMap<String, VecDeque<ConnectStep>>>,
    attempts: Mutex<Vec<ConnectionDescriptor>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, host: &str, step: ConnectStep) {
        self.steps
            .lock()
            .entry(host.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn script_all(&self, host: &str, steps: Vec<ConnectStep>) {
        self.steps
            .lock()
            .entry(host.to_string())
            .or_default()
            .extend(steps);
    }

    /// Every descriptor passed to `connect`, in call order.
    pub fn attempts(&self) -> Vec<ConnectionDescriptor> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, host: &str) -> Vec<ConnectionDescriptor> {
        self.attempts
            .lock()
            .iter()
            .filter(|d| d.host == host)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> fanout::transport::Result<Box<dyn Session>> {
        self.attempts.lock().push(descriptor.clone());
        let step = self
            .steps
            .lock()
            .get_mut(&descriptor.host)
            .and_then(|queue| queue.pop_front());
        match step {
            Some(ConnectStep::Succeed(session)) => Ok(Box::new(session)),
            Some(ConnectStep::Fail(reason)) => Err(reason),
            None => Err(FailureReason::Network(format!(
                "no scripted outcome for {}",
                descriptor.host
            ))),
        }
    }
}

/// Prompter replaying canned confirmation answers and secrets.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: Mutex<VecDeque<bool>>,
    secrets: Mutex<VecDeque<String>>,
    confirm_log: Mutex<Vec<String>>,
    secret_log: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm_with(self, answers: Vec<bool>) -> Self {
        *self.confirms.lock() = answers.into();
        self
    }

    pub fn secrets_with(self, secrets: Vec<&str>) -> Self {
        *self.secrets.lock() = secrets.into_iter().map(str::to_string).collect();
        self
    }

    pub fn confirm_count(&self) -> usize {
        self.confirm_log.lock().len()
    }

    pub fn secret_count(&self) -> usize {
        self.secret_log.lock().len()
    }

    pub fn secret_prompts(&self) -> Vec<String> {
        self.secret_log.lock().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, message: &str) -> std::io::Result<bool> {
        self.confirm_log.lock().push(message.to_string());
        Ok(self.confirms.lock().pop_front().unwrap_or(false))
    }

    async fn secret(&self, prompt: &str) -> std::io::Result<String> {
        self.secret_log.lock().push(prompt.to_string());
        self.secrets.lock().pop_front().ok_or_else(|| {
            std::io::Error::other(format!("no scripted secret for prompt: {prompt}"))
        })
    }
}
