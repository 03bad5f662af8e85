//! Recording session orchestration
//!
//! The [`Recorder`] owns the attached sources and moves them through one
//! session at a time:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!            \____________________/
//!              (failure before running)
//! ```
//!
//! Sources report back through an internal channel. Synchronous signals sent
//! from inside `prepare`, `start` or `stop` are drained before those calls
//! return, so a set of sources that are ready (or done) immediately moves
//! through the states without any `.await`. Asynchronous signals are handled
//! by [`Recorder::process_next`].

use crate::config::{RecorderConfig, SpawnConfig, METADATA_ID};
use crate::error::RecorderError;
use crate::source::{Message, Source, SourceFailure, SourceId, SourceNotifier, SourceSignal};
use crate::spawn;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracefold_capture::utils::monotonic_nanos;
use tracefold_capture::{CaptureWriter, Origin, Pid, WriterOptions};
use tracing::{debug, info, warn};

/// Origin reported for failures that belong to the session, not a source
const SESSION: &str = "recorder";

/// Where a recorder is in its session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::Idle => "idle",
            RecorderState::Starting => "starting",
            RecorderState::Running => "running",
            RecorderState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    StateChanged(RecorderState),
    /// Time since the session started running
    Elapsed(Duration),
    /// First failure of the session, delivered once before `Stopped`
    Failed(SourceFailure),
    Stopped,
}

struct Attached {
    id: SourceId,
    source: Box<dyn Source>,
}

pub struct Recorder {
    config: RecorderConfig,
    writer: Option<CaptureWriter>,
    sources: Vec<Attached>,
    next_source_id: u32,

    state: RecorderState,
    stop_after_starting: bool,
    starting: Vec<SourceId>,
    stopping: Vec<SourceId>,
    finished_or_failed: Vec<SourceId>,
    failures: Vec<SourceFailure>,

    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
    observers: Vec<UnboundedSender<RecorderEvent>>,

    running_since: Option<Instant>,
    next_tick: Option<Instant>,
    child: Option<Pid>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            writer: None,
            sources: Vec::new(),
            next_source_id: 0,
            state: RecorderState::Idle,
            stop_after_starting: false,
            starting: Vec::new(),
            stopping: Vec::new(),
            finished_or_failed: Vec::new(),
            failures: Vec::new(),
            tx,
            rx,
            observers: Vec::new(),
            running_since: None,
            next_tick: None,
            child: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != RecorderState::Idle
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Failures of the current (or last) session, in arrival order
    pub fn failures(&self) -> &[SourceFailure] {
        &self.failures
    }

    /// Capture being recorded into, once one exists
    pub fn writer(&self) -> Option<&CaptureWriter> {
        self.writer.as_ref()
    }

    /// Pid of the child launched for the current session
    pub fn child_pid(&self) -> Option<Pid> {
        self.child
    }

    /// Time spent running in the current session
    pub fn elapsed(&self) -> Duration {
        self.running_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<RecorderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn add_source(&mut self, source: Box<dyn Source>) -> Result<SourceId, RecorderError> {
        self.require_idle()?;
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        debug!("Attached source {} ({})", source.name(), id);
        self.sources.push(Attached { id, source });
        Ok(id)
    }

    pub fn add_pid(&mut self, pid: Pid) -> Result<(), RecorderError> {
        self.require_idle()?;
        if pid < 0 {
            return Err(RecorderError::InvalidPid(pid));
        }
        if !self.config.pids.contains(&pid) {
            self.config.pids.push(pid);
        }
        Ok(())
    }

    pub fn remove_pid(&mut self, pid: Pid) -> Result<(), RecorderError> {
        self.require_idle()?;
        if pid < 0 {
            return Err(RecorderError::InvalidPid(pid));
        }
        self.config.pids.retain(|p| *p != pid);
        Ok(())
    }

    pub fn set_whole_system(&mut self, whole_system: bool) -> Result<(), RecorderError> {
        self.require_idle()?;
        self.config.whole_system = whole_system;
        Ok(())
    }

    pub fn set_spawn(&mut self, spawn: Option<SpawnConfig>) -> Result<(), RecorderError> {
        self.require_idle()?;
        self.config.spawn = spawn;
        Ok(())
    }

    /// Record into `writer` instead of an anonymous capture
    pub fn set_writer(&mut self, writer: CaptureWriter) -> Result<(), RecorderError> {
        self.require_idle()?;
        self.writer = Some(writer);
        Ok(())
    }

    fn require_idle(&self) -> Result<(), RecorderError> {
        match self.state {
            RecorderState::Idle => Ok(()),
            state => Err(RecorderError::NotIdle(state)),
        }
    }

    /// Begin a session. Fails without side effects unless idle.
    pub fn start(&mut self) -> Result<(), RecorderError> {
        self.require_idle()?;
        self.config
            .validate()
            .map_err(|e| RecorderError::Config(e.to_string()))?;

        let writer = match self.writer.clone() {
            Some(writer) => writer,
            None => {
                let options = WriterOptions::with_buffer_size(self.config.writer_buffer_size);
                let writer = CaptureWriter::anonymous(options)?;
                self.writer = Some(writer.clone());
                writer
            }
        };

        self.failures.clear();
        self.starting.clear();
        self.stopping.clear();
        self.finished_or_failed.clear();
        self.stop_after_starting = false;
        self.running_since = None;
        self.next_tick = None;
        self.child = None;
        self.set_state(RecorderState::Starting);
        info!("Starting recording with {} sources", self.sources.len());

        let mut pids = self.config.pids.clone();
        if let Some(mut spawn_config) = self.config.spawn.clone() {
            for attached in &mut self.sources {
                attached.source.modify_spawn(&mut spawn_config);
            }
            match spawn::spawn_child(&spawn_config, self.tx.clone()) {
                Ok(pid) => {
                    self.child = Some(pid);
                    pids.push(pid);
                }
                Err(e) => {
                    warn!("{}", e);
                    self.failures.push(SourceFailure::new(SESSION, e.to_string()));
                }
            }
        }

        for attached in &mut self.sources {
            if !self.config.whole_system {
                for pid in &pids {
                    attached.source.add_pid(*pid);
                }
            }
            let notifier = SourceNotifier::new(attached.id, self.tx.clone());
            attached.source.prepare(writer.clone(), notifier);
        }

        self.starting = self
            .sources
            .iter()
            .filter(|attached| !attached.source.is_ready())
            .map(|attached| attached.id)
            .collect();

        let origin = Origin::new(monotonic_nanos(), -1, -1);
        let recorded = self
            .config
            .to_metadata()
            .map_err(|e| e.to_string())
            .and_then(|json| {
                writer
                    .add_metadata(origin, METADATA_ID, &json)
                    .map_err(|e| e.to_string())
            });
        if let Err(reason) = recorded {
            warn!("Failed to record session metadata: {}", reason);
            self.failures.push(SourceFailure::new(SESSION, reason));
        }

        self.drain_pending();

        if self.state == RecorderState::Starting && self.starting.is_empty() {
            self.finish_startup();
        }
        Ok(())
    }

    /// Request the session to end.
    ///
    /// While starting, the stop is deferred until startup completes. A
    /// recorder that is idle or already stopping ignores the request.
    pub fn stop(&mut self) {
        match self.state {
            RecorderState::Starting => {
                debug!("Stop requested while starting, deferring");
                self.stop_after_starting = true;
            }
            RecorderState::Running => self.begin_stopping(),
            RecorderState::Idle | RecorderState::Stopping => {}
        }
    }

    /// Wait for and handle the next source signal or timer tick.
    ///
    /// Returns `false` once no more signals can arrive.
    pub async fn process_next(&mut self) -> bool {
        let tick = self.next_tick;
        tokio::select! {
            message = self.rx.recv() => match message {
                Some(message) => {
                    self.dispatch(message);
                    true
                }
                None => false,
            },
            _ = tokio::time::sleep_until(tick.unwrap_or_else(Instant::now)), if tick.is_some() => {
                self.tick();
                true
            }
        }
    }

    /// Drive the session until it is idle again. Returns the first failure
    /// of the session, if any.
    pub async fn run_until_stopped(&mut self) -> Result<(), RecorderError> {
        while self.state != RecorderState::Idle {
            if !self.process_next().await {
                break;
            }
        }
        match self.failures.first() {
            Some(failure) => Err(RecorderError::SourceFailed(failure.clone())),
            None => Ok(()),
        }
    }

    fn drain_pending(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Source(id, SourceSignal::Ready) => self.source_ready(id),
            Message::Source(id, SourceSignal::Finished) => self.track_completed(id),
            Message::Source(id, SourceSignal::Failed(reason)) => self.source_failed(id, reason),
            Message::ChildExited { pid, status } => {
                if self.child != Some(pid) {
                    return;
                }
                info!("Spawned process {} exited ({}), stopping", pid, status);
                self.stop();
            }
        }
    }

    fn source_ready(&mut self, id: SourceId) {
        if remove_id(&mut self.starting, id) && self.starting.is_empty() {
            self.finish_startup();
        }
    }

    fn track_completed(&mut self, id: SourceId) {
        if !self.finished_or_failed.contains(&id) {
            self.finished_or_failed.push(id);
        }

        if remove_id(&mut self.starting, id) && self.starting.is_empty() {
            self.finish_startup();
        }

        if remove_id(&mut self.stopping, id) && self.stopping.is_empty() {
            self.finish_stopping();
        }

        if self.state == RecorderState::Running && self.all_sources_done() {
            debug!("All sources completed, stopping");
            self.stop();
        }
    }

    fn source_failed(&mut self, id: SourceId, reason: String) {
        // Recorded before completion tracking so that startup and shutdown
        // finalization triggered below observe it.
        if self.state != RecorderState::Idle {
            let name = self
                .sources
                .iter()
                .find(|attached| attached.id == id)
                .map(|attached| attached.source.name().to_string())
                .unwrap_or_else(|| id.to_string());
            warn!("Source {} failed: {}", name, reason);
            self.failures.push(SourceFailure::new(name, reason));
        }

        self.track_completed(id);

        if self.state == RecorderState::Running {
            self.stop();
        }
    }

    fn all_sources_done(&self) -> bool {
        self.sources
            .iter()
            .all(|attached| self.finished_or_failed.contains(&attached.id))
    }

    fn finish_startup(&mut self) {
        if self.state != RecorderState::Starting {
            return;
        }

        if !self.failures.is_empty() {
            info!("Startup failed, stopping without running");
            self.begin_stopping();
            return;
        }

        let now = Instant::now();
        self.running_since = Some(now);
        self.next_tick = Some(now + self.config.elapsed_interval());

        for attached in &mut self.sources {
            if !self.finished_or_failed.contains(&attached.id) {
                attached.source.start();
            }
        }

        self.set_state(RecorderState::Running);
        self.drain_pending();

        if self.state == RecorderState::Running
            && (self.stop_after_starting || self.all_sources_done())
        {
            self.stop();
        }
    }

    fn begin_stopping(&mut self) {
        self.set_state(RecorderState::Stopping);
        self.next_tick = None;

        self.stopping = self
            .sources
            .iter()
            .map(|attached| attached.id)
            .filter(|id| !self.finished_or_failed.contains(id))
            .collect();

        for attached in &mut self.sources {
            if !self.finished_or_failed.contains(&attached.id) {
                attached.source.stop();
            }
        }

        self.drain_pending();

        if self.stopping.is_empty() {
            self.finish_stopping();
        }
    }

    fn finish_stopping(&mut self) {
        if self.state != RecorderState::Stopping || !self.stopping.is_empty() {
            return;
        }

        if let Some(writer) = &self.writer {
            match writer.create_reader() {
                Ok(mut reader) => {
                    for attached in &mut self.sources {
                        reader.reset();
                        if let Err(e) = attached.source.supplement(&mut reader) {
                            warn!("Source {} failed to supplement: {}", attached.source.name(), e);
                        }
                    }
                }
                Err(e) => warn!("Failed to open capture for supplements: {}", e),
            }
            if let Err(e) = writer.flush() {
                warn!("Failed to flush capture: {}", e);
            }
        }

        if let Some(failure) = self.failures.first().cloned() {
            self.emit(RecorderEvent::Failed(failure));
        }

        info!(
            "Recording stopped after {:?} ({} failures)",
            self.elapsed(),
            self.failures.len()
        );
        self.running_since = None;
        self.set_state(RecorderState::Idle);
        self.emit(RecorderEvent::Stopped);
    }

    fn tick(&mut self) {
        if self.state != RecorderState::Running {
            self.next_tick = None;
            return;
        }
        let interval = self.config.elapsed_interval();
        self.next_tick = self.next_tick.map(|deadline| deadline + interval);
        self.emit(RecorderEvent::Elapsed(self.elapsed()));
    }

    fn set_state(&mut self, state: RecorderState) {
        if self.state != state {
            debug!("Recorder {} -> {}", self.state, state);
            self.state = state;
            self.emit(RecorderEvent::StateChanged(state));
        }
    }

    fn emit(&mut self, event: RecorderEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn remove_id(ids: &mut Vec<SourceId>, id: SourceId) -> bool {
    match ids.iter().position(|candidate| *candidate == id) {
        Some(index) => {
            ids.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl Source for Idle {
        fn name(&self) -> &str {
            "idle"
        }
        fn prepare(&mut self, _writer: CaptureWriter, _notifier: SourceNotifier) {}
        fn start(&mut self) {}
        fn stop(&mut self) {}
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RecorderState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_settings_require_idle() {
        let mut recorder = Recorder::default();
        recorder.add_source(Box::new(Idle)).unwrap();
        recorder.start().unwrap();
        assert_eq!(recorder.state(), RecorderState::Running);

        assert!(matches!(
            recorder.add_pid(5),
            Err(RecorderError::NotIdle(RecorderState::Running))
        ));
        assert!(recorder.set_whole_system(true).is_err());
        assert!(recorder.add_source(Box::new(Idle)).is_err());
    }

    #[test]
    fn test_pid_bookkeeping() {
        let mut recorder = Recorder::default();
        assert!(matches!(recorder.add_pid(-1), Err(RecorderError::InvalidPid(-1))));
        recorder.add_pid(0).unwrap();
        recorder.add_pid(10).unwrap();
        recorder.add_pid(10).unwrap();
        assert_eq!(recorder.config().pids, vec![0, 10]);
        recorder.remove_pid(0).unwrap();
        assert_eq!(recorder.config().pids, vec![10]);
    }

    #[test]
    fn test_remove_id() {
        let mut ids = vec![SourceId(1), SourceId(2)];
        assert!(remove_id(&mut ids, SourceId(1)));
        assert!(!remove_id(&mut ids, SourceId(1)));
        assert_eq!(ids, vec![SourceId(2)]);
    }
}
