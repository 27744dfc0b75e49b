//! Live reading-practice session management
//!
//! One `LiveSessionManager` owns at most one real-time voice session: the
//! microphone, the capture graph, the output clock, the network session and
//! the Playback Queue. Every asynchronous completion reaches it as a
//! `SessionEvent` tagged with the epoch it was started under, so work that
//! outlives a stop is recognised and discarded.

use crate::audio::codec::{self, sample_rate_of};
use crate::audio::host::{AudioError, AudioHost, BlockSink, CaptureGraph, EndedSink, Microphone, OutputClock, PlaybackId};
use crate::audio::PlaybackQueue;
use crate::config::Config;
use crate::live::protocol::InlineData;
use crate::live::{LiveConnection, LiveConnector, LiveSender, LiveSetup, ServerMessage, TransportError, TransportEvent};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub mod status {
    pub const READY: &str = "Siap untuk memulai latihan.";
    pub const REQUESTING_MICROPHONE: &str = "Meminta izin mikrofon...";
    pub const CONNECTING: &str = "Menghubungkan ke server AI...";
    pub const LISTENING: &str = "Mendengarkan... Silakan mulai berbicara dalam bahasa Arab.";
    pub const FINISHED: &str = "Latihan selesai. Anda dapat memulai lagi.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        }
    }
}

/// Everything that can end a session. Rendered as status text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Koneksi gagal: Kunci API Google AI tidak dikonfigurasi.")]
    Configuration,
    #[error("Gagal mengakses mikrofon. Pastikan Anda telah memberikan izin. ({0})")]
    PermissionDenied(String),
    #[error("Perangkat audio tidak dapat digunakan: {0}")]
    Device(String),
    #[error("Terjadi kesalahan koneksi: {0}")]
    Connection(String),
    #[error("Koneksi ditutup (code: {}){}. Silakan mulai lagi.", close_code(.code), close_reason(.reason))]
    RemoteClosed { code: Option<u16>, reason: String },
    #[error("Gagal memutar audio: {0}")]
    Playback(String),
}

fn close_code(code: &Option<u16>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
}

fn close_reason(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(" {}", reason)
    }
}

/// Fixed parameters of every session a manager opens
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub setup: LiveSetup,
    pub block_size: usize,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
}

impl SessionOptions {
    pub fn from_config(config: &Config, system_instruction: &str) -> Self {
        Self {
            setup: LiveSetup {
                model: config.live_model.clone(),
                voice: config.live_voice.clone(),
                system_instruction: system_instruction.to_string(),
                transcribe_input: true,
                transcribe_output: true,
            },
            block_size: config.capture_block_size,
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            output_channels: 1,
        }
    }
}

/// Accumulated transcripts of the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// What the learner read
    pub user: String,
    /// What the coach said back
    pub feedback: String,
}

impl Transcript {
    fn apply_text(&mut self, message: &ServerMessage) {
        if let Some(text) = message.input_text() {
            self.user.push_str(text);
        }
        if let Some(text) = message.output_text() {
            self.feedback.push_str(text);
        }
    }

    fn complete_turn(&mut self) {
        self.feedback.push('\n');
    }

    fn clear(&mut self) {
        self.user.clear();
        self.feedback.clear();
    }
}

/// Observable state published after every event
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: String,
    pub transcript: Transcript,
    pub last_error: Option<SessionError>,
    pub scheduled_buffers: usize,
}

/// Messages consumed by the manager, in arrival order
pub enum SessionEvent {
    Start,
    Stop,
    Shutdown,
    MicrophoneReady {
        epoch: u64,
        result: Result<Box<dyn Microphone>, AudioError>,
    },
    TransportReady {
        epoch: u64,
        result: Result<Box<dyn LiveSender>, TransportError>,
    },
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    CaptureBlock {
        epoch: u64,
        samples: Vec<f32>,
    },
    PlaybackEnded {
        epoch: u64,
        id: PlaybackId,
    },
}

/// Resources owned by one session; released together by `teardown`
#[derive(Default)]
struct SessionHandle {
    microphone: Option<Box<dyn Microphone>>,
    capture: Option<Box<dyn CaptureGraph>>,
    output: Option<Box<dyn OutputClock>>,
    sender: Option<Box<dyn LiveSender>>,
    playback: PlaybackQueue,
}

pub struct LiveSessionManager {
    host: Arc<dyn AudioHost>,
    connector: Option<Arc<dyn LiveConnector>>,
    options: SessionOptions,
    state: SessionState,
    /// Bumped on every start and teardown; stale completions carry an older one
    epoch: u64,
    handle: Option<SessionHandle>,
    transcript: Transcript,
    status: String,
    last_error: Option<SessionError>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl LiveSessionManager {
    /// `connector` is `None` when no credential is configured
    pub fn new(host: Arc<dyn AudioHost>, connector: Option<Arc<dyn LiveConnector>>, options: SessionOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = SessionSnapshot {
            state: SessionState::Idle,
            status: status::READY.to_string(),
            transcript: Transcript::default(),
            last_error: None,
            scheduled_buffers: 0,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            host,
            connector,
            options,
            state: SessionState::Idle,
            epoch: 0,
            handle: None,
            transcript: Transcript::default(),
            status: status::READY.to_string(),
            last_error: None,
            events_tx,
            events_rx,
            snapshot_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status.clone(),
            transcript: self.transcript.clone(),
            last_error: self.last_error.clone(),
            scheduled_buffers: self.handle.as_ref().map(|h| h.playback.len()).unwrap_or(0),
        }
    }

    /// Run the manager on its own task
    pub fn spawn(self) -> (SessionController, JoinHandle<()>) {
        let controller = SessionController {
            inner: Arc::new(ControllerInner {
                events: self.events_tx.clone(),
                snapshots: self.snapshot_tx.subscribe(),
            }),
        };
        let task = tokio::spawn(self.run());
        (controller, task)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        debug!("Session manager stopped");
    }

    /// Apply one event. Returns false once the manager should exit.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        let keep_running = match event {
            SessionEvent::Start => {
                self.start_session();
                true
            }
            SessionEvent::Stop => {
                self.stop_session();
                true
            }
            SessionEvent::Shutdown => {
                self.stop_session();
                false
            }
            SessionEvent::MicrophoneReady { epoch, result } => {
                self.on_microphone(epoch, result);
                true
            }
            SessionEvent::TransportReady { epoch, result } => {
                self.on_transport_ready(epoch, result);
                true
            }
            SessionEvent::Transport { epoch, event } => {
                self.on_transport_event(epoch, event);
                true
            }
            SessionEvent::CaptureBlock { epoch, samples } => {
                self.on_capture_block(epoch, samples);
                true
            }
            SessionEvent::PlaybackEnded { epoch, id } => {
                if epoch == self.epoch {
                    if let Some(handle) = self.handle.as_mut() {
                        handle.playback.finished(id);
                    }
                }
                true
            }
        };
        self.snapshot_tx.send_replace(self.snapshot());
        keep_running
    }

    /// Begin a session. A no-op while one is connecting or open.
    pub fn start_session(&mut self) {
        if self.state != SessionState::Idle {
            debug!("Start ignored, session is {}", self.state.as_str());
            return;
        }

        self.last_error = None;
        if self.connector.is_none() {
            error!("No Gemini API key configured; cannot start a live session");
            self.fail(SessionError::Configuration);
            return;
        }

        self.epoch += 1;
        self.state = SessionState::Connecting;
        self.handle = Some(SessionHandle::default());
        self.transcript.clear();
        self.status = status::REQUESTING_MICROPHONE.to_string();
        info!("Starting live session (epoch {})", self.epoch);

        let epoch = self.epoch;
        let host = self.host.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = host.request_microphone().await;
            let _ = tx.send(SessionEvent::MicrophoneReady { epoch, result });
        });
    }

    /// End the session from any state. Safe to call repeatedly.
    pub fn stop_session(&mut self) {
        if self.state == SessionState::Idle && self.handle.is_none() {
            return;
        }
        info!("Stopping live session (epoch {})", self.epoch);
        self.status = status::FINISHED.to_string();
        self.teardown();
    }

    fn fail(&mut self, err: SessionError) {
        match &err {
            SessionError::Configuration => {}
            SessionError::RemoteClosed { .. } | SessionError::Connection(_) => warn!("Live session ended: {:?}", err),
            _ => error!("Live session failed: {:?}", err),
        }
        self.status = err.to_string();
        self.last_error = Some(err);
        self.teardown();
    }

    /// Release every resource independently; failures are logged, never returned
    fn teardown(&mut self) {
        self.state = SessionState::Closing;
        self.epoch += 1;

        let mut failures: Vec<String> = Vec::new();
        if let Some(mut handle) = self.handle.take() {
            if let Some(mut mic) = handle.microphone.take() {
                mic.stop();
            }
            if let Some(mut capture) = handle.capture.take() {
                capture.disconnect();
                if let Err(e) = capture.close() {
                    failures.push(format!("input clock: {}", e));
                }
            }
            if let Some(mut sender) = handle.sender.take() {
                if let Err(e) = sender.close() {
                    failures.push(format!("network session: {}", e));
                }
            }
            handle.playback.clear(handle.output.as_deref_mut());
            if let Some(mut output) = handle.output.take() {
                if let Err(e) = output.close() {
                    failures.push(format!("output clock: {}", e));
                }
            }
        }

        for failure in &failures {
            warn!("Teardown step failed: {}", failure);
        }
        self.state = SessionState::Idle;
        debug!("Live session resources released");
    }

    fn on_microphone(&mut self, epoch: u64, result: Result<Box<dyn Microphone>, AudioError>) {
        if epoch != self.epoch || self.state != SessionState::Connecting {
            if let Ok(mut mic) = result {
                debug!("Releasing microphone granted after stop");
                mic.stop();
            }
            return;
        }

        let mic = match result {
            Ok(mic) => mic,
            Err(e) => {
                self.fail(SessionError::PermissionDenied(e.to_string()));
                return;
            }
        };
        let Some(connector) = self.connector.clone() else {
            self.fail(SessionError::Configuration);
            return;
        };

        info!("Microphone '{}' granted", mic.name());
        if let Some(handle) = self.handle.as_mut() {
            handle.microphone = Some(mic);
        }
        self.status = status::CONNECTING.to_string();

        let setup = self.options.setup.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            match connector.connect(&setup).await {
                Ok(LiveConnection { sender, mut events }) => {
                    if tx.send(SessionEvent::TransportReady { epoch, result: Ok(sender) }).is_err() {
                        return;
                    }
                    while let Some(event) = events.recv().await {
                        if tx.send(SessionEvent::Transport { epoch, event }).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(SessionEvent::TransportReady { epoch, result: Err(e) });
                }
            }
        });
    }

    fn on_transport_ready(&mut self, epoch: u64, result: Result<Box<dyn LiveSender>, TransportError>) {
        // Stopped while connecting: close what arrived and build nothing.
        if epoch != self.epoch || self.state != SessionState::Connecting {
            if let Ok(mut sender) = result {
                debug!("Closing live session that opened after stop");
                if let Err(e) = sender.close() {
                    warn!("Failed to close abandoned live session: {}", e);
                }
            }
            return;
        }

        let sender = match result {
            Ok(sender) => sender,
            Err(e) => {
                self.fail(SessionError::Connection(e.to_string()));
                return;
            }
        };

        let ended_tx = self.events_tx.clone();
        let ended: EndedSink = Arc::new(move |id| {
            let _ = ended_tx.send(SessionEvent::PlaybackEnded { epoch, id });
        });
        let block_tx = self.events_tx.clone();
        let sink: BlockSink = Arc::new(move |samples| {
            let _ = block_tx.send(SessionEvent::CaptureBlock { epoch, samples });
        });

        let host = self.host.clone();
        let options = self.options.clone();
        let setup = match self.handle.as_mut() {
            Some(handle) => {
                handle.sender = Some(sender);
                host.open_output(options.output_sample_rate, options.output_channels, ended)
                    .and_then(|output| {
                        handle.output = Some(output);
                        let mic = handle.microphone.as_deref().ok_or(AudioError::Closed)?;
                        host.build_capture(mic, options.block_size, options.input_sample_rate, sink)
                    })
                    .map(|capture| handle.capture = Some(capture))
            }
            None => Err(AudioError::Closed),
        };

        if let Err(e) = setup {
            self.fail(SessionError::Device(e.to_string()));
            return;
        }

        self.state = SessionState::Open;
        self.status = status::LISTENING.to_string();
        info!("Live session open, streaming microphone");
    }

    fn on_capture_block(&mut self, epoch: u64, samples: Vec<f32>) {
        // Audio captured while not recording is dropped, not buffered.
        if epoch != self.epoch || self.state != SessionState::Open {
            trace!("Dropping {} samples captured outside an open session", samples.len());
            return;
        }
        let Some(sender) = self.handle.as_mut().and_then(|h| h.sender.as_mut()) else {
            return;
        };

        let chunk = codec::encode_for_transport(&samples);
        if let Err(e) = sender.send_audio(&chunk) {
            self.fail(SessionError::Connection(e.to_string()));
        }
    }

    fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        let current = epoch == self.epoch;
        match event {
            TransportEvent::Message(message) => {
                if current && self.state == SessionState::Open {
                    self.on_server_message(message);
                }
            }
            TransportEvent::Closed { code, reason } => {
                if current && self.state == SessionState::Open {
                    self.fail(SessionError::RemoteClosed { code, reason });
                } else {
                    debug!("Live session closed during teardown (code {:?})", code);
                }
            }
            TransportEvent::Error(e) => {
                if current && self.state != SessionState::Idle {
                    self.fail(SessionError::Connection(e));
                } else {
                    debug!("Ignoring error from finished session: {}", e);
                }
            }
        }
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        self.transcript.apply_text(&message);
        if message.interrupted() {
            if let Some(handle) = self.handle.as_mut() {
                debug!("Reply interrupted, dropping {} queued buffers", handle.playback.len());
                handle.playback.clear(handle.output.as_deref_mut());
            }
        }
        for part in message.audio_parts() {
            self.play(part);
        }
        if message.turn_complete() {
            self.transcript.complete_turn();
        }
        if let Some(go_away) = &message.go_away {
            warn!("Server will close the session soon (time left {:?})", go_away.time_left);
        }
    }

    /// Decode one inbound chunk and queue it behind everything already playing.
    /// Failures only skip this chunk.
    fn play(&mut self, data: &InlineData) {
        let rate = data
            .mime_type
            .as_deref()
            .and_then(sample_rate_of)
            .unwrap_or(self.options.output_sample_rate);
        let buffer = match codec::decode_from_transport(&data.data, rate, self.options.output_channels) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Skipping reply audio: {:?}", SessionError::Playback(e.to_string()));
                return;
            }
        };

        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let Some(clock) = handle.output.as_deref_mut() else {
            return;
        };
        match handle.playback.enqueue(clock, buffer) {
            Ok(start) => trace!("Scheduled reply audio at {:.3}s", start),
            Err(e) => warn!("Reply audio not scheduled: {:?}", SessionError::Playback(e.to_string())),
        }
    }
}

struct ControllerInner {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // Last controller gone: release everything.
        let _ = self.events.send(SessionEvent::Shutdown);
    }
}

/// Cloneable handle used by whatever drives the session
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn start(&self) {
        let _ = self.inner.events.send(SessionEvent::Start);
    }

    pub fn stop(&self) {
        let _ = self.inner.events.send(SessionEvent::Stop);
    }

    /// Stop and end the manager task
    pub fn shutdown(&self) {
        let _ = self.inner.events.send(SessionEvent::Shutdown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::AudioChunk;
    use crate::audio::queue::tests::FakeClock;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct HostLog {
        mic_requests: usize,
        mic_stops: usize,
        deny_microphone: bool,
        captures_built: usize,
        capture_disconnects: usize,
        capture_closes: usize,
        fail_capture_close: bool,
        outputs_opened: usize,
        block_sink: Option<BlockSink>,
        ended_sink: Option<EndedSink>,
    }

    #[derive(Clone, Default)]
    struct FakeHost {
        log: Arc<Mutex<HostLog>>,
        clock: FakeClock,
        mic_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    }

    struct FakeMicrophone {
        log: Arc<Mutex<HostLog>>,
    }

    impl Microphone for FakeMicrophone {
        fn name(&self) -> String {
            "fake microphone".to_string()
        }

        fn stop(&mut self) {
            self.log.lock().mic_stops += 1;
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct FakeCapture {
        log: Arc<Mutex<HostLog>>,
    }

    impl CaptureGraph for FakeCapture {
        fn disconnect(&mut self) {
            self.log.lock().capture_disconnects += 1;
        }

        fn close(&mut self) -> Result<(), AudioError> {
            let mut log = self.log.lock();
            log.capture_closes += 1;
            if log.fail_capture_close {
                return Err(AudioError::Stream("device vanished".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AudioHost for FakeHost {
        async fn request_microphone(&self) -> Result<Box<dyn Microphone>, AudioError> {
            self.log.lock().mic_requests += 1;
            let gate = self.mic_gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.log.lock().deny_microphone {
                return Err(AudioError::PermissionDenied("denied by user".to_string()));
            }
            Ok(Box::new(FakeMicrophone { log: self.log.clone() }))
        }

        fn build_capture(
            &self,
            _microphone: &dyn Microphone,
            _block_size: usize,
            _sample_rate: u32,
            sink: BlockSink,
        ) -> Result<Box<dyn CaptureGraph>, AudioError> {
            let mut log = self.log.lock();
            log.captures_built += 1;
            log.block_sink = Some(sink);
            Ok(Box::new(FakeCapture { log: self.log.clone() }))
        }

        fn open_output(&self, _sample_rate: u32, _channels: u16, ended: EndedSink) -> Result<Box<dyn OutputClock>, AudioError> {
            let mut log = self.log.lock();
            log.outputs_opened += 1;
            log.ended_sink = Some(ended);
            Ok(Box::new(self.clock.clone()))
        }
    }

    #[derive(Default)]
    struct NetLog {
        connects: usize,
        sent: Vec<AudioChunk>,
        closes: usize,
        reject_sends: bool,
        refuse_connect: bool,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        log: Arc<Mutex<NetLog>>,
        gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    }

    struct FakeSender {
        log: Arc<Mutex<NetLog>>,
    }

    impl LiveSender for FakeSender {
        fn send_audio(&mut self, chunk: &AudioChunk) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            if log.reject_sends {
                return Err(TransportError::SendRejected("socket reset".to_string()));
            }
            log.sent.push(chunk.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            self.log.lock().closes += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl LiveConnector for FakeConnector {
        async fn connect(&self, _setup: &LiveSetup) -> Result<LiveConnection, TransportError> {
            self.log.lock().connects += 1;
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.log.lock().refuse_connect {
                return Err(TransportError::Connect("refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.log.lock().events = Some(tx);
            Ok(LiveConnection {
                sender: Box::new(FakeSender { log: self.log.clone() }),
                events: rx,
            })
        }
    }

    struct Harness {
        manager: LiveSessionManager,
        host: FakeHost,
        net: FakeConnector,
    }

    fn options() -> SessionOptions {
        SessionOptions {
            setup: LiveSetup {
                model: "live-test".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "coach".to_string(),
                transcribe_input: true,
                transcribe_output: true,
            },
            block_size: 4,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            output_channels: 1,
        }
    }

    fn harness() -> Harness {
        let host = FakeHost::default();
        let net = FakeConnector::default();
        let manager = LiveSessionManager::new(Arc::new(host.clone()), Some(Arc::new(net.clone())), options());
        Harness { manager, host, net }
    }

    /// Process events until nothing arrives for a while
    async fn settle(manager: &mut LiveSessionManager) {
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), manager.events_rx.recv()).await {
            manager.handle_event(event);
        }
    }

    async fn open(h: &mut Harness) {
        h.manager.start_session();
        settle(&mut h.manager).await;
        assert_eq!(h.manager.state(), SessionState::Open);
    }

    fn inject(h: &Harness, event: TransportEvent) {
        let events = h.net.log.lock().events.clone().expect("transport not connected");
        events.send(event).unwrap();
    }

    fn message(value: serde_json::Value) -> TransportEvent {
        TransportEvent::Message(serde_json::from_value(value).unwrap())
    }

    fn audio(samples: usize) -> TransportEvent {
        message(json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": STANDARD.encode(vec![0u8; samples * 2]) } }
            ]}}
        }))
    }

    fn push_block(h: &Harness) {
        let sink = h.host.log.lock().block_sink.clone().expect("capture not built");
        sink(vec![0.25; 4]);
    }

    fn assert_released(h: &Harness) {
        let host = h.host.log.lock();
        assert_eq!(host.mic_stops, 1);
        assert_eq!(host.capture_disconnects, 1);
        assert_eq!(host.capture_closes, 1);
        assert_eq!(h.host.clock.0.lock().closed, 1);
        assert_eq!(h.net.log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_open_session_streams_microphone() {
        let mut h = harness();
        open(&mut h).await;

        assert_eq!(h.manager.snapshot().status, status::LISTENING);
        push_block(&h);
        push_block(&h);
        settle(&mut h.manager).await;

        let net = h.net.log.lock();
        assert_eq!(net.sent.len(), 2);
        assert_eq!(net.sent[0].mime_type, "audio/pcm;rate=16000");
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let mut h = harness();
        h.manager.start_session();
        h.manager.start_session();
        settle(&mut h.manager).await;
        h.manager.start_session();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Open);
        assert_eq!(h.host.log.lock().mic_requests, 1);
        assert_eq!(h.host.log.lock().captures_built, 1);
        assert_eq!(h.host.log.lock().outputs_opened, 1);
        assert_eq!(h.net.log.lock().connects, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness();
        h.manager.stop_session();
        assert_eq!(h.manager.snapshot().status, status::READY);

        open(&mut h).await;
        h.manager.stop_session();
        h.manager.stop_session();
        h.manager.stop_session();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(h.manager.snapshot().status, status::FINISHED);
        assert!(h.manager.snapshot().last_error.is_none());
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_stop_before_transport_opens() {
        let mut h = harness();
        let (release, gate) = oneshot::channel();
        *h.net.gate.lock() = Some(gate);

        h.manager.start_session();
        settle(&mut h.manager).await;
        assert_eq!(h.manager.state(), SessionState::Connecting);
        assert_eq!(h.net.log.lock().connects, 1);

        h.manager.stop_session();
        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(h.host.log.lock().mic_stops, 1);

        release.send(()).unwrap();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(h.host.log.lock().captures_built, 0);
        assert_eq!(h.host.log.lock().outputs_opened, 0);
        assert_eq!(h.host.log.lock().mic_stops, 1);
        // the late transport is closed rather than adopted
        assert_eq!(h.net.log.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_permission() {
        let mut h = harness();
        let (release, gate) = oneshot::channel();
        *h.host.mic_gate.lock() = Some(gate);

        h.manager.start_session();
        settle(&mut h.manager).await;
        assert_eq!(h.manager.state(), SessionState::Connecting);
        h.manager.stop_session();

        release.send(()).unwrap();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(h.host.log.lock().mic_stops, 1);
        assert_eq!(h.net.log.lock().connects, 0);
    }

    #[tokio::test]
    async fn test_playback_is_back_to_back() {
        let mut h = harness();
        open(&mut h).await;

        h.host.clock.0.lock().now = 1.0;
        inject(&h, audio(12000));
        settle(&mut h.manager).await;
        h.host.clock.0.lock().now = 1.1;
        inject(&h, audio(6000));
        settle(&mut h.manager).await;
        h.host.clock.0.lock().now = 1.2;
        inject(&h, audio(18000));
        settle(&mut h.manager).await;

        let clock = h.host.clock.0.lock();
        let starts: Vec<f64> = clock.scheduled.iter().map(|(_, start, _)| *start).collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0], 1.0);
        for pair in clock.scheduled.windows(2) {
            let (_, start, duration) = pair[0];
            assert!((pair[1].1 - (start + duration)).abs() < 1e-9);
        }
        drop(clock);
        assert_eq!(h.manager.snapshot().scheduled_buffers, 3);
    }

    #[tokio::test]
    async fn test_interruption_drops_queued_audio() {
        let mut h = harness();
        open(&mut h).await;

        h.host.clock.0.lock().now = 1.0;
        inject(&h, audio(12000));
        inject(&h, audio(12000));
        settle(&mut h.manager).await;
        assert_eq!(h.manager.snapshot().scheduled_buffers, 2);

        inject(&h, message(json!({ "serverContent": { "interrupted": true } })));
        settle(&mut h.manager).await;
        let mut stopped = h.host.clock.0.lock().stopped.clone();
        stopped.sort();
        assert_eq!(stopped, vec![1, 2]);
        assert_eq!(h.manager.snapshot().scheduled_buffers, 0);
        assert_eq!(h.manager.state(), SessionState::Open);

        // The next reply starts now, not after the dropped audio.
        h.host.clock.0.lock().now = 1.2;
        inject(&h, audio(2400));
        settle(&mut h.manager).await;
        assert_eq!(h.host.clock.0.lock().scheduled[2].1, 1.2);
    }

    #[tokio::test]
    async fn test_finished_buffers_leave_queue() {
        let mut h = harness();
        open(&mut h).await;
        inject(&h, audio(2400));
        settle(&mut h.manager).await;
        assert_eq!(h.manager.snapshot().scheduled_buffers, 1);

        let ended = h.host.log.lock().ended_sink.clone().unwrap();
        ended(1);
        settle(&mut h.manager).await;
        assert_eq!(h.manager.snapshot().scheduled_buffers, 0);
        assert_eq!(h.manager.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_transcript_accumulation() {
        let mut h = harness();
        open(&mut h).await;

        inject(&h, message(json!({ "serverContent": { "inputTranscription": { "text": "سلام" } } })));
        inject(&h, message(json!({ "serverContent": { "outputTranscription": { "text": "Bagus" } } })));
        inject(&h, message(json!({ "serverContent": { "turnComplete": true } })));
        inject(&h, message(json!({ "serverContent": { "inputTranscription": { "text": " عليكم" } } })));
        settle(&mut h.manager).await;

        let transcript = h.manager.snapshot().transcript;
        assert_eq!(transcript.user, "سلام عليكم");
        assert_eq!(transcript.feedback, "Bagus\n");
    }

    #[tokio::test]
    async fn test_bad_chunk_does_not_end_session() {
        let mut h = harness();
        open(&mut h).await;

        inject(&h, message(json!({
            "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "data": "@@@" } } ] } }
        })));
        inject(&h, audio(2400));
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Open);
        assert!(h.manager.snapshot().last_error.is_none());
        assert_eq!(h.host.clock.0.lock().scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_while_open() {
        let mut h = harness();
        open(&mut h).await;
        inject(&h, TransportEvent::Closed {
            code: Some(1011),
            reason: "overloaded".to_string(),
        });
        settle(&mut h.manager).await;

        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(
            snapshot.last_error,
            Some(SessionError::RemoteClosed {
                code: Some(1011),
                reason: "overloaded".to_string()
            })
        );
        assert!(snapshot.status.contains("1011"));
        assert_released(&h);

        // the user can start over
        open(&mut h).await;
        assert_eq!(h.net.log.lock().connects, 2);
        assert!(h.manager.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_after_stop_is_silent() {
        let mut h = harness();
        open(&mut h).await;
        h.manager.stop_session();
        inject(&h, TransportEvent::Closed {
            code: Some(1000),
            reason: String::new(),
        });
        settle(&mut h.manager).await;

        let snapshot = h.manager.snapshot();
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.status, status::FINISHED);
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_transport_error_tears_down() {
        let mut h = harness();
        open(&mut h).await;
        inject(&h, TransportEvent::Error("broken pipe".to_string()));
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_eq!(h.manager.snapshot().last_error, Some(SessionError::Connection("broken pipe".to_string())));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_rejected_send_tears_down() {
        let mut h = harness();
        open(&mut h).await;
        h.net.log.lock().reject_sends = true;
        push_block(&h);
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert!(matches!(h.manager.snapshot().last_error, Some(SessionError::Connection(_))));
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_blocks_after_stop_are_not_sent() {
        let mut h = harness();
        open(&mut h).await;
        push_block(&h);
        settle(&mut h.manager).await;
        h.manager.stop_session();
        push_block(&h);
        settle(&mut h.manager).await;

        assert_eq!(h.net.log.lock().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let host = FakeHost::default();
        let mut manager = LiveSessionManager::new(Arc::new(host.clone()), None, options());
        manager.start_session();
        settle(&mut manager).await;

        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(manager.snapshot().last_error, Some(SessionError::Configuration));
        assert_eq!(host.log.lock().mic_requests, 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let mut h = harness();
        h.host.log.lock().deny_microphone = true;
        h.manager.start_session();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert!(matches!(h.manager.snapshot().last_error, Some(SessionError::PermissionDenied(_))));
        assert_eq!(h.net.log.lock().connects, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_microphone() {
        let mut h = harness();
        h.net.log.lock().refuse_connect = true;
        h.manager.start_session();
        settle(&mut h.manager).await;

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert!(matches!(h.manager.snapshot().last_error, Some(SessionError::Connection(_))));
        assert_eq!(h.host.log.lock().mic_stops, 1);
        assert_eq!(h.host.log.lock().outputs_opened, 0);
    }

    #[tokio::test]
    async fn test_teardown_survives_failed_step() {
        let mut h = harness();
        open(&mut h).await;
        h.host.log.lock().fail_capture_close = true;
        h.manager.stop_session();

        assert_eq!(h.manager.state(), SessionState::Idle);
        assert_released(&h);
    }

    #[tokio::test]
    async fn test_dropping_controller_releases_everything() {
        let host = FakeHost::default();
        let net = FakeConnector::default();
        let manager = LiveSessionManager::new(Arc::new(host.clone()), Some(Arc::new(net.clone())), options());
        let (controller, task) = manager.spawn();

        let mut updates = controller.subscribe();
        controller.start();
        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|s| s.state == SessionState::Open))
            .await
            .unwrap()
            .unwrap();
        drop(updates);
        drop(controller);

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(host.log.lock().mic_stops, 1);
        assert_eq!(host.clock.0.lock().closed, 1);
        assert_eq!(net.log.lock().closes, 1);
    }
}
