//! Voice session runtime
//! Owns one live conversation at a time: microphone -> encode -> channel -> decode -> scheduled playback.
//!
//! Each session runs as its own task, from the channel handshake to teardown. Channel,
//! capture and playback callbacks arrive as messages on that task and are applied one
//! at a time to a [`Session`], so the playback clock and active sources are never
//! shared between threads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::outbound::{OutboundQueue, PushOutcome};
use super::session::{Effect, Session, SessionEvent};
use super::{SessionState, UserContext};
use crate::audio::{
    AudioDevices, AudioFrame, CaptureDevice, PlaybackOutput, SourceId, CAPTURE_BACKLOG_FRAMES,
    ENDED_BACKLOG,
};
use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::live::{ChannelEvent, LiveConfig, LiveConnector, LiveLink, RealtimeInput};

/// Grace period for the channel to close after a session ends
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What a finished session did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_received: u64,
    /// Set when the session ended on a failure
    pub error: Option<String>,
}

impl SessionSummary {
    fn aborted(id: Uuid, reason: String) -> Self {
        Self {
            id,
            frames_sent: 0,
            frames_dropped: 0,
            chunks_received: 0,
            error: Some(reason),
        }
    }
}

/// Outcome of the channel handshake, reported back to `start`
type HandshakeResult = Result<(), VoiceError>;

/// Handle to the running session task
struct ActiveSession {
    id: Uuid,
    stop_tx: mpsc::UnboundedSender<()>,
    done_rx: watch::Receiver<bool>,
    task: JoinHandle<SessionSummary>,
}

impl ActiveSession {
    async fn shutdown(self) -> SessionSummary {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Voice session task failed: {}", e);
                SessionSummary::aborted(self.id, e.to_string())
            }
        }
    }
}

/// Drives live voice conversations for one user interaction
pub struct VoiceSessionController {
    config: VoiceConfig,
    connector: Arc<dyn LiveConnector>,
    devices: Arc<dyn AudioDevices>,
    state_tx: Arc<watch::Sender<SessionState>>,
    active: Mutex<Option<ActiveSession>>,
}

impl VoiceSessionController {
    pub fn new(
        config: VoiceConfig,
        connector: Arc<dyn LiveConnector>,
        devices: Arc<dyn AudioDevices>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            connector,
            devices,
            state_tx: Arc::new(state_tx),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions (a `Closed` value is the session-ended indication)
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Open a new session for `user`. Returns once the channel is connected;
    /// `Open` follows when the service acknowledges the setup.
    ///
    /// The handshake can be cut short by `stop()` or by the configured open
    /// timeout, both of which end in `ChannelOpenFailure`.
    pub async fn start(&self, user: &UserContext) -> Result<Uuid, VoiceError> {
        let (id, handshake) = {
            let mut active = self.active.lock().await;

            if active.is_some() && self.state().is_live() {
                tracing::warn!("Rejecting start: a voice session is already {:?}", self.state());
                return Err(VoiceError::SessionActive);
            }

            // A previous session may still be draining its last audio
            if let Some(previous) = active.take() {
                previous.shutdown().await;
            }

            let id = Uuid::new_v4();
            tracing::info!("Starting voice session {} for {}", id, user.username);
            self.state_tx.send_replace(SessionState::Connecting);

            match self.launch(id, user) {
                Ok((session, handshake)) => {
                    *active = Some(session);
                    (id, handshake)
                }
                Err(e) => {
                    tracing::error!("Voice session {} failed to start: {}", id, e);
                    self.state_tx.send_replace(SessionState::Closed);
                    return Err(e);
                }
            }
        };

        // Wait without holding the lock so stop() can reach the session
        let outcome = handshake.await.unwrap_or_else(|_| {
            Err(VoiceError::ChannelOpenFailure(
                "session ended before the channel connected".to_string(),
            ))
        });

        if let Err(e) = &outcome {
            tracing::error!("Voice session {} failed to start: {}", id, e);
            self.reap(id).await;
        }
        outcome.map(|()| id)
    }

    /// End the current session, silencing anything still scheduled.
    /// No-op when there is no session.
    pub async fn stop(&self) -> Option<SessionSummary> {
        let session = self.active.lock().await.take()?;
        let summary = session.shutdown().await;
        self.state_tx.send_replace(SessionState::Closed);

        tracing::info!(
            "Voice session {} ended: {} frames sent, {} dropped, {} chunks received",
            summary.id,
            summary.frames_sent,
            summary.frames_dropped,
            summary.chunks_received
        );
        Some(summary)
    }

    /// Resolve once the current session has fully ended on its own
    /// (remote close or failure, after queued audio finished playing)
    pub async fn wait_closed(&self) {
        let done = self.active.lock().await.as_ref().map(|s| s.done_rx.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Collect a session whose handshake failed, unless stop() already took it
    async fn reap(&self, id: Uuid) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|s| s.id == id) {
            if let Some(session) = active.take() {
                session.shutdown().await;
            }
        }
    }

    /// Acquire the devices and spawn the session task, which performs the handshake
    fn launch(
        &self,
        id: Uuid,
        user: &UserContext,
    ) -> Result<(ActiveSession, oneshot::Receiver<HandshakeResult>), VoiceError> {
        let format = self.config.session_format();

        let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_BACKLOG_FRAMES);
        let mut capture = self.devices.acquire_input(self.config.capture_format(), frames_tx)?;

        let (ended_tx, ended_rx) = mpsc::channel(ENDED_BACKLOG);
        let output = match self.devices.open_output(format.playback_sample_rate, ended_tx) {
            Ok(output) => output,
            Err(e) => {
                capture.release();
                return Err(e);
            }
        };

        let queue = Arc::new(OutboundQueue::new(
            self.config.outbound_capacity,
            self.config.overflow_policy,
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = SessionTask {
            id,
            session: Session::connecting(format),
            capture,
            output,
            queue,
            transmitter: None,
            frames: frames_rx,
            events: events_rx,
            ended: ended_rx,
            stop: stop_rx,
            state_tx: self.state_tx.clone(),
            open_deadline: self.config.open_timeout().map(|t| Instant::now() + t),
        };

        let connector = self.connector.clone();
        let live = LiveConfig::audio(&self.config.model, &self.config.system_instruction(user));

        let handle = tokio::spawn(async move {
            let summary = task.connect_and_run(connector, live, events_tx, ready_tx).await;
            let _ = done_tx.send(true);
            summary
        });

        let session = ActiveSession {
            id,
            stop_tx,
            done_rx,
            task: handle,
        };
        Ok((session, ready_rx))
    }
}

enum Handshake {
    Linked(Box<dyn LiveLink>),
    Failed(VoiceError),
    Stopped,
    TimedOut,
}

/// Everything one session owns, alive from start to teardown
struct SessionTask {
    id: Uuid,
    session: Session,
    capture: Box<dyn CaptureDevice>,
    output: Box<dyn PlaybackOutput>,
    queue: Arc<OutboundQueue<RealtimeInput>>,
    transmitter: Option<JoinHandle<()>>,
    frames: mpsc::Receiver<AudioFrame>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    ended: mpsc::Receiver<SourceId>,
    stop: mpsc::UnboundedReceiver<()>,
    state_tx: Arc<watch::Sender<SessionState>>,
    open_deadline: Option<Instant>,
}

impl SessionTask {
    /// Connect the channel, racing stop and the open deadline, then run
    async fn connect_and_run(
        mut self,
        connector: Arc<dyn LiveConnector>,
        live: LiveConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
        ready: oneshot::Sender<HandshakeResult>,
    ) -> SessionSummary {
        let handshake = tokio::select! {
            result = connector.connect(live, events) => match result {
                Ok(link) => Handshake::Linked(link),
                Err(e @ VoiceError::ChannelOpenFailure(_)) => Handshake::Failed(e),
                Err(other) => Handshake::Failed(VoiceError::ChannelOpenFailure(other.to_string())),
            },
            _ = self.stop.recv() => Handshake::Stopped,
            _ = wait_until(self.open_deadline) => Handshake::TimedOut,
        };

        let outcome = match handshake {
            Handshake::Linked(link) => {
                self.transmitter = Some(tokio::spawn(transmit(self.queue.clone(), link)));
                let _ = ready.send(Ok(()));
                return self.run().await;
            }
            Handshake::Failed(e) => {
                self.dispatch(SessionEvent::ChannelFailed(e.to_string()));
                e
            }
            Handshake::Stopped => {
                self.dispatch(SessionEvent::Stop);
                VoiceError::ChannelOpenFailure("stopped before the channel connected".to_string())
            }
            Handshake::TimedOut => {
                self.dispatch(SessionEvent::OpenTimedOut);
                VoiceError::ChannelOpenFailure("timed out waiting for the channel to open".to_string())
            }
        };

        let _ = ready.send(Err(outcome));
        self.teardown().await
    }

    async fn run(mut self) -> SessionSummary {
        loop {
            let connecting = self.session.state() == SessionState::Connecting;

            let event = tokio::select! {
                // A dropped controller stops the session too
                _ = self.stop.recv() => SessionEvent::Stop,
                Some(event) = self.events.recv() => match event {
                    ChannelEvent::Opened => SessionEvent::ChannelOpened,
                    ChannelEvent::Message(msg) => SessionEvent::Inbound(msg),
                    ChannelEvent::Closed { reason } => SessionEvent::ChannelClosed { reason },
                    ChannelEvent::Failed(reason) => SessionEvent::ChannelFailed(reason),
                },
                Some(frame) = self.frames.recv() => SessionEvent::CaptureFrame(frame),
                Some(id) = self.ended.recv() => SessionEvent::SourceEnded(id),
                _ = wait_until(self.open_deadline), if connecting => SessionEvent::OpenTimedOut,
            };

            self.dispatch(event);
            self.state_tx.send_if_modified(|state| {
                let changed = *state != self.session.state();
                *state = self.session.state();
                changed
            });

            if self.session.is_finished() {
                break;
            }
        }

        self.teardown().await
    }

    /// Apply an event and every follow-up it triggers
    fn dispatch(&mut self, event: SessionEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let now = self.output.current_time();
            for effect in self.session.handle(event, now) {
                if let Err(e) = self.apply(effect) {
                    pending.push_back(SessionEvent::DeviceFailed(e.to_string()));
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect) -> Result<(), VoiceError> {
        match effect {
            Effect::StartCapture => self.capture.resume()?,
            Effect::Transmit(input) => match self.queue.push(input) {
                PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                    tracing::debug!(
                        "Outbound queue full, {} frames dropped so far",
                        self.queue.dropped()
                    );
                }
                PushOutcome::Queued | PushOutcome::Closed => {}
            },
            Effect::Schedule { source, buffer } => {
                self.output.schedule(source.id, buffer, source.start_at);
            }
            Effect::Cancel(ids) => {
                for id in ids {
                    self.output.cancel(id);
                }
            }
            Effect::ReleaseCapture => self.capture.release(),
            Effect::CloseChannel => self.queue.close(),
        }
        Ok(())
    }

    async fn teardown(mut self) -> SessionSummary {
        self.queue.close();
        self.capture.release();
        self.output.close();

        if let Some(mut transmitter) = self.transmitter.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut transmitter).await.is_err() {
                tracing::warn!("Live channel did not close in time, abandoning it");
                transmitter.abort();
            }
        }

        self.state_tx.send_replace(SessionState::Closed);

        SessionSummary {
            id: self.id,
            frames_sent: self.session.frames_sent(),
            frames_dropped: self.queue.dropped(),
            chunks_received: self.session.chunks_received(),
            error: self.session.last_error().map(str::to_string),
        }
    }
}

/// Pump queued frames to the channel. A failed send loses that frame only.
async fn transmit(queue: Arc<OutboundQueue<RealtimeInput>>, mut link: Box<dyn LiveLink>) {
    while let Some(input) = queue.pop().await {
        if let Err(e) = link.send(input).await {
            tracing::warn!("{}", e);
        }
    }
    link.close().await;
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureFormat, PlaybackBuffer, ScheduleMixer};
    use crate::live::ServerMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Records what the session did to its devices and channel
    #[derive(Default)]
    struct Recorder {
        capture_resumed: bool,
        capture_released: bool,
        output_closed: bool,
        scheduled: Vec<(SourceId, f64, f64)>,
        cancelled: Vec<SourceId>,
        sent: Vec<RealtimeInput>,
        link_closed: bool,
        instruction: Option<String>,
    }

    type SharedRecorder = Arc<SyncMutex<Recorder>>;

    struct FakeCapture {
        recorder: SharedRecorder,
    }

    impl CaptureDevice for FakeCapture {
        fn resume(&mut self) -> Result<(), VoiceError> {
            self.recorder.lock().capture_resumed = true;
            Ok(())
        }

        fn release(&mut self) {
            self.recorder.lock().capture_released = true;
        }
    }

    /// Output whose clock only moves when a test advances it
    struct FakeOutput {
        recorder: SharedRecorder,
        mixer: Arc<SyncMutex<ScheduleMixer>>,
    }

    impl PlaybackOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.mixer.lock().current_time()
        }

        fn schedule(&mut self, id: SourceId, buffer: PlaybackBuffer, start_at: f64) {
            self.recorder.lock().scheduled.push((id, start_at, buffer.duration()));
            self.mixer.lock().schedule(id, &buffer, start_at);
        }

        fn cancel(&mut self, id: SourceId) {
            self.recorder.lock().cancelled.push(id);
            self.mixer.lock().cancel(id);
        }

        fn close(&mut self) {
            self.recorder.lock().output_closed = true;
        }
    }

    struct FakeDevices {
        recorder: SharedRecorder,
        mixer: Arc<SyncMutex<ScheduleMixer>>,
        frames: SyncMutex<Option<mpsc::Sender<AudioFrame>>>,
        ended: SyncMutex<Option<mpsc::Sender<SourceId>>>,
        input_error: Option<VoiceError>,
    }

    impl FakeDevices {
        fn new(recorder: SharedRecorder) -> Self {
            Self {
                recorder,
                mixer: Arc::new(SyncMutex::new(ScheduleMixer::new(24000))),
                frames: SyncMutex::new(None),
                ended: SyncMutex::new(None),
                input_error: None,
            }
        }

        fn push_frame(&self, samples: Vec<f32>) {
            if let Some(tx) = self.frames.lock().as_ref() {
                let _ = tx.try_send(AudioFrame::new(samples, 16000));
            }
        }

        /// Play `seconds` of output and report finished sources
        fn play(&self, seconds: f64) {
            let mut block = vec![0.0f32; (seconds * 24000.0).round() as usize];
            let ended = self.mixer.lock().render(&mut block);
            if let Some(tx) = self.ended.lock().as_ref() {
                for id in ended {
                    let _ = tx.try_send(id);
                }
            }
        }
    }

    impl AudioDevices for FakeDevices {
        fn acquire_input(
            &self,
            _format: CaptureFormat,
            frames: mpsc::Sender<AudioFrame>,
        ) -> Result<Box<dyn CaptureDevice>, VoiceError> {
            if let Some(err) = &self.input_error {
                return Err(err.clone());
            }
            *self.frames.lock() = Some(frames);
            Ok(Box::new(FakeCapture {
                recorder: self.recorder.clone(),
            }))
        }

        fn open_output(
            &self,
            _sample_rate: u32,
            ended: mpsc::Sender<SourceId>,
        ) -> Result<Box<dyn PlaybackOutput>, VoiceError> {
            *self.ended.lock() = Some(ended);
            Ok(Box::new(FakeOutput {
                recorder: self.recorder.clone(),
                mixer: self.mixer.clone(),
            }))
        }
    }

    struct FakeLink {
        recorder: SharedRecorder,
        fail_sends: bool,
    }

    #[async_trait]
    impl LiveLink for FakeLink {
        async fn send(&mut self, input: RealtimeInput) -> Result<(), VoiceError> {
            if self.fail_sends {
                return Err(VoiceError::TransmitFailure("socket gone".to_string()));
            }
            self.recorder.lock().sent.push(input);
            Ok(())
        }

        async fn close(&mut self) {
            self.recorder.lock().link_closed = true;
        }
    }

    /// Connector that hands the test the service side of the channel
    struct FakeConnector {
        recorder: SharedRecorder,
        events: SyncMutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
        refuse: bool,
        /// Never finish the handshake
        hang: bool,
        fail_sends: bool,
    }

    impl FakeConnector {
        fn new(recorder: SharedRecorder) -> Self {
            Self {
                recorder,
                events: SyncMutex::new(None),
                refuse: false,
                hang: false,
                fail_sends: false,
            }
        }

        fn emit(&self, event: ChannelEvent) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    #[async_trait]
    impl LiveConnector for FakeConnector {
        async fn connect(
            &self,
            config: LiveConfig,
            events: mpsc::UnboundedSender<ChannelEvent>,
        ) -> Result<Box<dyn LiveLink>, VoiceError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.refuse {
                return Err(VoiceError::ChannelOpenFailure("401 Unauthorized".to_string()));
            }
            self.recorder.lock().instruction = Some(config.system_instruction);
            *self.events.lock() = Some(events);
            Ok(Box::new(FakeLink {
                recorder: self.recorder.clone(),
                fail_sends: self.fail_sends,
            }))
        }
    }

    struct Harness {
        recorder: SharedRecorder,
        connector: Arc<FakeConnector>,
        devices: Arc<FakeDevices>,
        controller: Arc<VoiceSessionController>,
    }

    fn harness_with(
        config: VoiceConfig,
        connector: impl FnOnce(SharedRecorder) -> FakeConnector,
        devices: impl FnOnce(SharedRecorder) -> FakeDevices,
    ) -> Harness {
        let recorder: SharedRecorder = Arc::new(SyncMutex::new(Recorder::default()));
        let connector = Arc::new(connector(recorder.clone()));
        let devices = Arc::new(devices(recorder.clone()));
        let controller = Arc::new(VoiceSessionController::new(
            config,
            connector.clone(),
            devices.clone(),
        ));
        Harness {
            recorder,
            connector,
            devices,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with(VoiceConfig::default(), FakeConnector::new, FakeDevices::new)
    }

    async fn wait_for_state(controller: &VoiceSessionController, wanted: SessionState) {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    /// Let spawned tasks process queued messages
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn audio_message(seconds: f64) -> ServerMessage {
        let frames = (seconds * 24000.0).round() as usize;
        ServerMessage::audio("audio/pcm;rate=24000", crate::audio::encode(&vec![0u8; frames * 2]))
    }

    #[tokio::test]
    async fn test_start_then_stop_before_open() {
        let h = harness();
        assert_eq!(h.controller.state(), SessionState::Idle);

        h.controller.start(&UserContext::new("alice")).await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);

        let summary = h.controller.stop().await.expect("a session was running");
        assert_eq!(summary.frames_sent, 0);
        assert_eq!(h.controller.state(), SessionState::Closed);

        // Stopping again is a no-op
        assert!(h.controller.stop().await.is_none());
        assert_eq!(h.controller.state(), SessionState::Closed);

        let recorder = h.recorder.lock();
        assert!(!recorder.capture_resumed);
        assert!(recorder.capture_released);
        assert!(recorder.output_closed);
        assert!(recorder.link_closed);
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let h = harness();
        assert!(h.controller.stop().await.is_none());
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_instruction_names_user() {
        let h = harness();
        h.controller.start(&UserContext::new("admin")).await.unwrap();
        assert_eq!(
            h.recorder.lock().instruction.as_deref(),
            Some("You are a task management helper for admin. Speak the language the user speaks.")
        );
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_capture_starts_on_open_and_frames_are_sent() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();

        h.devices.push_frame(vec![0.5; 4]);
        settle().await;
        assert!(h.recorder.lock().sent.is_empty());

        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;
        assert!(h.recorder.lock().capture_resumed);

        h.devices.push_frame(vec![0.5, -0.5]);
        h.devices.push_frame(vec![0.0, 0.0]);
        settle().await;

        {
            let recorder = h.recorder.lock();
            assert_eq!(recorder.sent.len(), 2);
            assert_eq!(recorder.sent[0].media.mime_type, "audio/pcm;rate=16000");
            assert_eq!(recorder.sent[0].media.data, "AEAAwA==");
        }

        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.frames_sent, 2);
    }

    #[tokio::test]
    async fn test_inbound_audio_scheduled_back_to_back() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;

        // Output clock at 2.0s when the first chunk arrives
        h.devices.play(2.0);
        for seconds in [0.5, 0.3, 0.2] {
            h.connector.emit(ChannelEvent::Message(audio_message(seconds)));
        }
        settle().await;

        {
            let recorder = h.recorder.lock();
            let starts: Vec<f64> = recorder.scheduled.iter().map(|(_, start, _)| *start).collect();
            assert_eq!(starts.len(), 3);
            assert!((starts[0] - 2.0).abs() < 1e-9);
            assert!((starts[1] - 2.5).abs() < 1e-9);
            assert!((starts[2] - 2.8).abs() < 1e-9);
        }

        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.chunks_received, 3);
        let recorder = h.recorder.lock();
        assert_eq!(recorder.cancelled.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_chunk_does_not_end_session() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;

        h.connector.emit(ChannelEvent::Message(ServerMessage::audio(
            "audio/pcm;rate=24000",
            "%%%".to_string(),
        )));
        h.connector.emit(ChannelEvent::Message(audio_message(0.25)));
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Open);
        {
            let recorder = h.recorder.lock();
            assert_eq!(recorder.scheduled.len(), 1);
            assert_eq!(recorder.scheduled[0].1, 0.0);
        }
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_transmit_failures_do_not_halt_capture() {
        let h = harness_with(
            VoiceConfig::default(),
            |recorder| FakeConnector {
                fail_sends: true,
                ..FakeConnector::new(recorder)
            },
            FakeDevices::new,
        );
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;

        for _ in 0..3 {
            h.devices.push_frame(vec![0.1; 8]);
        }
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Open);
        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.frames_sent, 3);
    }

    #[tokio::test]
    async fn test_remote_close_drains_then_finishes() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;

        h.connector.emit(ChannelEvent::Message(audio_message(0.1)));
        settle().await;
        h.connector.emit(ChannelEvent::Closed { reason: None });
        wait_for_state(&h.controller, SessionState::Closed).await;

        assert!(h.recorder.lock().capture_released);
        assert!(h.recorder.lock().cancelled.is_empty());

        // Finishes once the queued chunk has played out
        h.devices.play(0.2);
        tokio::time::timeout(Duration::from_secs(2), h.controller.wait_closed())
            .await
            .expect("session should finish after draining");

        assert!(h.recorder.lock().output_closed);
        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.error, None);
    }

    #[tokio::test]
    async fn test_start_rejected_while_live() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();

        let err = h.controller.start(&UserContext::new("alice")).await.unwrap_err();
        assert_eq!(err, VoiceError::SessionActive);

        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;
        assert_eq!(
            h.controller.start(&UserContext::new("alice")).await,
            Err(VoiceError::SessionActive)
        );

        h.controller.stop().await;
        // A fresh session may start once the old one is closed
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_start() {
        let h = harness_with(VoiceConfig::default(), FakeConnector::new, |recorder| FakeDevices {
            input_error: Some(VoiceError::PermissionDenied("user refused".to_string())),
            ..FakeDevices::new(recorder)
        });

        let err = h.controller.start(&UserContext::new("alice")).await.unwrap_err();
        assert!(matches!(err, VoiceError::PermissionDenied(_)));
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(h.controller.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_open_failure_aborts_start() {
        let h = harness_with(
            VoiceConfig::default(),
            |recorder| FakeConnector {
                refuse: true,
                ..FakeConnector::new(recorder)
            },
            FakeDevices::new,
        );

        let err = h.controller.start(&UserContext::new("alice")).await.unwrap_err();
        assert!(matches!(err, VoiceError::ChannelOpenFailure(_)));
        assert_eq!(h.controller.state(), SessionState::Closed);

        let recorder = h.recorder.lock();
        assert!(recorder.capture_released);
        assert!(recorder.output_closed);
    }

    #[tokio::test]
    async fn test_failure_while_connecting_is_reported() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Failed("handshake refused".to_string()));

        wait_for_state(&h.controller, SessionState::Closed).await;
        h.controller.wait_closed().await;

        let summary = h.controller.stop().await.unwrap();
        assert_eq!(summary.error.as_deref(), Some("handshake refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_closes_session() {
        let config = VoiceConfig {
            open_timeout_ms: Some(500),
            ..VoiceConfig::default()
        };
        let h = harness_with(config, FakeConnector::new, FakeDevices::new);
        h.controller.start(&UserContext::new("alice")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        h.controller.wait_closed().await;

        assert_eq!(h.controller.state(), SessionState::Closed);
        let summary = h.controller.stop().await.unwrap();
        assert!(summary.error.is_some());
    }

    fn hanging(recorder: SharedRecorder) -> FakeConnector {
        FakeConnector {
            hang: true,
            ..FakeConnector::new(recorder)
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_hanging_handshake() {
        let h = harness_with(VoiceConfig::default(), hanging, FakeDevices::new);

        let starting = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.start(&UserContext::new("alice")).await })
        };
        wait_for_state(&h.controller, SessionState::Connecting).await;

        let summary = tokio::time::timeout(Duration::from_secs(2), h.controller.stop())
            .await
            .expect("stop should not wait for the handshake")
            .expect("a session was connecting");
        assert_eq!(summary.error, None);
        assert_eq!(h.controller.state(), SessionState::Closed);

        let started = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .expect("start should return once stopped")
            .unwrap();
        assert!(matches!(started, Err(VoiceError::ChannelOpenFailure(_))));

        let recorder = h.recorder.lock();
        assert!(recorder.capture_released);
        assert!(recorder.output_closed);
        assert!(!recorder.capture_resumed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_bounds_hanging_handshake() {
        let config = VoiceConfig {
            open_timeout_ms: Some(200),
            ..VoiceConfig::default()
        };
        let h = harness_with(config, hanging, FakeDevices::new);

        let started = tokio::time::timeout(Duration::from_secs(2), h.controller.start(&UserContext::new("alice")))
            .await
            .expect("start should give up at the open timeout");
        assert!(matches!(started, Err(VoiceError::ChannelOpenFailure(_))));
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(h.recorder.lock().output_closed);

        // The failed session was already collected
        assert!(h.controller.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_start_replaces_draining_session() {
        let h = harness();
        h.controller.start(&UserContext::new("alice")).await.unwrap();
        h.connector.emit(ChannelEvent::Opened);
        wait_for_state(&h.controller, SessionState::Open).await;

        h.connector.emit(ChannelEvent::Message(audio_message(0.5)));
        settle().await;
        h.connector.emit(ChannelEvent::Closed { reason: None });
        wait_for_state(&h.controller, SessionState::Closed).await;

        let draining = h.recorder.lock().scheduled[0].0;
        assert!(h.recorder.lock().cancelled.is_empty());
        assert!(!h.recorder.lock().output_closed);

        h.controller.start(&UserContext::new("alice")).await.unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        {
            let recorder = h.recorder.lock();
            assert_eq!(recorder.cancelled, vec![draining]);
            assert!(recorder.output_closed);
        }

        h.controller.stop().await;
    }
}
