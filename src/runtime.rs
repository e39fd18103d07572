use crate::arbiter::{Arbiter, Origin};
use crate::capture::{AudioFrame, CaptureConfig, CapturePipeline, FrameFn, Microphone};
use crate::client::{Config, Connector};
use crate::client::consts::DEFAULT_RECOGNITION_URL;
use crate::error::VoiceError;
use crate::generation::{GenerationChannel, GenerationInput};
use crate::playback::{AudioSink, PlaybackQueue, PlaybackReport};
use crate::recognition::{RecognitionChannel, RecognitionConfig, RecognitionInput, RecognitionUpdate};
use crate::session::{Notice, Observer, Phase};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything the event loop reacts to.
pub(crate) enum Input {
    StartListening,
    StopListening,
    /// Queued behind the frames flushed by `StopListening`.
    EndOfUtterance,
    SubmitText(String),
    Interrupt,
    AcknowledgeError,
    Shutdown,
    Frame(AudioFrame),
    Recognition(RecognitionInput),
    Generation(GenerationInput),
    Playback(PlaybackReport),
}

/// Posts inputs into the event loop from tasks and device callbacks.
#[derive(Clone)]
pub(crate) struct EventBus(mpsc::UnboundedSender<Input>);

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Input>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn post(&self, input: Input) {
        if self.0.send(input).is_err() {
            tracing::debug!("event loop has stopped; input dropped");
        }
    }
}

/// User-facing commands. Cheap to clone.
#[derive(Clone)]
pub struct Handle {
    bus: EventBus,
}

impl Handle {
    fn send(&self, input: Input) -> anyhow::Result<()> {
        self.bus
            .0
            .send(input)
            .map_err(|_| anyhow::anyhow!("event loop has stopped"))
    }

    pub fn start_listening(&self) -> anyhow::Result<()> {
        self.send(Input::StartListening)
    }

    pub fn stop_listening(&self) -> anyhow::Result<()> {
        self.send(Input::StopListening)
    }

    pub fn submit_text(&self, text: &str) -> anyhow::Result<()> {
        self.send(Input::SubmitText(text.to_string()))
    }

    pub fn interrupt(&self) -> anyhow::Result<()> {
        self.send(Input::Interrupt)
    }

    /// Interrupts any response and starts listening.
    pub fn barge_in(&self) -> anyhow::Result<()> {
        self.send(Input::StartListening)
    }

    pub fn acknowledge_error(&self) -> anyhow::Result<()> {
        self.send(Input::AcknowledgeError)
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.send(Input::Shutdown)
    }
}

pub struct ClientConfig {
    pub recognition: Config,
    pub generation: Config,
    pub recognition_policy: RecognitionConfig,
    pub capture: CaptureConfig,
}

impl ClientConfig {
    pub fn with_recognition(mut self, config: Config) -> Self {
        self.recognition = config;
        self
    }

    pub fn with_generation(mut self, config: Config) -> Self {
        self.generation = config;
        self
    }

    pub fn with_recognition_policy(mut self, policy: RecognitionConfig) -> Self {
        self.recognition_policy = policy;
        self
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            recognition: Config::builder().with_url(DEFAULT_RECOGNITION_URL).build(),
            generation: Config::new(),
            recognition_policy: RecognitionConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

/// Owns every component and runs them on one event loop.
pub struct Conductor {
    arbiter: Arbiter,
    recognition: RecognitionChannel,
    capture: CapturePipeline,
    bus: EventBus,
    inbox: mpsc::UnboundedReceiver<Input>,
}

impl Conductor {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        microphone: Box<dyn Microphone>,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, Handle) {
        let (bus, inbox) = EventBus::new();
        let generation = GenerationChannel::new(
            connector.clone(),
            Arc::new(config.generation),
            bus.clone(),
        );
        let playback = PlaybackQueue::new(sink, bus.clone());
        let recognition = RecognitionChannel::new(
            connector,
            Arc::new(config.recognition),
            config.recognition_policy,
            bus.clone(),
        );
        let conductor = Self {
            arbiter: Arbiter::new(generation, playback),
            recognition,
            capture: CapturePipeline::new(microphone, config.capture),
            bus: bus.clone(),
            inbox,
        };
        (conductor, Handle { bus })
    }

    pub fn phase(&self) -> Phase {
        self.arbiter.phase()
    }

    pub fn subscribe(&mut self, observer: Box<dyn Observer>) {
        self.arbiter.subscribe(observer);
    }

    pub fn subscribe_fn<F>(&mut self, f: F)
    where
        F: FnMut(Phase, Option<&Notice>) -> anyhow::Result<()> + Send + 'static,
    {
        self.arbiter.subscribe_fn(f);
    }

    /// Runs until `Shutdown`, then releases devices and links.
    pub async fn run(mut self) {
        self.arbiter.warm_up();
        while let Some(input) = self.inbox.recv().await {
            if self.dispatch(input).is_break() {
                break;
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Err(e) = self.capture.stop_recording() {
            tracing::warn!("failed to stop capture: {}", e);
        }
        self.recognition.close();
        self.arbiter.shutdown();
        tracing::info!(
            stale_dropped = self.arbiter.stale_dropped(),
            "event loop stopped"
        );
    }

    fn dispatch(&mut self, input: Input) -> ControlFlow<()> {
        match input {
            Input::StartListening => self.start_listening(),
            Input::StopListening => self.stop_listening(),
            Input::EndOfUtterance => {
                if self.recognition.finish_capture().is_none() {
                    self.arbiter.end_listening();
                }
            }
            Input::SubmitText(text) => {
                if self.arbiter.phase() == Phase::Listening {
                    self.halt_capture();
                    self.recognition.abandon();
                }
                self.arbiter.submit(Origin::Text, &text);
            }
            Input::Interrupt => {
                tracing::info!(request_id = ?self.arbiter.active_request(), "interrupt");
                self.halt_capture();
                self.recognition.abandon();
                self.arbiter.cancel(false);
            }
            Input::AcknowledgeError => self.arbiter.acknowledge(),
            Input::Shutdown => return ControlFlow::Break(()),
            Input::Frame(frame) => {
                if self.arbiter.phase() == Phase::Listening {
                    self.recognition.push_frame(&frame);
                } else {
                    tracing::debug!("dropping frame {} outside listening", frame.sequence);
                }
            }
            Input::Recognition(input) => {
                if let Some(update) = self.recognition.handle(input) {
                    self.on_recognition(update);
                }
            }
            Input::Generation(input) => self.arbiter.on_generation(input),
            Input::Playback(report) => self.arbiter.on_playback(report),
        }
        ControlFlow::Continue(())
    }

    fn start_listening(&mut self) {
        if self.arbiter.phase() == Phase::Listening {
            tracing::debug!("already listening");
            return;
        }
        if !self.arbiter.begin_listening() {
            tracing::warn!("cannot listen while in phase {}", self.arbiter.phase());
            return;
        }

        let bus = self.bus.clone();
        let on_frame: FrameFn = Box::new(move |frame| bus.post(Input::Frame(frame)));
        if let Err(e) = self.capture.start_recording(on_frame) {
            self.arbiter.fail(VoiceError::from(e));
            return;
        }
        let session = self.recognition.begin_session();
        tracing::debug!(
            "recognition session {} started, link {:?}",
            session,
            self.recognition.state()
        );
    }

    fn stop_listening(&mut self) {
        if self.arbiter.phase() != Phase::Listening || !self.capture.is_recording() {
            tracing::debug!("not recording");
            return;
        }
        self.halt_capture();
        self.bus.post(Input::EndOfUtterance);
    }

    fn halt_capture(&mut self) {
        if let Err(e) = self.capture.stop_recording() {
            tracing::error!("failed to stop capture: {}", e);
        }
    }

    fn on_recognition(&mut self, update: RecognitionUpdate) {
        let listening = self.arbiter.phase() == Phase::Listening;
        match update {
            RecognitionUpdate::Partial(text) => {
                if listening {
                    self.arbiter.announce(Notice::Partial(text));
                }
            }
            RecognitionUpdate::Status(message) => self.arbiter.announce(Notice::Status(message)),
            RecognitionUpdate::Final(text) => {
                if !listening {
                    tracing::debug!("final transcript outside listening; ignoring");
                    return;
                }
                self.halt_capture();
                self.arbiter.submit(Origin::Voice, &text);
            }
            RecognitionUpdate::NoSpeech => {
                if listening {
                    self.halt_capture();
                    self.arbiter.end_listening();
                }
            }
            RecognitionUpdate::Rejected(reason) => {
                if listening {
                    self.halt_capture();
                    self.recognition.abandon();
                    self.arbiter.fail(VoiceError::Backend(reason));
                } else {
                    tracing::warn!("recognition error: {}", reason);
                }
            }
            RecognitionUpdate::Lost(error) => {
                if listening {
                    self.halt_capture();
                    self.arbiter.fail(error);
                } else {
                    tracing::warn!("recognition link lost: {}", error);
                }
            }
        }
    }
}
