use crate::capture::AudioFrame;
use crate::client::{dial, pump, Config, Connector, LinkEvent};
use crate::error::VoiceError;
use crate::runtime::{EventBus, Input};
use crate::types::{RecognitionClientEvent, RecognitionServerEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum RecognitionInput {
    Opened {
        epoch: u64,
        result: Result<mpsc::Sender<String>, VoiceError>,
    },
    Received {
        epoch: u64,
        event: RecognitionServerEvent,
    },
    Closed {
        epoch: u64,
        reason: Option<String>,
    },
    /// The reconnect delay scheduled under `epoch` has elapsed.
    Retry {
        epoch: u64,
    },
    /// No `final` arrived in time for this recognition session.
    FinalDeadline {
        session: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecognitionUpdate {
    Partial(String),
    Final(String),
    Status(String),
    /// The backend reported an error.
    Rejected(String),
    /// Reconnecting gave up.
    Lost(VoiceError),
    /// The utterance ended without any recognized speech.
    NoSpeech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// `start` has been sent on the open link.
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub final_timeout: Duration,
    pub max_backlog_frames: usize,
}

impl RecognitionConfig {
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    pub fn with_final_timeout(mut self, timeout: Duration) -> Self {
        self.final_timeout = timeout;
        self
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            final_timeout: Duration::from_secs(8),
            max_backlog_frames: 100,
        }
    }
}

#[derive(Debug)]
struct RecognitionSession {
    id: u64,
    partial_text: String,
    finalized: bool,
    end_requested: bool,
}

impl RecognitionSession {
    fn is_live(&self) -> bool {
        !self.finalized
    }
}

/// Client side of the recognition channel.
pub(crate) struct RecognitionChannel {
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    policy: RecognitionConfig,
    bus: EventBus,
    state: ConnectionState,
    link: Option<mpsc::Sender<String>>,
    epoch: u64,
    session: Option<RecognitionSession>,
    next_session: u64,
    backlog: VecDeque<String>,
    failures: u32,
}

impl RecognitionChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: Arc<Config>,
        policy: RecognitionConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            connector,
            config,
            policy,
            bus,
            state: ConnectionState::Closed,
            link: None,
            epoch: 0,
            session: None,
            next_session: 0,
            backlog: VecDeque::new(),
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[cfg(test)]
    pub fn partial_text(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.partial_text.as_str())
    }

    /// Starts a recognition session, reusing the link if it is still open.
    /// A link only stays open between sessions when its last `end` was
    /// answered by a `final`, so nothing owed to an earlier session can
    /// arrive on it.
    pub fn begin_session(&mut self) -> u64 {
        self.next_session += 1;
        let id = self.next_session;
        self.session = Some(RecognitionSession {
            id,
            partial_text: String::new(),
            finalized: false,
            end_requested: false,
        });
        self.backlog.clear();
        self.failures = 0;

        match self.state {
            ConnectionState::Open | ConnectionState::Active => self.activate(),
            ConnectionState::Connecting => {}
            ConnectionState::Closed => self.connect(),
        }
        id
    }

    pub fn push_frame(&mut self, frame: &AudioFrame) {
        match &self.session {
            Some(session) if session.is_live() && !session.end_requested => {}
            _ => {
                tracing::debug!("dropping frame {}: no session accepting audio", frame.sequence);
                return;
            }
        }
        let text = match encode(&RecognitionClientEvent::audio(frame.to_base64())) {
            Some(text) => text,
            None => return,
        };
        if self.state == ConnectionState::Active {
            self.transmit(text);
        } else {
            if self.backlog.len() >= self.policy.max_backlog_frames {
                self.backlog.pop_front();
                tracing::warn!("recognition backlog full; dropping oldest frame");
            }
            self.backlog.push_back(text);
        }
    }

    /// Marks the end of captured audio. `end` goes out now, or right after
    /// the backlog once the link opens.
    pub fn finish_capture(&mut self) -> Option<u64> {
        let session = self.session.as_mut().filter(|s| s.is_live())?;
        if session.end_requested {
            return Some(session.id);
        }
        session.end_requested = true;
        let id = session.id;
        if self.state == ConnectionState::Active {
            self.send_end(id);
        }
        Some(id)
    }

    /// Drops the current session without waiting for its transcript.
    pub fn abandon(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.backlog.clear();
        self.failures = 0;
        if self.state == ConnectionState::Active && session.is_live() {
            if !session.end_requested {
                if let Some(text) = encode(&RecognitionClientEvent::End) {
                    self.transmit(text);
                }
            }
            // Its transcript may still be in flight.
            self.retire_link();
        }
    }

    /// Stops listening to the current link. Queued messages still go out
    /// before the writer closes it; anything it delivers afterwards is
    /// from a superseded epoch.
    fn retire_link(&mut self) {
        tracing::debug!("retiring recognition link of epoch {}", self.epoch);
        self.epoch += 1;
        self.link = None;
        self.state = ConnectionState::Closed;
    }

    pub fn close(&mut self) {
        self.epoch += 1;
        self.link = None;
        self.session = None;
        self.backlog.clear();
        self.state = ConnectionState::Closed;
    }

    fn connect(&mut self) {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.link = None;

        let epoch = self.epoch;
        let connector = self.connector.clone();
        let config = self.config.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match dial(connector.as_ref(), &config).await {
                Ok(link) => {
                    bus.post(Input::Recognition(RecognitionInput::Opened {
                        epoch,
                        result: Ok(link.outbound),
                    }));
                    pump::<RecognitionServerEvent, _>(link.inbound, |event| {
                        let input = match event {
                            LinkEvent::Message(event) => RecognitionInput::Received { epoch, event },
                            LinkEvent::Closed(reason) => RecognitionInput::Closed { epoch, reason },
                        };
                        bus.post(Input::Recognition(input));
                    })
                    .await;
                }
                Err(e) => bus.post(Input::Recognition(RecognitionInput::Opened {
                    epoch,
                    result: Err(e),
                })),
            }
        });
    }

    fn schedule_retry(&mut self) {
        self.state = ConnectionState::Closed;
        self.link = None;
        let epoch = self.epoch;
        let delay = self.policy.reconnect_delay;
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.post(Input::Recognition(RecognitionInput::Retry { epoch }));
        });
    }

    /// Sends `start`, the buffered frames and, if already requested, `end`.
    fn activate(&mut self) {
        let Some(text) = encode(&RecognitionClientEvent::Start) else {
            return;
        };
        if !self.transmit(text) {
            return;
        }
        self.state = ConnectionState::Active;
        while let Some(frame) = self.backlog.pop_front() {
            if !self.transmit(frame) {
                return;
            }
        }
        if let Some(session) = &self.session {
            if session.end_requested {
                let id = session.id;
                self.send_end(id);
            }
        }
    }

    fn send_end(&mut self, session: u64) {
        let Some(text) = encode(&RecognitionClientEvent::End) else {
            return;
        };
        if self.transmit(text) {
            let deadline = self.policy.final_timeout;
            let bus = self.bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                bus.post(Input::Recognition(RecognitionInput::FinalDeadline { session }));
            });
        }
    }

    fn transmit(&mut self, text: String) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("recognition outbound queue full; dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("recognition link dropped while sending");
                false
            }
        }
    }

    fn session_is_live(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_live())
    }

    pub fn handle(&mut self, input: RecognitionInput) -> Option<RecognitionUpdate> {
        match input {
            RecognitionInput::Opened { epoch, .. }
            | RecognitionInput::Received { epoch, .. }
            | RecognitionInput::Closed { epoch, .. }
            | RecognitionInput::Retry { epoch }
                if epoch != self.epoch =>
            {
                tracing::debug!("ignoring recognition link event from epoch {}", epoch);
                None
            }
            RecognitionInput::Opened { result: Ok(tx), .. } => {
                self.link = Some(tx);
                self.state = ConnectionState::Open;
                self.failures = 0;
                if self.session_is_live() {
                    self.activate();
                }
                None
            }
            RecognitionInput::Opened { result: Err(e), .. } => {
                if !self.session_is_live() {
                    self.state = ConnectionState::Closed;
                    tracing::warn!("recognition link unavailable: {}", e);
                    return None;
                }
                self.failures += 1;
                if self.failures >= self.policy.max_reconnect_attempts {
                    tracing::error!(
                        "recognition link failed {} times in a row; giving up",
                        self.failures
                    );
                    self.state = ConnectionState::Closed;
                    self.session = None;
                    self.backlog.clear();
                    return Some(RecognitionUpdate::Lost(e));
                }
                tracing::warn!(
                    "recognition connect attempt {} failed: {}",
                    self.failures,
                    e
                );
                self.schedule_retry();
                None
            }
            RecognitionInput::Closed { reason, .. } => {
                self.link = None;
                self.state = ConnectionState::Closed;
                if self.session_is_live() {
                    tracing::warn!("recognition link closed mid-session ({:?}); reconnecting", reason);
                    self.schedule_retry();
                } else {
                    tracing::info!("recognition link closed: {:?}", reason);
                }
                None
            }
            RecognitionInput::Retry { .. } => {
                if self.state == ConnectionState::Closed && self.session_is_live() {
                    self.connect();
                }
                None
            }
            RecognitionInput::FinalDeadline { session } => {
                let current = self.session.as_ref()?;
                if current.id != session || current.finalized {
                    return None;
                }
                tracing::warn!("no final transcript within {:?}", self.policy.final_timeout);
                self.session = None;
                if self.state == ConnectionState::Active {
                    self.retire_link();
                }
                Some(RecognitionUpdate::NoSpeech)
            }
            RecognitionInput::Received { event, .. } => self.on_event(event),
        }
    }

    fn on_event(&mut self, event: RecognitionServerEvent) -> Option<RecognitionUpdate> {
        match event {
            RecognitionServerEvent::Ready(notice) => Some(RecognitionUpdate::Status(
                notice.message().unwrap_or("ready").to_string(),
            )),
            RecognitionServerEvent::Status(notice) => notice
                .message()
                .map(|m| RecognitionUpdate::Status(m.to_string())),
            RecognitionServerEvent::Interim(t) | RecognitionServerEvent::Partial(t) => {
                let session = self.session.as_mut().filter(|s| s.is_live())?;
                session.partial_text = t.text().to_string();
                Some(RecognitionUpdate::Partial(session.partial_text.clone()))
            }
            RecognitionServerEvent::Final(t) => {
                let Some(session) = self.session.as_mut() else {
                    tracing::debug!("final transcript with no session; ignoring");
                    return None;
                };
                if session.finalized {
                    let error = VoiceError::ProtocolInconsistency(format!(
                        "second final for recognition session {}",
                        session.id
                    ));
                    tracing::warn!("{}; ignoring", error);
                    return None;
                }
                session.finalized = true;
                let end_sent = session.end_requested;
                if self.state == ConnectionState::Active {
                    if end_sent {
                        self.state = ConnectionState::Open;
                    } else {
                        // Finalized by the backend on silence. Close its
                        // stream; any trailing `final` belongs to this session.
                        if let Some(text) = encode(&RecognitionClientEvent::End) {
                            self.transmit(text);
                        }
                        self.retire_link();
                    }
                }
                let text = t.text().trim().to_string();
                if text.is_empty() {
                    tracing::debug!("empty final transcript");
                    return Some(RecognitionUpdate::NoSpeech);
                }
                Some(RecognitionUpdate::Final(text))
            }
            RecognitionServerEvent::Error(e) => {
                Some(RecognitionUpdate::Rejected(e.reason().to_string()))
            }
        }
    }
}

fn encode(event: &RecognitionClientEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("failed to serialize event: {}", e);
            None
        }
    }
}
