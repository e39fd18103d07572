use crate::client::{dial, pump, Config, Connector, LinkEvent};
use crate::error::VoiceError;
use crate::runtime::{EventBus, Input};
use crate::types::events::generation::Source;
use crate::types::{GenerationClientEvent, GenerationServerEvent, RequestId};
use crate::utils::audio::decode_base64;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Link activity for the generation channel, tagged with the connection epoch.
#[derive(Debug)]
pub enum GenerationInput {
    Opened {
        epoch: u64,
        result: Result<mpsc::Sender<String>, VoiceError>,
    },
    Received {
        epoch: u64,
        event: GenerationServerEvent,
    },
    Closed {
        epoch: u64,
        reason: Option<String>,
    },
}

/// A decoded inbound message, ready for the fence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GenerationEvent {
    Start {
        request_id: Option<RequestId>,
        message: Option<String>,
    },
    Text {
        request_id: Option<RequestId>,
        delta: String,
    },
    Audio {
        request_id: Option<RequestId>,
        payload: Vec<u8>,
    },
    End {
        request_id: Option<RequestId>,
        full_response: Option<String>,
        sources: Vec<Source>,
        interrupted: bool,
    },
    Error {
        request_id: Option<RequestId>,
        message: String,
    },
}

impl GenerationEvent {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Start { request_id, .. }
            | Self::Text { request_id, .. }
            | Self::Audio { request_id, .. }
            | Self::End { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "response_start",
            Self::Text { .. } => "response_chunk",
            Self::Audio { .. } => "audio_chunk",
            Self::End { .. } => "response_end",
            Self::Error { .. } => "error",
        }
    }

    fn decode(event: GenerationServerEvent) -> Option<Self> {
        let request_id = event.request_id();
        let decoded = match event {
            GenerationServerEvent::ResponseStart(e) => Self::Start {
                request_id,
                message: e.message().map(str::to_string),
            },
            GenerationServerEvent::ResponseChunk(e) => Self::Text {
                request_id,
                delta: e.content().to_string(),
            },
            GenerationServerEvent::AudioChunk(e) => match decode_base64(e.audio()) {
                Ok(payload) => Self::Audio {
                    request_id,
                    payload,
                },
                Err(err) => {
                    tracing::warn!("dropping audio chunk for request {:?}: {:#}", request_id, err);
                    return None;
                }
            },
            GenerationServerEvent::ResponseEnd(e) => Self::End {
                request_id,
                full_response: e.full_response().map(str::to_string),
                sources: e.sources().to_vec(),
                interrupted: e.is_interrupted(),
            },
            GenerationServerEvent::Error(e) => Self::Error {
                request_id,
                message: e.message().to_string(),
            },
        };
        Some(decoded)
    }
}

#[derive(Debug)]
pub(crate) enum GenerationUpdate {
    Event(GenerationEvent),
    Lost(VoiceError),
}

enum LinkState {
    Disconnected,
    Connecting,
    Open(mpsc::Sender<String>),
}

/// Client side of the generation channel.
///
/// Connects on demand; a message sent while the link is still opening waits
/// in the outbox.
pub(crate) struct GenerationChannel {
    connector: Arc<dyn Connector>,
    config: Arc<Config>,
    bus: EventBus,
    state: LinkState,
    epoch: u64,
    outbox: VecDeque<String>,
}

impl GenerationChannel {
    pub fn new(connector: Arc<dyn Connector>, config: Arc<Config>, bus: EventBus) -> Self {
        Self {
            connector,
            config,
            bus,
            state: LinkState::Disconnected,
            epoch: 0,
            outbox: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Open(_))
    }

    pub fn connect(&mut self) {
        if !matches!(self.state, LinkState::Disconnected) {
            return;
        }
        self.epoch += 1;
        self.state = LinkState::Connecting;

        let epoch = self.epoch;
        let connector = self.connector.clone();
        let config = self.config.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match dial(connector.as_ref(), &config).await {
                Ok(link) => {
                    bus.post(Input::Generation(GenerationInput::Opened {
                        epoch,
                        result: Ok(link.outbound),
                    }));
                    pump::<GenerationServerEvent, _>(link.inbound, |event| {
                        let input = match event {
                            LinkEvent::Message(event) => GenerationInput::Received { epoch, event },
                            LinkEvent::Closed(reason) => GenerationInput::Closed { epoch, reason },
                        };
                        bus.post(Input::Generation(input));
                    })
                    .await;
                }
                Err(e) => bus.post(Input::Generation(GenerationInput::Opened {
                    epoch,
                    result: Err(e),
                })),
            }
        });
    }

    pub fn send_message(&mut self, message: &str, request_id: RequestId) -> Result<(), VoiceError> {
        let event = GenerationClientEvent::send_message(message, request_id);
        let text = serde_json::to_string(&event)
            .map_err(|e| VoiceError::ProtocolInconsistency(e.to_string()))?;
        match self.state {
            LinkState::Open(_) => self.transmit(text),
            LinkState::Connecting => {
                self.outbox.push_back(text);
                Ok(())
            }
            LinkState::Disconnected => {
                self.outbox.push_back(text);
                self.connect();
                Ok(())
            }
        }
    }

    /// Best effort: local fencing already discards whatever the backend still sends.
    pub fn stop_generation(&mut self) {
        self.outbox.clear();
        if let LinkState::Open(_) = self.state {
            let text = match serde_json::to_string(&GenerationClientEvent::StopGeneration) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to serialize event: {}", e);
                    return;
                }
            };
            if let Err(e) = self.transmit(text) {
                tracing::debug!("stop_generation not delivered: {}", e);
            }
        }
    }

    fn transmit(&mut self, text: String) -> Result<(), VoiceError> {
        let LinkState::Open(tx) = &self.state else {
            return Err(VoiceError::ConnectionClosed("generation link not open".into()));
        };
        match tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(VoiceError::ConnectionClosed(
                "generation outbound queue is full".into(),
            )),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.state = LinkState::Disconnected;
                Err(VoiceError::ConnectionClosed("generation link dropped".into()))
            }
        }
    }

    pub fn handle(&mut self, input: GenerationInput) -> Option<GenerationUpdate> {
        let epoch = match &input {
            GenerationInput::Opened { epoch, .. }
            | GenerationInput::Received { epoch, .. }
            | GenerationInput::Closed { epoch, .. } => *epoch,
        };
        if epoch != self.epoch {
            tracing::debug!("ignoring generation link event from epoch {}", epoch);
            return None;
        }

        match input {
            GenerationInput::Opened { result: Ok(tx), .. } => {
                self.state = LinkState::Open(tx);
                while let Some(text) = self.outbox.pop_front() {
                    if let Err(e) = self.transmit(text) {
                        self.outbox.clear();
                        return Some(GenerationUpdate::Lost(e));
                    }
                }
                None
            }
            GenerationInput::Opened { result: Err(e), .. } => {
                self.state = LinkState::Disconnected;
                self.outbox.clear();
                Some(GenerationUpdate::Lost(e))
            }
            GenerationInput::Received { event, .. } => {
                GenerationEvent::decode(event).map(GenerationUpdate::Event)
            }
            GenerationInput::Closed { reason, .. } => {
                self.state = LinkState::Disconnected;
                self.outbox.clear();
                let reason = reason.unwrap_or_else(|| "generation link closed".to_string());
                tracing::error!("generation link closed: {}", reason);
                Some(GenerationUpdate::Lost(VoiceError::ConnectionClosed(reason)))
            }
        }
    }

    pub fn close(&mut self) {
        self.epoch += 1;
        self.state = LinkState::Disconnected;
        self.outbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::PendingConnector;
    use crate::types::events::generation::{AudioChunkEvent, ResponseChunkEvent};

    fn channel() -> GenerationChannel {
        let (bus, _rx) = EventBus::new();
        GenerationChannel::new(Arc::new(PendingConnector), Arc::new(Config::default()), bus)
    }

    fn open(channel: &mut GenerationChannel) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let update = channel.handle(GenerationInput::Opened {
            epoch: channel.epoch(),
            result: Ok(tx),
        });
        assert!(update.is_none());
        rx
    }

    #[tokio::test]
    async fn messages_wait_in_the_outbox_until_the_link_opens() {
        let mut channel = channel();
        channel.send_message("hello", RequestId::new(1)).unwrap();
        assert!(!channel.is_open());

        let mut server = open(&mut channel);
        let sent: serde_json::Value = serde_json::from_str(&server.try_recv().unwrap()).unwrap();
        assert_eq!(
            sent,
            serde_json::json!({"type": "send_message", "message": "hello", "requestId": 1})
        );
    }

    #[tokio::test]
    async fn stop_generation_drops_unsent_messages() {
        let mut channel = channel();
        channel.send_message("hello", RequestId::new(1)).unwrap();
        channel.stop_generation();
        let mut server = open(&mut channel);
        assert!(server.try_recv().is_err());

        channel.stop_generation();
        assert_eq!(server.try_recv().unwrap(), r#"{"type":"stop_generation"}"#);
    }

    #[tokio::test]
    async fn events_from_a_superseded_link_are_ignored() {
        let mut channel = channel();
        channel.connect();
        let old = channel.epoch();
        channel.close();
        channel.connect();

        let update = channel.handle(GenerationInput::Received {
            epoch: old,
            event: GenerationServerEvent::ResponseChunk(ResponseChunkEvent::new(
                RequestId::new(1),
                "late",
            )),
        });
        assert!(update.is_none());

        let update = channel.handle(GenerationInput::Closed {
            epoch: old,
            reason: None,
        });
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn undecodable_audio_is_dropped() {
        let mut channel = channel();
        let _server = open(&mut channel);
        let update = channel.handle(GenerationInput::Received {
            epoch: channel.epoch(),
            event: GenerationServerEvent::AudioChunk(AudioChunkEvent::new(
                RequestId::new(1),
                "%%%".into(),
            )),
        });
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn a_closed_link_is_reported_lost() {
        let mut channel = channel();
        let _server = open(&mut channel);
        let update = channel.handle(GenerationInput::Closed {
            epoch: channel.epoch(),
            reason: Some("going away".into()),
        });
        assert!(matches!(
            update,
            Some(GenerationUpdate::Lost(VoiceError::ConnectionClosed(reason))) if reason == "going away"
        ));
        assert!(!channel.is_open());
    }
}
