use crate::audio::Base64EncodedAudioBytes;

/// Messages the client sends on the recognition channel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognitionClientEvent {
    /// Opens a streaming recognition session on an open connection.
    Start,
    Audio(AudioFrameEvent),
    /// Marks the end of the utterance; the backend answers with `final`.
    End,
}

impl RecognitionClientEvent {
    pub fn audio(audio: Base64EncodedAudioBytes) -> Self {
        Self::Audio(AudioFrameEvent { audio })
    }
}

/// `audio` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioFrameEvent {
    /// One base64-encoded PCM16 little-endian frame
    audio: Base64EncodedAudioBytes,
}

impl AudioFrameEvent {
    pub fn audio(&self) -> &str {
        &self.audio
    }
}

/// Messages the recognition backend sends.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognitionServerEvent {
    Ready(NoticeEvent),
    Interim(TranscriptEvent),
    Partial(TranscriptEvent),
    Final(TranscriptEvent),
    Status(NoticeEvent),
    Error(RecognitionErrorEvent),
}

/// Payload of `interim`, `partial` and `final`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptEvent {
    #[serde(default)]
    text: String,
}

impl TranscriptEvent {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Payload of `ready` and `status`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NoticeEvent {
    message: Option<String>,
}

impl NoticeEvent {
    pub fn new(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// `error` event; the backend fills either `error` or `message`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecognitionErrorEvent {
    error: Option<String>,
    message: Option<String>,
}

impl RecognitionErrorEvent {
    pub fn new(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            message: None,
        }
    }

    pub fn reason(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("unspecified recognition error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_carry_only_the_type() {
        assert_eq!(
            serde_json::to_string(&RecognitionClientEvent::Start).unwrap(),
            r#"{"type":"start"}"#
        );
        assert_eq!(
            serde_json::to_string(&RecognitionClientEvent::End).unwrap(),
            r#"{"type":"end"}"#
        );
        let audio = serde_json::to_value(RecognitionClientEvent::audio("AAA=".into())).unwrap();
        assert_eq!(audio["type"], "audio");
        assert_eq!(audio["audio"], "AAA=");
    }

    #[test]
    fn parses_backend_messages() {
        let interim: RecognitionServerEvent =
            serde_json::from_str(r#"{"type":"interim","text":"hel"}"#).unwrap();
        assert_eq!(interim, RecognitionServerEvent::Interim(TranscriptEvent::new("hel")));

        let status: RecognitionServerEvent =
            serde_json::from_str(r#"{"type":"status","message":"started"}"#).unwrap();
        assert_eq!(status, RecognitionServerEvent::Status(NoticeEvent::new("started")));

        let error: RecognitionServerEvent =
            serde_json::from_str(r#"{"type":"error","error":"not initialised"}"#).unwrap();
        match error {
            RecognitionServerEvent::Error(e) => assert_eq!(e.reason(), "not initialised"),
            other => panic!("unexpected event: {other:?}"),
        }

        let ready: RecognitionServerEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, RecognitionServerEvent::Ready(NoticeEvent::default()));
    }
}
