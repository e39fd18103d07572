use crate::RequestId;
use crate::audio::Base64EncodedAudioBytes;

/// Messages the client sends on the generation channel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationClientEvent {
    SendMessage(SendMessageEvent),
    /// Asks the backend to stop whatever it is generating. Best effort.
    StopGeneration,
}

impl GenerationClientEvent {
    pub fn send_message(message: &str, request_id: RequestId) -> Self {
        Self::SendMessage(SendMessageEvent {
            message: message.to_string(),
            request_id,
        })
    }
}

/// `send_message` event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageEvent {
    /// The utterance text
    message: String,
    /// The fence value every response message must echo
    request_id: RequestId,
}

impl SendMessageEvent {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Messages the generation backend sends.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationServerEvent {
    ResponseStart(ResponseStartEvent),
    ResponseChunk(ResponseChunkEvent),
    ResponseEnd(ResponseEndEvent),
    AudioChunk(AudioChunkEvent),
    Error(GenerationErrorEvent),
}

impl GenerationServerEvent {
    /// The request this message was computed for, when the backend tagged it.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::ResponseStart(e) => e.request_id,
            Self::ResponseChunk(e) => e.request_id,
            Self::ResponseEnd(e) => e.request_id,
            Self::AudioChunk(e) => e.request_id,
            Self::Error(e) => e.request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseStart(_) => "response_start",
            Self::ResponseChunk(_) => "response_chunk",
            Self::ResponseEnd(_) => "response_end",
            Self::AudioChunk(_) => "audio_chunk",
            Self::Error(_) => "error",
        }
    }
}

/// `response_start` event
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStartEvent {
    request_id: Option<RequestId>,
    message: Option<String>,
}

impl ResponseStartEvent {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// `response_chunk` event: one increment of response text
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunkEvent {
    request_id: Option<RequestId>,
    #[serde(default)]
    content: String,
    is_first: Option<bool>,
}

impl ResponseChunkEvent {
    pub fn new(request_id: RequestId, content: &str) -> Self {
        Self {
            request_id: Some(request_id),
            content: content.to_string(),
            is_first: None,
        }
    }

    pub fn with_first(mut self, is_first: bool) -> Self {
        self.is_first = Some(is_first);
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_first(&self) -> bool {
        self.is_first.unwrap_or(false)
    }
}

/// A retrieval source cited by a completed response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Source {
    pub source: String,
    pub locator: Option<String>,
}

/// `response_end` event
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEndEvent {
    request_id: Option<RequestId>,
    full_response: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    sources: Vec<Source>,
    is_interrupted: Option<bool>,
}

impl ResponseEndEvent {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Default::default()
        }
    }

    pub fn with_full_response(mut self, full_response: &str) -> Self {
        self.full_response = Some(full_response.to_string());
        self
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_timestamp(mut self, timestamp: &str) -> Self {
        self.timestamp = Some(timestamp.to_string());
        self
    }

    pub fn full_response(&self) -> Option<&str> {
        self.full_response.as_deref()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_interrupted.unwrap_or(false)
    }
}

/// `audio_chunk` event: one synthesized segment
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkEvent {
    request_id: Option<RequestId>,
    #[serde(default)]
    audio: Base64EncodedAudioBytes,
}

impl AudioChunkEvent {
    pub fn new(request_id: RequestId, audio: Base64EncodedAudioBytes) -> Self {
        Self {
            request_id: Some(request_id),
            audio,
        }
    }

    pub fn audio(&self) -> &str {
        &self.audio
    }
}

/// `error` event; the backend usually omits `requestId` here.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationErrorEvent {
    request_id: Option<RequestId>,
    message: Option<String>,
}

impl GenerationErrorEvent {
    pub fn new(message: &str) -> Self {
        Self {
            request_id: None,
            message: Some(message.to_string()),
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("unspecified generation error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_uses_camel_case_request_id() {
        let json =
            serde_json::to_value(GenerationClientEvent::send_message("hello", RequestId::new(3)))
                .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "send_message", "message": "hello", "requestId": 3})
        );
        assert_eq!(
            serde_json::to_string(&GenerationClientEvent::StopGeneration).unwrap(),
            r#"{"type":"stop_generation"}"#
        );
    }

    #[test]
    fn parses_a_completed_response_with_sources() {
        let text = r#"{
            "type": "response_end",
            "fullResponse": "The museum opens at nine.",
            "timestamp": "2024-05-01T10:00:00",
            "sources": [{"source": "guide.pdf", "locator": "page 3"}],
            "requestId": "7",
            "isInterrupted": false
        }"#;
        let event: GenerationServerEvent = serde_json::from_str(text).unwrap();
        assert_eq!(event.request_id(), Some(RequestId::new(7)));
        match event {
            GenerationServerEvent::ResponseEnd(end) => {
                assert_eq!(end.full_response(), Some("The museum opens at nine."));
                assert_eq!(end.sources().len(), 1);
                assert_eq!(end.sources()[0].locator.as_deref(), Some("page 3"));
                assert!(!end.is_interrupted());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn untagged_errors_parse_without_a_request_id() {
        let event: GenerationServerEvent =
            serde_json::from_str(r#"{"type":"error","message":"rag offline"}"#).unwrap();
        assert_eq!(event.request_id(), None);
        assert_eq!(event.kind(), "error");
    }
}
