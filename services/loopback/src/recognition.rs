//! Fake speech recognition: reports how much audio it heard.

use duplex_voice_types::events::recognition::{NoticeEvent, RecognitionErrorEvent, TranscriptEvent};
use duplex_voice_types::{RecognitionClientEvent, RecognitionServerEvent};
use duplex_voice_utils::audio::decode_base64;

/// PCM16 mono at 16 kHz.
const BYTES_PER_MS: usize = 32;

#[derive(Debug, Default)]
pub struct Transcriber {
    active: bool,
    bytes: usize,
}

impl Transcriber {
    pub fn handle(&mut self, event: RecognitionClientEvent) -> Vec<RecognitionServerEvent> {
        match event {
            RecognitionClientEvent::Start => {
                self.active = true;
                self.bytes = 0;
                vec![RecognitionServerEvent::Status(NoticeEvent::new("listening"))]
            }
            RecognitionClientEvent::Audio(frame) => {
                if !self.active {
                    return vec![error("audio before start")];
                }
                match decode_base64(frame.audio()) {
                    Ok(bytes) => {
                        self.bytes += bytes.len();
                        vec![RecognitionServerEvent::Interim(TranscriptEvent::new(
                            &format!("{} bytes of audio", self.bytes),
                        ))]
                    }
                    Err(e) => {
                        tracing::warn!("undecodable audio frame: {}", e);
                        vec![error("invalid audio frame")]
                    }
                }
            }
            RecognitionClientEvent::End => {
                if !self.active {
                    return Vec::new();
                }
                self.active = false;
                // The real backend stays silent on empty speech.
                if self.bytes == 0 {
                    return vec![RecognitionServerEvent::Status(NoticeEvent::new(
                        "no speech detected",
                    ))];
                }
                let ms = self.bytes / BYTES_PER_MS;
                vec![
                    RecognitionServerEvent::Final(TranscriptEvent::new(&format!(
                        "{ms} ms of audio"
                    ))),
                    RecognitionServerEvent::Status(NoticeEvent::new("recognition finished")),
                ]
            }
        }
    }
}

fn error(reason: &str) -> RecognitionServerEvent {
    RecognitionServerEvent::Error(RecognitionErrorEvent::new(reason))
}
