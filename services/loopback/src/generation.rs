//! Scripted responses: the reply text streamed word by word, with a short
//! tone per sentence standing in for synthesized speech.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use duplex_voice_types::events::generation::{
    AudioChunkEvent, ResponseChunkEvent, ResponseEndEvent, ResponseStartEvent,
};
use duplex_voice_types::{GenerationServerEvent, RequestId};
use duplex_voice_utils::audio::{convert_f32_to_i16, encode_wav};
use std::f32::consts::TAU;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TONE_SAMPLE_RATE: u32 = 24_000;
const TONE_HZ: f32 = 440.0;
const TONE_MS_PER_WORD: u64 = 120;

#[derive(Debug)]
pub struct Step {
    pub delay: Duration,
    pub event: GenerationServerEvent,
}

pub fn reply_to(message: &str) -> String {
    format!("You said: {}. This reply comes from the loopback backend.", message.trim().trim_end_matches('.'))
}

/// Splits after each sentence-ending period, keeping the period.
pub fn sentences(text: &str) -> Vec<&str> {
    text.split_inclusive('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// A mono sine tone encoded as a WAV file.
pub fn tone(duration: Duration) -> anyhow::Result<Vec<u8>> {
    let len = (TONE_SAMPLE_RATE as u128 * duration.as_millis() / 1000) as usize;
    let samples: Vec<i16> = (0..len)
        .map(|n| {
            let t = n as f32 / TONE_SAMPLE_RATE as f32;
            convert_f32_to_i16(0.2 * (TAU * TONE_HZ * t).sin())
        })
        .collect();
    encode_wav(&samples, TONE_SAMPLE_RATE)
}

pub fn script(message: &str, request_id: RequestId, pace: Duration) -> anyhow::Result<Vec<Step>> {
    let reply = reply_to(message);
    let mut steps = vec![Step {
        delay: Duration::ZERO,
        event: GenerationServerEvent::ResponseStart(
            ResponseStartEvent::new(request_id).with_message("generating response"),
        ),
    }];

    let mut first = true;
    for sentence in sentences(&reply) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        for word in &words {
            let content = if first { word.to_string() } else { format!(" {word}") };
            steps.push(Step {
                delay: pace,
                event: GenerationServerEvent::ResponseChunk(
                    ResponseChunkEvent::new(request_id, &content).with_first(first),
                ),
            });
            first = false;
        }
        let wav = tone(Duration::from_millis(TONE_MS_PER_WORD * words.len() as u64))?;
        steps.push(Step {
            delay: pace,
            event: GenerationServerEvent::AudioChunk(AudioChunkEvent::new(
                request_id,
                STANDARD.encode(wav),
            )),
        });
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    steps.push(Step {
        delay: pace,
        event: GenerationServerEvent::ResponseEnd(
            ResponseEndEvent::new(request_id)
                .with_full_response(&reply)
                .with_timestamp(&timestamp.to_string()),
        ),
    });
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_voice_utils::audio::decode_wav;

    #[test]
    fn sentences_keep_their_periods() {
        assert_eq!(
            sentences("One two. Three.  Four"),
            vec!["One two.", "Three.", "Four"]
        );
    }

    #[test]
    fn tones_decode_to_the_requested_length() {
        let wav = tone(Duration::from_millis(250)).unwrap();
        let (samples, rate) = decode_wav(&wav).unwrap();
        assert_eq!(rate, TONE_SAMPLE_RATE);
        assert_eq!(samples.len(), 6_000);
    }

    #[test]
    fn script_streams_words_then_audio_then_end() {
        let id = RequestId::new(7);
        let steps = script("hello", id, Duration::ZERO).unwrap();
        assert!(steps.iter().all(|s| s.event.request_id() == Some(id)));
        assert!(matches!(steps[0].event, GenerationServerEvent::ResponseStart(_)));

        let text: String = steps
            .iter()
            .filter_map(|s| match &s.event {
                GenerationServerEvent::ResponseChunk(c) => Some(c.content().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(text, reply_to("hello"));

        let audio = steps
            .iter()
            .filter(|s| matches!(s.event, GenerationServerEvent::AudioChunk(_)))
            .count();
        assert_eq!(audio, sentences(&reply_to("hello")).len());

        match &steps.last().unwrap().event {
            GenerationServerEvent::ResponseEnd(end) => {
                assert_eq!(end.full_response(), Some(reply_to("hello").as_str()));
            }
            other => panic!("unexpected final step {other:?}"),
        }
    }
}
