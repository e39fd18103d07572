/// Audio data encoded as base64
pub type Base64EncodedAudioBytes = String;

/// Sample rate the recognition backend expects for PCM16 frames.
pub const RECOGNITION_PCM16_SAMPLE_RATE: u32 = 16_000;
