/// Conditions the client surfaces through the session's `Error` phase or logs.
///
/// Stale generation messages are not represented here: the fence drops them
/// before they can become errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoiceError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("timed out after {waited_ms} ms waiting for {endpoint} to open")]
    ConnectionTimeout { endpoint: String, waited_ms: u64 },
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("playback failed: {0}")]
    PlaybackFailure(String),
    #[error("protocol inconsistency: {0}")]
    ProtocolInconsistency(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("backend reported an error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("could not build resampler: {0}")]
    Resampler(String),
    #[error("input stream error: {0}")]
    Stream(String),
}

impl From<CaptureError> for VoiceError {
    fn from(error: CaptureError) -> Self {
        match error {
            CaptureError::DeviceUnavailable(reason) => VoiceError::DeviceUnavailable(reason),
            CaptureError::Resampler(reason) => VoiceError::Resample(reason),
            CaptureError::Stream(reason) => VoiceError::DeviceUnavailable(reason),
        }
    }
}
