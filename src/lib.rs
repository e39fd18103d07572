mod arbiter;
mod capture;
mod client;
mod error;
mod generation;
mod playback;
mod recognition;
mod runtime;
mod session;

pub use duplex_voice_types as types;
pub use duplex_voice_utils as utils;

pub use arbiter::{GenerationRequest, Origin, RequestStatus, Utterance};
pub use capture::{
    AudioFrame, CaptureConfig, CapturePipeline, DeviceFormat, DeviceStream, FrameFn, Microphone,
    SampleSink,
};
pub use client::{Config, ConfigBuilder, Connector, Frame, RawLink, Stats, WsConnector};
pub use error::{CaptureError, VoiceError};
pub use generation::GenerationInput;
pub use playback::{AudioSegment, AudioSink, PlaybackReport};
pub use recognition::{ConnectionState, RecognitionConfig, RecognitionInput};
pub use runtime::{ClientConfig, Conductor, Handle};
pub use session::{Notice, Observer, Phase};
