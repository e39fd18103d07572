use crate::error::CaptureError;
use crate::utils::audio::{convert_f32_to_i16, downmix, encode_i16, StreamResampler};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One fixed-length block of mono PCM16 ready for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sequence: u64,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn to_base64(&self) -> String {
        encode_i16(&self.samples)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Native format of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Receives interleaved f32 samples from the device callback.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;
/// Receives encoded frames.
pub type FrameFn = Box<dyn FnMut(AudioFrame) + Send>;

/// A running device stream. Dropping it releases the device.
pub trait DeviceStream: Send {
    fn pause(&mut self) -> Result<(), CaptureError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait Microphone: Send {
    /// Fails with `DeviceUnavailable` when there is no usable device.
    fn format(&self) -> Result<DeviceFormat, CaptureError>;
    fn start(&mut self, sink: SampleSink) -> Result<Box<dyn DeviceStream>, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub target_sample_rate: u32,
    pub frame_duration: Duration,
    pub resampler_chunk: usize,
}

impl CaptureConfig {
    pub fn with_target_sample_rate(mut self, rate: u32) -> Self {
        self.target_sample_rate = rate;
        self
    }

    pub fn with_frame_duration(mut self, duration: Duration) -> Self {
        self.frame_duration = duration;
        self
    }

    fn frame_len(&self) -> usize {
        let len = self.target_sample_rate as u128 * self.frame_duration.as_millis() / 1000;
        (len as usize).max(1)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: crate::types::audio::RECOGNITION_PCM16_SAMPLE_RATE,
            frame_duration: Duration::from_millis(100),
            resampler_chunk: 1024,
        }
    }
}

struct FrameEncoder {
    channels: usize,
    sample_rate: u32,
    frame_len: usize,
    resampler: StreamResampler,
    pending: Vec<i16>,
    next_sequence: u64,
    on_frame: FrameFn,
}

impl FrameEncoder {
    fn new(format: DeviceFormat, config: &CaptureConfig, on_frame: FrameFn) -> Result<Self, CaptureError> {
        let resampler = StreamResampler::new(
            format.sample_rate,
            config.target_sample_rate,
            config.resampler_chunk,
        )
        .map_err(|e| CaptureError::Resampler(e.to_string()))?;
        let frame_len = config.frame_len();
        Ok(Self {
            channels: format.channels.max(1) as usize,
            sample_rate: config.target_sample_rate,
            frame_len,
            resampler,
            pending: Vec::with_capacity(frame_len * 2),
            next_sequence: 0,
            on_frame,
        })
    }

    fn ingest(&mut self, interleaved: &[f32]) -> Result<(), CaptureError> {
        let mono = downmix(interleaved, self.channels);
        let resampled = self
            .resampler
            .process(&mono)
            .map_err(|e| CaptureError::Resampler(e.to_string()))?;
        self.pending
            .extend(resampled.into_iter().map(convert_f32_to_i16));
        while self.pending.len() >= self.frame_len {
            let samples: Vec<i16> = self.pending.drain(..self.frame_len).collect();
            self.emit(samples);
        }
        Ok(())
    }

    /// Emits everything still buffered, ending with a short frame if needed.
    fn flush(&mut self) -> Result<(), CaptureError> {
        let tail = self
            .resampler
            .flush()
            .map_err(|e| CaptureError::Resampler(e.to_string()))?;
        self.pending.extend(tail.into_iter().map(convert_f32_to_i16));
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.frame_len);
            let samples: Vec<i16> = self.pending.drain(..take).collect();
            self.emit(samples);
        }
        Ok(())
    }

    fn emit(&mut self, samples: Vec<i16>) {
        let frame = AudioFrame {
            sequence: self.next_sequence,
            sample_rate: self.sample_rate,
            samples,
        };
        self.next_sequence += 1;
        (self.on_frame)(frame);
    }
}

struct Recording {
    stream: Box<dyn DeviceStream>,
    encoder: Arc<Mutex<FrameEncoder>>,
}

/// Microphone to fixed-cadence PCM16 frames.
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    config: CaptureConfig,
    recording: Option<Recording>,
}

impl CapturePipeline {
    pub fn new(microphone: Box<dyn Microphone>, config: CaptureConfig) -> Self {
        Self {
            microphone,
            config,
            recording: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn start_recording(&mut self, on_frame: FrameFn) -> Result<(), CaptureError> {
        if self.recording.is_some() {
            tracing::debug!("already recording");
            return Ok(());
        }

        let format = self.microphone.format()?;
        tracing::info!(
            "capturing at {}hz/{}ch, sending {}hz frames",
            format.sample_rate,
            format.channels,
            self.config.target_sample_rate
        );
        let encoder = Arc::new(Mutex::new(FrameEncoder::new(format, &self.config, on_frame)?));

        let feed = encoder.clone();
        let sink: SampleSink = Box::new(move |data: &[f32]| match feed.lock() {
            Ok(mut encoder) => {
                if let Err(e) = encoder.ingest(data) {
                    tracing::error!("dropping captured audio: {}", e);
                }
            }
            Err(_) => tracing::error!("frame encoder lock poisoned"),
        });

        let stream = self.microphone.start(sink)?;
        self.recording = Some(Recording { stream, encoder });
        Ok(())
    }

    /// Flushes the partial frame, then releases the device. Safe to call when idle.
    pub fn stop_recording(&mut self) -> Result<(), CaptureError> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(());
        };
        if let Err(e) = recording.stream.pause() {
            tracing::warn!("failed to pause input stream: {}", e);
        }
        let flushed = match recording.encoder.lock() {
            Ok(mut encoder) => encoder.flush(),
            Err(_) => Err(CaptureError::Stream("frame encoder lock poisoned".into())),
        };
        drop(recording.stream);
        flushed
    }
}
