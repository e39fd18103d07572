//! cpal-backed implementations of the client's device seams.
//!
//! cpal streams are not `Send`, so each one lives on its own thread and is
//! driven through a small control channel.

use crate::config::{DEVICE_CHUNK_SIZE, OUTPUT_LATENCY_MS, SegmentFormat};
use anyhow::Context;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use duplex_voice::{
    AudioSegment, AudioSink, CaptureError, DeviceFormat, DeviceStream, Microphone, SampleSink,
};
use duplex_voice_utils::audio::{StreamResampler, decode_wav, pcm16_le_to_f32, shared_buffer};
use duplex_voice_utils::device::{get_or_default_input, get_or_default_output};
use ringbuf::HeapProd;
use ringbuf::traits::{Consumer, Producer, Split};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RESAMPLER_CHUNK: usize = 1024;
const DRAIN_POLL: Duration = Duration::from_millis(10);

enum Control {
    Pause(std_mpsc::SyncSender<Result<(), String>>),
}

/// Microphone on a named (or the default) input device.
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

fn input_config(device_name: Option<String>) -> anyhow::Result<(cpal::Device, StreamConfig)> {
    let device = get_or_default_input(device_name)?;
    let default = device
        .default_input_config()
        .context("failed to get default input config")?;
    let config = StreamConfig {
        channels: default.channels(),
        sample_rate: default.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(DEVICE_CHUNK_SIZE)),
    };
    Ok((device, config))
}

impl Microphone for CpalMicrophone {
    fn format(&self) -> Result<DeviceFormat, CaptureError> {
        let (_, config) = input_config(self.device_name.clone())
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{e:#}")))?;
        Ok(DeviceFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        })
    }

    fn start(&mut self, mut sink: SampleSink) -> Result<Box<dyn DeviceStream>, CaptureError> {
        let device_name = self.device_name.clone();
        let (control_tx, control_rx) = std_mpsc::channel::<Control>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), CaptureError>>(1);

        std::thread::Builder::new()
            .name("voice-input".into())
            .spawn(move || {
                let stream = input_config(device_name)
                    .map_err(|e| CaptureError::DeviceUnavailable(format!("{e:#}")))
                    .and_then(|(device, config)| {
                        tracing::info!("input stream config: {:?}", config);
                        device
                            .build_input_stream(
                                &config,
                                move |data: &[f32], _: &cpal::InputCallbackInfo| sink(data),
                                move |err| tracing::error!("an error occurred on input stream: {}", err),
                                None,
                            )
                            .map_err(|e| CaptureError::Stream(e.to_string()))
                    })
                    .and_then(|stream| {
                        stream
                            .play()
                            .map(|_| stream)
                            .map_err(|e| CaptureError::Stream(e.to_string()))
                    });
                let stream = match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(Control::Pause(reply)) = control_rx.recv() {
                    let _ = reply.send(stream.pause().map_err(|e| e.to_string()));
                }
                tracing::debug!("input stream released");
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream { control: control_tx })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Stream("input thread exited".into())),
        }
    }
}

/// Dropping it ends the input thread and releases the device.
struct CpalInputStream {
    control: std_mpsc::Sender<Control>,
}

impl DeviceStream for CpalInputStream {
    fn pause(&mut self) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        self.control
            .send(Control::Pause(reply_tx))
            .map_err(|_| CaptureError::Stream("input thread exited".into()))?;
        match reply_rx.recv() {
            Ok(result) => result.map_err(CaptureError::Stream),
            Err(_) => Err(CaptureError::Stream("input thread exited".into())),
        }
    }
}

/// No microphone at all; listening fails with `DeviceUnavailable`.
pub struct NoMicrophone;

impl Microphone for NoMicrophone {
    fn format(&self) -> Result<DeviceFormat, CaptureError> {
        Err(CaptureError::DeviceUnavailable(
            "running in text-only mode".into(),
        ))
    }

    fn start(&mut self, _sink: SampleSink) -> Result<Box<dyn DeviceStream>, CaptureError> {
        Err(CaptureError::DeviceUnavailable(
            "running in text-only mode".into(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    Push,
    /// A clear has not reached the output callback yet.
    Wait,
    /// The segment was flushed.
    Abandoned,
}

/// Orders buffer clears against pushes. The output callback performs a
/// requested clear; segments admitted after the request only push once it
/// has been performed, and segments admitted before it stop pushing.
#[derive(Debug, Default)]
struct FlushGate {
    pending: AtomicBool,
    flushes: AtomicU64,
}

impl FlushGate {
    fn ticket(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by the consumer; true when it must clear now.
    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    fn admit(&self, ticket: u64) -> Admit {
        if self.flushes.load(Ordering::SeqCst) != ticket {
            Admit::Abandoned
        } else if self.pending.load(Ordering::SeqCst) {
            Admit::Wait
        } else {
            Admit::Push
        }
    }
}

/// Plays segments through a ring buffer feeding a cpal output stream.
pub struct CpalSpeaker {
    producer: Mutex<HeapProd<f32>>,
    gate: Arc<FlushGate>,
    /// Samples pushed but not yet played.
    queued: Arc<AtomicI64>,
    sample_rate: u32,
    format: SegmentFormat,
    // Dropping the sender ends the output thread.
    _shutdown: std_mpsc::Sender<()>,
}

impl CpalSpeaker {
    pub fn new(device_name: Option<String>, format: SegmentFormat) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<anyhow::Result<(u32, HeapProd<f32>)>>(1);
        let gate = Arc::new(FlushGate::default());
        let consumer_gate = gate.clone();
        let queued = Arc::new(AtomicI64::new(0));
        let played = queued.clone();

        std::thread::Builder::new()
            .name("voice-output".into())
            .spawn(move || {
                let started = (|| -> anyhow::Result<(cpal::Stream, u32, HeapProd<f32>)> {
                    let device = get_or_default_output(device_name)?;
                    tracing::info!("using output device: {:?}", device.name()?);
                    let default = device
                        .default_output_config()
                        .context("failed to get default output config")?;
                    let config = StreamConfig {
                        channels: default.channels(),
                        sample_rate: default.sample_rate(),
                        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(DEVICE_CHUNK_SIZE)),
                    };
                    tracing::info!("output stream config: {:?}", config);

                    let channels = config.channels.max(1) as usize;
                    let sample_rate = config.sample_rate.0;
                    let buffer = shared_buffer(sample_rate as usize * OUTPUT_LATENCY_MS / 1000);
                    let (producer, mut consumer) = buffer.split();

                    let stream = device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut popped = 0;
                            if consumer_gate.take() {
                                popped += consumer.clear();
                            }
                            for frame in data.chunks_mut(channels) {
                                let sample = match consumer.try_pop() {
                                    Some(sample) => {
                                        popped += 1;
                                        sample
                                    }
                                    None => 0.0,
                                };
                                frame.fill(sample);
                            }
                            if popped > 0 {
                                played.fetch_sub(popped as i64, Ordering::SeqCst);
                            }
                        },
                        move |err| tracing::error!("an error occurred on output stream: {}", err),
                        None,
                    )?;
                    stream.play()?;
                    Ok((stream, sample_rate, producer))
                })();

                let _stream = match started {
                    Ok((stream, sample_rate, producer)) => {
                        let _ = ready_tx.send(Ok((sample_rate, producer)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                tracing::debug!("output stream released");
            })
            .context("failed to spawn output thread")?;

        let (sample_rate, producer) = ready_rx
            .recv()
            .context("output thread exited before starting")??;

        Ok(Self {
            producer: Mutex::new(producer),
            gate,
            queued,
            sample_rate,
            format,
            _shutdown: shutdown_tx,
        })
    }

    fn decode(&self, segment: &AudioSegment) -> anyhow::Result<Vec<f32>> {
        let (samples, rate) = match self.format {
            SegmentFormat::Wav => decode_wav(&segment.payload)?,
            SegmentFormat::Pcm16 { sample_rate } => (pcm16_le_to_f32(&segment.payload), sample_rate),
        };
        let mut resampler = StreamResampler::new(rate, self.sample_rate, RESAMPLER_CHUNK)?;
        let mut out = resampler.process(&samples)?;
        out.extend(resampler.flush()?);
        Ok(out)
    }

    fn producer(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HeapProd<f32>>> {
        self.producer
            .lock()
            .map_err(|_| anyhow::anyhow!("output buffer lock poisoned"))
    }
}

#[async_trait]
impl AudioSink for CpalSpeaker {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        let samples = self
            .decode(segment)
            .with_context(|| format!("failed to decode segment {}", segment.sequence))?;

        let ticket = self.gate.ticket();
        let mut pushed = 0;
        while pushed < samples.len() {
            match self.gate.admit(ticket) {
                Admit::Abandoned => return Ok(()),
                Admit::Wait => {}
                Admit::Push => {
                    let n = self.producer()?.push_slice(&samples[pushed..]);
                    self.queued.fetch_add(n as i64, Ordering::SeqCst);
                    pushed += n;
                }
            }
            if pushed < samples.len() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }
        // Resolve once the device has consumed the segment.
        while self.queued.load(Ordering::SeqCst) > 0 && self.gate.admit(ticket) != Admit::Abandoned {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }

    fn stop(&self) {
        self.gate.request();
    }
}

/// Discards audio; used when running without a speaker.
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        tracing::debug!(
            "discarding segment {} of request {} ({} bytes)",
            segment.sequence,
            segment.owner,
            segment.payload.len()
        );
        Ok(())
    }

    fn stop(&self) {}
}
