use anyhow::Context;
use base64::Engine;
use ringbuf::HeapRb;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;

pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

pub fn shared_buffer(size: usize) -> HeapRb<f32> {
    HeapRb::new(size)
}

/// Averages interleaved channels into one.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

/// Converts a float sample to PCM16, clamping instead of wrapping.
pub fn convert_f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn convert_i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn encode_i16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(fragment: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(fragment)
        .context("invalid base64 audio payload")
}

/// Little-endian PCM16 bytes to floats. A trailing odd byte is ignored.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| convert_i16_to_f32(i16::from_le_bytes([chunk[0], chunk[1]])))
        .collect()
}

/// Decodes a WAV buffer into mono samples and its sample rate.
pub fn decode_wav(bytes: &[u8]) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).context("not a wav payload")?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("corrupt float wav samples")?,
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => reader
            .samples::<i16>()
            .map(|s| s.map(convert_i16_to_f32))
            .collect::<Result<_, _>>()
            .context("corrupt pcm16 wav samples")?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .context("corrupt integer wav samples")?
        }
    };
    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

/// Encodes mono PCM16 samples as a WAV buffer.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in samples {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Resamples a continuous mono stream delivered in arbitrarily sized pieces.
///
/// Input that does not fill a whole resampler chunk is carried into the next
/// call, so nothing is dropped at piece boundaries. [`StreamResampler::flush`]
/// drains the carry and trims the tail so the total output length matches the
/// total input duration.
pub struct StreamResampler {
    in_rate: u32,
    out_rate: u32,
    chunk_size: usize,
    inner: Option<FastFixedIn<f32>>,
    carry: Vec<f32>,
    consumed: u64,
    produced: u64,
    delay_left: usize,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let mut resampler = Self {
            in_rate,
            out_rate,
            chunk_size,
            inner: None,
            carry: Vec::with_capacity(chunk_size),
            consumed: 0,
            produced: 0,
            delay_left: 0,
        };
        resampler.rebuild()?;
        Ok(resampler)
    }

    fn rebuild(&mut self) -> anyhow::Result<()> {
        self.inner = if self.in_rate == self.out_rate {
            None
        } else {
            Some(create_resampler(
                self.in_rate as f64,
                self.out_rate as f64,
                self.chunk_size,
            )?)
        };
        self.delay_left = self.inner.as_ref().map_or(0, |r| r.output_delay());
        self.carry.clear();
        self.consumed = 0;
        self.produced = 0;
        Ok(())
    }

    pub fn ratio(&self) -> f64 {
        self.out_rate as f64 / self.in_rate as f64
    }

    pub fn process(&mut self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
        self.consumed += samples.len() as u64;
        let Some(resampler) = self.inner.as_mut() else {
            self.produced += samples.len() as u64;
            return Ok(samples.to_vec());
        };

        self.carry.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.carry.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.carry.drain(..needed).collect();
            let block = resampler.process(&[chunk.as_slice()], None)?;
            take_output(block, &mut self.delay_left, &mut out);
        }
        self.produced += out.len() as u64;
        Ok(out)
    }

    /// Drains everything still buffered and resets for the next stream.
    pub fn flush(&mut self) -> anyhow::Result<Vec<f32>> {
        let expected = (self.consumed as f64 * self.ratio()).round() as u64;
        let mut out = Vec::new();
        if let Some(resampler) = self.inner.as_mut() {
            if !self.carry.is_empty() {
                let wave = [self.carry.as_slice()];
                let block = resampler.process_partial(Some(&wave[..]), None)?;
                take_output(block, &mut self.delay_left, &mut out);
            }
            let mut rounds = 0;
            while self.produced + (out.len() as u64) < expected && rounds < 8 {
                let block = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
                take_output(block, &mut self.delay_left, &mut out);
                rounds += 1;
            }
            out.truncate(expected.saturating_sub(self.produced) as usize);
        }
        self.rebuild()?;
        Ok(out)
    }
}

fn take_output(block: Vec<Vec<f32>>, delay_left: &mut usize, out: &mut Vec<f32>) {
    if let Some(channel) = block.into_iter().next() {
        let skip = (*delay_left).min(channel.len());
        *delay_left -= skip;
        out.extend_from_slice(&channel[skip..]);
    }
}
