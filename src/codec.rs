use std::collections::HashMap;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::Error;

pub const CARRIER_SAMPLE_RATE: u32 = 8_000;
pub const PCM_SAMPLE_WIDTH: usize = 2;

// ITU-T G.711 mu-law companding constants.
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

fn ulaw_segment(mut value: i32) -> i32 {
    let mut segment = 0;
    while value > 1 {
        value >>= 1;
        segment += 1;
    }
    segment
}

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    if pcm > ULAW_CLIP {
        pcm = ULAW_CLIP;
    }
    pcm += ULAW_BIAS;
    let exponent = ulaw_segment((pcm >> 7) & 0xFF);
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

fn ulaw_to_linear(code: u8) -> i16 {
    let code = !code;
    let exponent = ((code >> 4) & 0x07) as i32;
    let mantissa = (code & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if code & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expand 8-bit mu-law samples to 16-bit linear little-endian PCM.
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw.len() * PCM_SAMPLE_WIDTH);
    for &code in mulaw {
        let sample = ulaw_to_linear(code);
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm
}

/// Compress 16-bit linear PCM to 8-bit mu-law. A trailing odd byte is
/// truncated silently.
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(PCM_SAMPLE_WIDTH)
        .map(|pair| linear_to_ulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

pub fn duration_ms(pcm: &[u8], sample_rate: u32) -> f64 {
    let samples = pcm.len() / PCM_SAMPLE_WIDTH;
    samples as f64 / sample_rate as f64 * 1000.0
}

/// Streaming resampler for one rate pair. Input is drained in fixed 10 ms
/// chunks so phase state carries across successive calls on the same stream;
/// any remainder shorter than a chunk stays queued for the next call.
struct StreamResampler {
    inner: SincFixedIn<f32>,
    chunk: usize,
    fifo: Vec<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self, Error> {
        let ratio = to_rate as f64 / from_rate as f64;
        let chunk = (from_rate / 100) as usize;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.8,
            interpolation: SincInterpolationType::Nearest,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(ratio, 1.0, params, chunk, 1)
            .map_err(|err| Error::Resample(err.to_string()))?;
        Ok(Self {
            inner,
            chunk,
            fifo: Vec::new(),
        })
    }

    fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, Error> {
        self.fifo.extend_from_slice(input);
        let mut output = Vec::new();
        while self.fifo.len() >= self.chunk {
            let frame: Vec<f32> = self.fifo.drain(..self.chunk).collect();
            let mut resampled = self
                .inner
                .process(&[frame], None)
                .map_err(|err| Error::Resample(err.to_string()))?;
            output.append(&mut resampled.remove(0));
        }
        Ok(output)
    }
}

/// Audio converter with cached per-rate-pair resampler state. One instance
/// belongs to one stream direction; it is not shared across calls.
pub struct AudioConverter {
    resamplers: HashMap<(u32, u32), StreamResampler>,
}

impl AudioConverter {
    pub fn new() -> Self {
        Self {
            resamplers: HashMap::new(),
        }
    }

    /// Resample little-endian PCM16 between rates. Identical rates return the
    /// input unchanged.
    pub fn resample(&mut self, pcm: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, Error> {
        if from_rate == to_rate {
            return Ok(pcm.to_vec());
        }
        let samples: Vec<f32> = pcm
            .chunks_exact(PCM_SAMPLE_WIDTH)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        let resampler = match self.resamplers.entry((from_rate, to_rate)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(StreamResampler::new(from_rate, to_rate)?)
            }
        };
        let output = resampler.process(&samples)?;
        let mut bytes = Vec::with_capacity(output.len() * PCM_SAMPLE_WIDTH);
        for sample in output {
            let clamped = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            bytes.extend_from_slice(&clamped.to_le_bytes());
        }
        Ok(bytes)
    }

    /// Carrier inbound leg: mu-law 8 kHz to PCM16 at the model's input rate.
    pub fn carrier_to_model(&mut self, mulaw: &[u8], model_rate: u32) -> Result<Vec<u8>, Error> {
        let pcm = mulaw_to_pcm16(mulaw);
        self.resample(&pcm, CARRIER_SAMPLE_RATE, model_rate)
    }

    /// Model outbound leg: PCM16 at the model's output rate to mu-law 8 kHz.
    pub fn model_to_carrier(&mut self, pcm: &[u8], model_rate: u32) -> Result<Vec<u8>, Error> {
        let pcm_8k = self.resample(pcm, model_rate, CARRIER_SAMPLE_RATE)?;
        Ok(pcm16_to_mulaw(&pcm_8k))
    }
}

impl Default for AudioConverter {
    fn default() -> Self {
        Self::new()
    }
}
