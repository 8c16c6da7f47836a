use base64::Engine;
use parley_core::wav::{self, PcmFormat};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::warn;

// Define standard sample rates for clarity and consistency
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: u32 = 24000;
pub const GEMINI_LIVE_API_PCM16_SAMPLE_RATE: u32 = gemini_realtime::INPUT_SAMPLE_RATE;

const RESAMPLER_CHUNK_SIZE: usize = 512;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples mono little-endian PCM16 bytes from one rate to another.
///
/// Equal rates return the input untouched. A trailing odd byte is dropped.
pub fn resample_pcm16(pcm: &[u8], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<u8>> {
    if from_rate == to_rate || pcm.len() < 2 {
        return Ok(pcm.to_vec());
    }
    let samples = convert_i16_to_f32(&pcm16_from_bytes(pcm));
    let mut resampler = create_resampler(
        f64::from(from_rate),
        f64::from(to_rate),
        RESAMPLER_CHUNK_SIZE,
    )?;

    let mut resampled = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize);
    let mut rest = samples.as_slice();
    while rest.len() >= resampler.input_frames_next() {
        let (chunk, tail) = rest.split_at(resampler.input_frames_next());
        let out = resampler.process(&[chunk], None)?;
        resampled.extend_from_slice(&out[0]);
        rest = tail;
    }
    if !rest.is_empty() {
        let out = resampler.process_partial(Some(&[rest]), None)?;
        resampled.extend_from_slice(&out[0]);
    }

    Ok(pcm16_to_bytes(&convert_f32_to_i16(&resampled)))
}

/// Muxes a turn's audio parts into one base64 WAV file. Returns `None` when
/// there is no audio or the declared format cannot be muxed.
pub fn wav_base64(parts: &[Vec<u8>], mime: Option<&str>) -> Option<String> {
    if parts.iter().all(Vec::is_empty) {
        return None;
    }
    let format = mime.map(PcmFormat::from_mime).unwrap_or(PcmFormat {
        sample_rate: OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        ..PcmFormat::default()
    });
    match wav::encode_with_format(parts, format) {
        Ok(wav) => Some(base64::engine::general_purpose::STANDARD.encode(wav)),
        Err(e) => {
            warn!(error = %e, "Dropping turn audio");
            None
        }
    }
}

pub fn pcm16_from_bytes(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}
