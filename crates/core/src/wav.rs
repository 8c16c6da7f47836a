//! WAV container muxing for raw PCM.

/// Size of the canonical RIFF/WAVE header written by [`encode`].
pub const WAV_HEADER_LEN: usize = 44;

/// Sample rate assumed for client PCM that does not declare one.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16000;

/// Largest `rate=` accepted from a mime.
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Largest `channels=` accepted from a mime.
pub const MAX_CHANNELS: u16 = 32;

/// Reasons a PCM stream cannot be described by a WAV header.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WavError {
    #[error("PCM payload of {0} bytes does not fit in a WAV container")]
    PayloadTooLarge(usize),
    #[error("PCM format {sample_rate} Hz x {channels} channels x {bits_per_sample} bits overflows the WAV header")]
    FormatOverflow {
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    },
}

/// Layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            bits_per_sample: 16,
            channels: 1,
        }
    }
}

impl PcmFormat {
    /// Reads `rate=` and `channels=` parameters from a mime such as
    /// `audio/pcm;rate=24000`. Missing, unparsable or out-of-range parameters
    /// keep the 16 kHz/16-bit/mono defaults.
    pub fn from_mime(mime: &str) -> Self {
        let mut format = Self::default();
        for param in mime.split(';').skip(1) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim() {
                "rate" => match value.trim().parse::<u32>() {
                    Ok(rate) if (1..=MAX_SAMPLE_RATE).contains(&rate) => format.sample_rate = rate,
                    _ => {}
                },
                "channels" => match value.trim().parse::<u16>() {
                    Ok(channels) if (1..=MAX_CHANNELS).contains(&channels) => {
                        format.channels = channels
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        format
    }
}

/// Canonical form used to compare declared mimes.
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(";")
}

/// Muxes PCM chunks, in order, into a WAV file.
///
/// Integer header fields are little-endian:
/// `RIFF <36+len> WAVE`, a 16-byte `fmt ` chunk (format 1), then `data <len>`
/// followed by the concatenated payload.
pub fn encode<C: AsRef<[u8]>>(
    pcm_chunks: &[C],
    sample_rate: u32,
    bits_per_sample: u16,
    channels: u16,
) -> Result<Vec<u8>, WavError> {
    let data_len: usize = pcm_chunks.iter().map(|c| c.as_ref().len()).sum();
    let data_size = u32::try_from(data_len)
        .ok()
        .filter(|size| size.checked_add(36).is_some())
        .ok_or(WavError::PayloadTooLarge(data_len))?;

    let overflow = WavError::FormatOverflow {
        sample_rate,
        channels,
        bits_per_sample,
    };
    let bytes_per_sample = bits_per_sample / 8;
    let byte_rate = sample_rate
        .checked_mul(u32::from(channels))
        .and_then(|rate| rate.checked_mul(u32::from(bytes_per_sample)))
        .ok_or_else(|| overflow.clone())?;
    let block_align = channels.checked_mul(bytes_per_sample).ok_or(overflow)?;

    let mut buffer = Vec::with_capacity(WAV_HEADER_LEN + data_len);

    buffer.extend_from_slice(b"RIFF");
    buffer.extend_from_slice(&(36 + data_size).to_le_bytes());
    buffer.extend_from_slice(b"WAVE");

    buffer.extend_from_slice(b"fmt ");
    buffer.extend_from_slice(&16u32.to_le_bytes());
    buffer.extend_from_slice(&1u16.to_le_bytes());
    buffer.extend_from_slice(&channels.to_le_bytes());
    buffer.extend_from_slice(&sample_rate.to_le_bytes());
    buffer.extend_from_slice(&byte_rate.to_le_bytes());
    buffer.extend_from_slice(&block_align.to_le_bytes());
    buffer.extend_from_slice(&bits_per_sample.to_le_bytes());

    buffer.extend_from_slice(b"data");
    buffer.extend_from_slice(&data_size.to_le_bytes());
    for chunk in pcm_chunks {
        buffer.extend_from_slice(chunk.as_ref());
    }

    Ok(buffer)
}

/// Convenience wrapper over [`encode`] taking a [`PcmFormat`].
pub fn encode_with_format<C: AsRef<[u8]>>(
    pcm_chunks: &[C],
    format: PcmFormat,
) -> Result<Vec<u8>, WavError> {
    encode(
        pcm_chunks,
        format.sample_rate,
        format.bits_per_sample,
        format.channels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn test_header_layout_for_one_second_of_16k_mono() {
        let chunks = vec![vec![0u8; 12000], vec![1u8; 20000]];
        let wav = encode(&chunks, 16000, 16, 1).unwrap();

        assert_eq!(wav.len(), 44 + 32000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32_at(&wav, 4), 32036);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(u32_at(&wav, 16), 16);
        assert_eq!(u16_at(&wav, 20), 1);
        assert_eq!(u16_at(&wav, 22), 1);
        assert_eq!(u32_at(&wav, 24), 16000);
        assert_eq!(u32_at(&wav, 28), 32000);
        assert_eq!(u16_at(&wav, 32), 2);
        assert_eq!(u16_at(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32_at(&wav, 40), 32000);
    }

    #[test]
    fn test_payload_is_concatenated_in_order() {
        let chunks: Vec<&[u8]> = vec![&[1, 2], &[3], &[], &[4, 5, 6]];
        let wav = encode(&chunks, 24000, 16, 1).unwrap();
        assert_eq!(&wav[WAV_HEADER_LEN..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(u32_at(&wav, 40), 6);
    }

    #[test]
    fn test_stereo_rates() {
        let wav = encode::<Vec<u8>>(&[], 48000, 16, 2).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN);
        assert_eq!(u32_at(&wav, 4), 36);
        assert_eq!(u32_at(&wav, 28), 48000 * 2 * 2);
        assert_eq!(u16_at(&wav, 32), 4);
        assert_eq!(u32_at(&wav, 40), 0);
    }

    #[test]
    fn test_format_from_mime() {
        assert_eq!(PcmFormat::from_mime("audio/pcm"), PcmFormat::default());
        let format = PcmFormat::from_mime("audio/pcm; rate=24000");
        assert_eq!(format.sample_rate, 24000);
        assert_eq!(format.channels, 1);
        let format = PcmFormat::from_mime("audio/pcm;rate=bogus;channels=2");
        assert_eq!(format.sample_rate, DEFAULT_INPUT_SAMPLE_RATE);
        assert_eq!(format.channels, 2);
    }

    #[test]
    fn test_out_of_range_mime_parameters_are_ignored() {
        let format = PcmFormat::from_mime("audio/pcm;rate=4294967295;channels=65535");
        assert_eq!(format, PcmFormat::default());
        let format = PcmFormat::from_mime("audio/pcm;rate=0;channels=0");
        assert_eq!(format, PcmFormat::default());
    }

    #[test]
    fn test_overflowing_format_is_rejected() {
        let err = encode(&[vec![0u8; 4]], u32::MAX, 16, 2).unwrap_err();
        assert!(matches!(err, WavError::FormatOverflow { .. }));
        let err = encode(&[vec![0u8; 4]], 16000, 16, u16::MAX).unwrap_err();
        assert!(matches!(err, WavError::FormatOverflow { .. }));
    }

    #[test]
    fn test_normalize_mime() {
        assert_eq!(normalize_mime(" Audio/PCM ; rate=16000"), "audio/pcm;rate=16000");
        assert_eq!(normalize_mime("audio/pcm;"), "audio/pcm");
    }
}
