use std::io::Cursor;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Interleaved f32 PCM plus the source's format facts.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u32,
    pub sample_rate: f64,
}

impl DecodedAudio {
    pub fn frames(&self) -> u32 {
        (self.samples.len() / self.channels as usize) as u32
    }
}

/// Slicing and channel selection applied while decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOpts {
    pub start_frame: Option<u32>,
    pub num_frames: Option<u32>,
    /// Source channel indices to keep, in order. Empty keeps all.
    pub channels: Vec<u32>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reading source: {0}")]
    Wav(#[from] hound::Error),
    #[error("source has no channels")]
    NoChannels,
    #[error("channel {requested} out of range, source has {available}")]
    BadChannel { requested: u32, available: u32 },
    #[error("start frame {start} past end of {frames}-frame source")]
    BadStartFrame { start: u32, frames: u32 },
}

pub fn decode_wav_bytes(bytes: &[u8], opts: &DecodeOpts) -> Result<DecodedAudio, DecodeError> {
    decode_reader(hound::WavReader::new(Cursor::new(bytes))?, opts)
}

pub fn decode_wav_file(path: &Path, opts: &DecodeOpts) -> Result<DecodedAudio, DecodeError> {
    decode_reader(hound::WavReader::open(path)?, opts)
}

fn decode_reader<R: std::io::Read>(
    mut reader: hound::WavReader<R>,
    opts: &DecodeOpts,
) -> Result<DecodedAudio, DecodeError> {
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(DecodeError::NoChannels);
    }

    let source_channels = spec.channels as u32;
    let total_frames = reader.duration();

    for requested in &opts.channels {
        if *requested >= source_channels {
            return Err(DecodeError::BadChannel {
                requested: *requested,
                available: source_channels,
            });
        }
    }

    let start = opts.start_frame.unwrap_or(0);
    if start > total_frames {
        return Err(DecodeError::BadStartFrame { start, frames: total_frames });
    }

    let frames = opts.num_frames.unwrap_or(total_frames - start).min(total_frames - start);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => {
            reader.samples::<f32>().collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let keep: Vec<u32> = if opts.channels.is_empty() {
        (0..source_channels).collect()
    } else {
        opts.channels.clone()
    };

    let mut samples = Vec::with_capacity(frames as usize * keep.len());
    for frame in start..start + frames {
        let base = frame as usize * source_channels as usize;
        for channel in &keep {
            samples.push(interleaved[base + *channel as usize]);
        }
    }

    Ok(DecodedAudio {
        samples,
        channels: keep.len() as u32,
        sample_rate: spec.sample_rate as f64,
    })
}

/// Format facts and content hash without touching the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    pub frames: u32,
    pub channels: u32,
    pub sample_rate: u32,
    /// Hex sha-256 of the raw source bytes.
    pub hash: String,
}

pub fn sample_info(bytes: &[u8]) -> Result<SampleInfo, DecodeError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(DecodeError::NoChannels);
    }

    let digest = Sha256::digest(bytes);
    let hash = digest.iter().map(|byte| format!("{byte:02x}")).collect();

    Ok(SampleInfo {
        frames: reader.duration(),
        channels: spec.channels as u32,
        sample_rate: spec.sample_rate,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(channels: u16, frames: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for frame in 0..frames {
            for channel in 0..channels {
                writer.write_sample((frame as i16) * 100 + channel as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn decodes_interleaved() {
        let audio = decode_wav_bytes(&wav_bytes(2, 4), &DecodeOpts::default()).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.frames(), 4);
        assert_eq!(audio.sample_rate, 44_100.0);
        assert_eq!(audio.samples.len(), 8);
    }

    #[test]
    fn slices_frames_and_selects_channels() {
        let opts = DecodeOpts {
            start_frame: Some(1),
            num_frames: Some(2),
            channels: vec![1],
        };
        let audio = decode_wav_bytes(&wav_bytes(2, 4), &opts).unwrap();

        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frames(), 2);
        // frame 1 and 2, channel 1: 101 and 201 scaled by 2^-15
        let scale = 1.0 / 32768.0;
        assert_eq!(audio.samples, vec![101.0 * scale, 201.0 * scale]);
    }

    #[test]
    fn rejects_out_of_range_channel() {
        let opts = DecodeOpts { channels: vec![2], ..DecodeOpts::default() };
        assert!(matches!(
            decode_wav_bytes(&wav_bytes(2, 4), &opts),
            Err(DecodeError::BadChannel { requested: 2, available: 2 }),
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_wav_bytes(b"not a wav file at all", &DecodeOpts::default()),
            Err(DecodeError::Wav(_)),
        ));
    }

    #[test]
    fn info_hashes_content() {
        let bytes = wav_bytes(1, 8);
        let info = sample_info(&bytes).unwrap();

        assert_eq!(info.frames, 8);
        assert_eq!(info.channels, 1);
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.hash.len(), 64);
        assert_eq!(info.hash, sample_info(&bytes).unwrap().hash);

        let other = sample_info(&wav_bytes(1, 9)).unwrap();
        assert_ne!(info.hash, other.hash);
    }
}
