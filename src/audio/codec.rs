//! Audio encoding and decoding
//!
//! The only module that pattern-matches on `AudioFormat`. Everything else
//! passes `AudioBytes` through opaquely and works in 16-bit mono PCM.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Cursor;

use crate::types::{AudioBytes, AudioFormat, PcmBuffer};

/// Convert i16 PCM samples to f32 normalized [-1.0, 1.0]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert f32 normalized samples to i16 PCM
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Interpret raw little-endian bytes as i16 samples.
///
/// A trailing odd byte is dropped.
pub fn le_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Downmix interleaved multi-channel samples to mono by averaging
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Resample mono PCM to a different rate (linear interpolation)
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        let val = samples[idx_floor] as f32 * (1.0 - frac) + samples[idx_ceil] as f32 * frac;
        out.push(val as i16);
    }

    out
}

/// Normalize a buffer to 16 kHz mono for the STT pipeline
pub fn normalize_for_stt(buffer: &PcmBuffer) -> PcmBuffer {
    let samples = resample(buffer.samples(), buffer.sample_rate(), crate::types::STT_SAMPLE_RATE);
    PcmBuffer::from_samples(samples, crate::types::STT_SAMPLE_RATE)
}

/// Encode mono PCM as a WAV container
pub fn encode_wav(buffer: &PcmBuffer) -> Result<AudioBytes> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
        for &sample in buffer.samples() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(AudioBytes::new(
        AudioFormat::Wav,
        buffer.sample_rate(),
        1,
        cursor.into_inner(),
    ))
}

/// Encode mono PCM as low-bitrate MP3 for remote STT uploads
pub fn encode_mp3(buffer: &PcmBuffer) -> Result<AudioBytes> {
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let mut builder = Builder::new().ok_or_else(|| anyhow!("Failed to create MP3 encoder"))?;
    builder
        .set_num_channels(1)
        .map_err(|e| anyhow!("MP3 encoder channels: {:?}", e))?;
    builder
        .set_sample_rate(buffer.sample_rate())
        .map_err(|e| anyhow!("MP3 encoder sample rate: {:?}", e))?;
    builder
        .set_brate(Bitrate::Kbps32)
        .map_err(|e| anyhow!("MP3 encoder bitrate: {:?}", e))?;
    builder
        .set_quality(Quality::Worst)
        .map_err(|e| anyhow!("MP3 encoder quality: {:?}", e))?;
    let mut encoder = builder
        .build()
        .map_err(|e| anyhow!("MP3 encoder init: {:?}", e))?;

    let samples = buffer.samples();
    let mut data = Vec::new();
    data.reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));

    let written = encoder
        .encode(MonoPcm(samples), data.spare_capacity_mut())
        .map_err(|e| anyhow!("MP3 encode: {:?}", e))?;
    // SAFETY: the encoder initialized exactly `written` bytes of spare capacity
    unsafe { data.set_len(data.len() + written) };

    let written = encoder
        .flush::<FlushNoGap>(data.spare_capacity_mut())
        .map_err(|e| anyhow!("MP3 flush: {:?}", e))?;
    // SAFETY: as above for the flushed tail
    unsafe { data.set_len(data.len() + written) };

    Ok(AudioBytes::new(
        AudioFormat::Mp3,
        buffer.sample_rate(),
        1,
        data,
    ))
}

/// Decode encoded audio to mono PCM at its native sample rate
pub fn decode_to_pcm(audio: &AudioBytes) -> Result<PcmBuffer> {
    match audio.format {
        AudioFormat::Pcm => {
            let samples = le_bytes_to_i16(&audio.data);
            let mono = downmix_to_mono(&samples, audio.channels);
            Ok(PcmBuffer::from_samples(mono, audio.sample_rate))
        }
        AudioFormat::Wav => decode_wav(&audio.data),
        AudioFormat::Mp3 => decode_with_rodio(&audio.data),
        AudioFormat::Opus => bail!("opus decoding is not supported"),
    }
}

fn decode_wav(data: &[u8]) -> Result<PcmBuffer> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).context("Failed to parse WAV data")?;
    let spec = reader.spec();

    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader.samples::<i16>().filter_map(|s| s.ok()).collect(),
        hound::SampleFormat::Float => {
            let floats: Vec<f32> = reader.samples::<f32>().filter_map(|s| s.ok()).collect();
            f32_to_i16(&floats)
        }
    };

    let mono = downmix_to_mono(&samples, spec.channels);
    Ok(PcmBuffer::from_samples(mono, spec.sample_rate))
}

fn decode_with_rodio(data: &[u8]) -> Result<PcmBuffer> {
    use rodio::Source;

    let decoder = rodio::Decoder::new(Cursor::new(data.to_vec()))
        .map_err(|e| anyhow!("Failed to decode audio: {}", e))?;
    let sample_rate = decoder.sample_rate();
    let channels = decoder.channels();

    let samples: Vec<i16> = decoder.collect();
    let mono = downmix_to_mono(&samples, channels);
    Ok(PcmBuffer::from_samples(mono, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i16_f32_conversion() {
        let samples = vec![0i16, 32767, -32768];
        let converted = i16_to_f32(&samples);
        assert!((converted[0] - 0.0).abs() < 0.001);
        assert!((converted[1] - 1.0).abs() < 0.001);
        assert!((converted[2] - (-1.0)).abs() < 0.001);

        let back = f32_to_i16(&[0.0, 1.0, -1.0]);
        assert_eq!(back, vec![0, 32767, -32767]);
    }

    #[test]
    fn test_le_bytes_to_i16_drops_trailing_byte() {
        let bytes = vec![0x01, 0x00, 0xff, 0xff, 0x7f];
        assert_eq!(le_bytes_to_i16(&bytes), vec![1, -1]);
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = vec![100, 200, -100, -200];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![150, -150]);
        assert_eq!(downmix_to_mono(&stereo, 1), stereo);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<i16> = (0..1600).map(|i| (i % 100) as i16).collect();
        let out = resample(&samples, 16_000, 8_000);
        assert_eq!(out.len(), 800);

        let same = resample(&samples, 16_000, 16_000);
        assert_eq!(same.len(), samples.len());
    }

    #[test]
    fn test_wav_roundtrip() {
        let buffer = PcmBuffer::from_samples(vec![0, 1000, -1000, 32767, -32768], 16_000);
        let encoded = encode_wav(&buffer).unwrap();
        assert_eq!(encoded.format, AudioFormat::Wav);

        let decoded = decode_to_pcm(&encoded).unwrap();
        assert_eq!(decoded.sample_rate(), 16_000);
        assert_eq!(decoded.samples(), buffer.samples());
    }

    #[test]
    fn test_pcm_passthrough() {
        let audio = AudioBytes::new(AudioFormat::Pcm, 24_000, 1, vec![0x01, 0x00, 0xff, 0xff]);
        let decoded = decode_to_pcm(&audio).unwrap();
        assert_eq!(decoded.samples(), &[1, -1]);
        assert_eq!(decoded.sample_rate(), 24_000);
    }

    #[test]
    fn test_opus_rejected() {
        let audio = AudioBytes::new(AudioFormat::Opus, 48_000, 1, vec![0; 16]);
        assert!(decode_to_pcm(&audio).is_err());
    }

    #[test]
    fn test_normalize_for_stt() {
        let buffer = PcmBuffer::from_samples(vec![0; 24_000], 24_000);
        let normalized = normalize_for_stt(&buffer);
        assert_eq!(normalized.sample_rate(), 16_000);
        assert_eq!(normalized.len(), 16_000);
    }

    #[test]
    fn test_mp3_encode_produces_frames() {
        let buffer = PcmBuffer::from_samples(vec![0; 16_000], 16_000);
        let encoded = encode_mp3(&buffer).unwrap();
        assert_eq!(encoded.format, AudioFormat::Mp3);
        assert!(!encoded.is_empty());
    }
}
