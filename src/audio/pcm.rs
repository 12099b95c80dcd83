use super::PlaybackBuffer;

/// Full-scale divisor for 16-bit PCM
const PCM16_SCALE: f32 = 32768.0;

/// Convert normalized f32 samples to 16-bit little-endian PCM bytes.
/// Out-of-range input saturates at the i16 bounds instead of wrapping.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// Interpret bytes as interleaved 16-bit little-endian PCM and split it per channel.
/// A trailing partial frame is dropped.
pub fn decode_pcm16(data: &[u8], sample_rate: u32, num_channels: u16) -> PlaybackBuffer {
    let num_channels = num_channels.max(1) as usize;
    let frame_count = data.len() / (2 * num_channels);
    let mut channels = vec![Vec::with_capacity(frame_count); num_channels];

    for frame in data.chunks_exact(2 * num_channels) {
        for (channel, sample) in channels.iter_mut().zip(frame.chunks_exact(2)) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            channel.push(value as f32 / PCM16_SCALE);
        }
    }

    PlaybackBuffer::new(sample_rate, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_fixed_input() {
        let buffer = decode_pcm16(&[0x00, 0x40, 0x00, 0xC0], 24000, 1);
        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.channel(0), &[0.5, -0.5]);
    }

    #[test]
    fn test_decode_deinterleaves_channels() {
        // L=1, R=-1, L=32767, R=-32768
        let data = [0x01, 0x00, 0xFF, 0xFF, 0xFF, 0x7F, 0x00, 0x80];
        let buffer = decode_pcm16(&data, 24000, 2);
        assert_eq!(buffer.frame_count(), 2);
        assert_eq!(buffer.channel(0), &[1.0 / 32768.0, 32767.0 / 32768.0]);
        assert_eq!(buffer.channel(1), &[-1.0 / 32768.0, -1.0]);
    }

    #[test]
    fn test_decode_drops_partial_frame() {
        let buffer = decode_pcm16(&[0x00, 0x40, 0x00], 24000, 1);
        assert_eq!(buffer.channel(0), &[0.5]);

        let empty = decode_pcm16(&[], 24000, 1);
        assert_eq!(empty.frame_count(), 0);
        assert_eq!(empty.duration(), 0.0);
    }

    #[test]
    fn test_encode_scales_and_saturates() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5, -1.0, 1.0, 1.7, -3.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![0, 16384, -16384, -32768, 32767, 32767, -32768]);
    }

    #[test]
    fn test_encode_then_decode_preserves_in_range_samples() {
        let samples = [0.25f32, -0.125, 0.0];
        let buffer = decode_pcm16(&encode_pcm16(&samples), 16000, 1);
        assert_eq!(buffer.channel(0), &samples);
    }
}
