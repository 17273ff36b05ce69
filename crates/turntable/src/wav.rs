//! Streaming WAV framing.

use tableconf::StreamConfig;

pub const WAV_HEADER_LEN: usize = 44;

/// RIFF and data sizes used when the stream length is unknown.
const UNBOUNDED: u32 = u32::MAX;

/// 44-byte PCM WAV header for an endless stream.
///
/// Both size fields are `0xFFFFFFFF`, which players treat as "read until EOF".
pub fn streaming_wav_header(stream: &StreamConfig) -> [u8; WAV_HEADER_LEN] {
    pcm_header(stream.sample_rate, stream.channels, stream.bits_per_sample)
}

pub fn pcm_header(sample_rate: u32, channels: u16, bits_per_sample: u16) -> [u8; WAV_HEADER_LEN] {
    let block_align = channels.saturating_mul(bits_per_sample / 8);
    let byte_rate = sample_rate.saturating_mul(u32::from(block_align));

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&UNBOUNDED.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&UNBOUNDED.to_le_bytes());
    header
}
