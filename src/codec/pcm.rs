//! 16-bit fixed-point PCM conversion and base64 framing

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::CodecError;

/// Convert float samples to 16-bit little-endian PCM bytes
///
/// Samples are scaled by 32767, clamped, and truncated toward zero.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert 16-bit little-endian PCM bytes to float samples
///
/// A trailing odd byte is ignored, so the result always has
/// `bytes.len() / 2` samples.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode one capture frame for the wire
pub fn encode_frame(samples: &[f32]) -> String {
    BASE64.encode(f32_to_pcm16(samples))
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}
