//! Audio payload codecs
//!
//! Fixed-point PCM framing for the capture path and chunk decoding
//! (raw PCM or containers) for the playback path.

pub mod decoder;
pub mod pcm;

pub use decoder::{ChunkDecoder, ContainerDecoder, WavDecoder};

use crate::audio::buffer::AudioChunk;
use crate::error::CodecError;
use crate::protocol::Envelope;

/// Pull the base64 payload and encoding tag out of an audio envelope
pub fn chunk_from_envelope(envelope: &Envelope) -> Result<AudioChunk, CodecError> {
    let payload = envelope.audio_payload().ok_or(CodecError::MissingPayload)?;
    let bytes = pcm::decode_base64(payload)?;
    Ok(AudioChunk::new(bytes, envelope.audio_encoding()))
}
