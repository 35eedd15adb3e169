//! Inbound audio chunk decoder
//!
//! Raw PCM chunks are converted directly. Container chunks go through a
//! [`ContainerDecoder`]; when it rejects the data the payload is read as raw
//! PCM instead, so decoding never fails.

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;

use crate::audio::buffer::{AudioChunk, PcmBuffer};
use crate::codec::pcm::pcm16_to_f32;
use crate::error::CodecError;
use crate::protocol::AudioEncoding;

/// Decoder for container formats (the platform decoder seam)
#[async_trait]
pub trait ContainerDecoder: Send + Sync {
    async fn decode(&self, data: bytes::Bytes, mime: &str) -> Result<PcmBuffer, CodecError>;
}

/// RIFF/WAVE decoder backed by `hound`
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl WavDecoder {
    fn decode_blocking(data: &[u8]) -> Result<PcmBuffer, CodecError> {
        let mut reader = hound::WavReader::new(Cursor::new(data))
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| CodecError::DecodingFailed(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| CodecError::DecodingFailed(e.to_string()))?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let mono = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        Ok(PcmBuffer::new(mono, spec.sample_rate))
    }
}

#[async_trait]
impl ContainerDecoder for WavDecoder {
    async fn decode(&self, data: bytes::Bytes, mime: &str) -> Result<PcmBuffer, CodecError> {
        let lower = mime.to_ascii_lowercase();
        if !(lower.contains("wav") || lower.contains("wave")) && !data.starts_with(b"RIFF") {
            return Err(CodecError::UnsupportedEncoding(mime.to_string()));
        }
        tokio::task::spawn_blocking(move || Self::decode_blocking(&data))
            .await
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?
    }
}

/// Decodes chunks to PCM at the output sample rate
#[derive(Clone)]
pub struct ChunkDecoder {
    container: Arc<dyn ContainerDecoder>,
}

impl ChunkDecoder {
    pub fn new(container: Arc<dyn ContainerDecoder>) -> Self {
        Self { container }
    }

    /// Decode a chunk; raw PCM is interpreted at `output_rate`
    pub async fn decode(&self, chunk: &AudioChunk, output_rate: u32) -> PcmBuffer {
        match &chunk.encoding {
            AudioEncoding::Pcm => PcmBuffer::new(pcm16_to_f32(&chunk.payload), output_rate),
            AudioEncoding::Container(mime) => {
                match self.container.decode(chunk.payload.clone(), mime).await {
                    Ok(buffer) => buffer.resampled(output_rate).unwrap_or_else(|e| {
                        tracing::warn!("Dropping chunk {}: {}", chunk.sequence, e);
                        PcmBuffer::new(Vec::new(), output_rate)
                    }),
                    Err(e) => {
                        tracing::debug!(
                            "Container decode of chunk {} ({}) failed, reading as PCM: {}",
                            chunk.sequence,
                            mime,
                            e
                        );
                        PcmBuffer::new(pcm16_to_f32(&chunk.payload), output_rate)
                    }
                }
            }
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new(Arc::new(WavDecoder))
    }
}
