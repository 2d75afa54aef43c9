//! Decoder and encoder capabilities.
//!
//! Concrete codecs live outside the pipeline; the core only schedules them
//! and routes their results. A decoder instance is kept alive across the
//! progressive chunks of a single load so stateful scan-by-scan decoders
//! work unchanged.

use bytes::Bytes;
use thiserror::Error;

use crate::loading::UrlResponseInfo;
use crate::request::ImageRequest;
use crate::response::{CacheOrigin, ImageContainer};

/// Everything a registry can inspect when choosing a decoder.
#[derive(Debug, Clone)]
pub struct DecodingContext {
    pub request: ImageRequest,
    pub data: Bytes,
    /// False while the byte buffer is still growing (progressive chunks).
    pub is_completed: bool,
    pub url_response: Option<UrlResponseInfo>,
    pub cache_origin: CacheOrigin,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

/// A decoder bound to one load.
pub trait ImageDecoding: Send {
    /// Stable identifier reported in `decoding_failed` errors.
    fn identifier(&self) -> &str;

    /// Decode the complete byte buffer. Called for the terminal chunk; an
    /// error here fails the load.
    fn decode(&mut self, data: &Bytes) -> Result<ImageContainer, DecodeError>;

    /// Attempt a partial decode of a growing buffer. `None` means "not
    /// enough data yet"; the pipeline simply waits for the next chunk.
    fn decode_partial(&mut self, _data: &Bytes) -> Option<ImageContainer> {
        None
    }
}

/// Picks a decoder for a given context, or refuses (`None`).
///
/// Refusing a terminal chunk surfaces `decoder_not_registered`; refusing a
/// progressive chunk silently skips the preview.
pub trait DecoderRegistry: Send + Sync {
    fn decoder_for(&self, context: &DecodingContext) -> Option<Box<dyn ImageDecoding>>;
}

/// Registry with no decoders. Every terminal decode fails with
/// `decoder_not_registered`; real applications install their own registry.
#[derive(Debug, Default)]
pub struct EmptyDecoderRegistry;

impl DecoderRegistry for EmptyDecoderRegistry {
    fn decoder_for(&self, _context: &DecodingContext) -> Option<Box<dyn ImageDecoding>> {
        None
    }
}

/// Context handed to encoders when persisting processed images.
#[derive(Debug, Clone)]
pub struct EncodingContext {
    pub request: ImageRequest,
    pub url_response: Option<UrlResponseInfo>,
}

/// Encodes a container back into bytes for the data cache. Returning `None`
/// skips persistence.
pub trait ImageEncoding: Send + Sync {
    fn encode(&self, container: &ImageContainer, context: &EncodingContext) -> Option<Bytes>;
}
