use crate::request::ImageRequest;
use crate::response::ImageResponse;

/// Advisor deciding whether a decoded image still needs rasterisation before
/// display, and performing it on a background slot when it does.
pub trait Decompressing: Send + Sync {
    fn should_decompress(&self, response: &ImageResponse, request: &ImageRequest) -> bool;

    fn decompress(&self, response: ImageResponse, request: &ImageRequest) -> ImageResponse;
}

/// Default advisor: the core's bitmaps are already rasterised, so nothing
/// ever needs decompression. Platform bindings install their own advisor.
#[derive(Debug, Default)]
pub struct NoopDecompressor;

impl Decompressing for NoopDecompressor {
    fn should_decompress(&self, _response: &ImageResponse, _request: &ImageRequest) -> bool {
        false
    }

    fn decompress(&self, response: ImageResponse, _request: &ImageRequest) -> ImageResponse {
        response
    }
}
