use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::loading::UrlResponseInfo;

/// Image format tag carried on decoded containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageType {
    /// Sniff the format from the leading magic bytes of an encoded buffer.
    pub fn from_signature(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageType::Jpeg)
        } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(ImageType::Png)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageType::Gif)
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageType::WebP)
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct PlatformImageInner {
    width: u32,
    height: u32,
    bytes_per_pixel: u8,
    pixels: Bytes,
}

/// Opaque, decompressed bitmap handle.
///
/// The pipeline never inspects pixel data; it only needs dimensions to price
/// memory-cache entries. Clones share the underlying allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformImage {
    inner: Arc<PlatformImageInner>,
}

impl PlatformImage {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u8, pixels: Bytes) -> Self {
        Self {
            inner: Arc::new(PlatformImageInner {
                width,
                height,
                bytes_per_pixel,
                pixels,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn bytes_per_pixel(&self) -> u8 {
        self.inner.bytes_per_pixel
    }

    pub fn pixels(&self) -> &Bytes {
        &self.inner.pixels
    }

    /// Memory-cache cost: `bytes_per_pixel × width × height`.
    pub fn cost(&self) -> u64 {
        u64::from(self.inner.bytes_per_pixel)
            * u64::from(self.inner.width)
            * u64::from(self.inner.height)
    }
}

/// A decoded image together with its encoded bytes and metadata.
#[derive(Debug, Clone)]
pub struct ImageContainer {
    pub image: PlatformImage,
    /// Original encoded bytes, when the decoder retained them.
    pub data: Option<Bytes>,
    pub image_type: Option<ImageType>,
    /// True for non-terminal images produced during progressive decoding.
    pub is_preview: bool,
    pub user_info: HashMap<String, String>,
}

impl ImageContainer {
    pub fn new(image: PlatformImage) -> Self {
        Self {
            image,
            data: None,
            image_type: None,
            is_preview: false,
            user_info: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.image_type = ImageType::from_signature(&data);
        self.data = Some(data);
        self
    }
}

/// Which layer satisfied a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOrigin {
    Network,
    Memory,
    Disk,
}

/// The result of a successful (or preview) image load.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    pub url_response: Option<UrlResponseInfo>,
    pub cache_origin: CacheOrigin,
}

impl ImageResponse {
    pub fn image(&self) -> &PlatformImage {
        &self.container.image
    }

    pub fn is_preview(&self) -> bool {
        self.container.is_preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_type_sniffing_recognises_common_signatures() {
        assert_eq!(
            ImageType::from_signature(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(ImageType::Jpeg)
        );
        assert_eq!(
            ImageType::from_signature(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A]),
            Some(ImageType::Png)
        );
        assert_eq!(ImageType::from_signature(b"GIF89a;"), Some(ImageType::Gif));
        assert_eq!(
            ImageType::from_signature(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            Some(ImageType::WebP)
        );
        assert_eq!(ImageType::from_signature(b"plain text"), None);
    }

    #[test]
    fn cost_scales_with_dimensions() {
        let image = PlatformImage::new(100, 50, 4, Bytes::new());
        assert_eq!(image.cost(), 100 * 50 * 4);
    }
}
