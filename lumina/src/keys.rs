//! Cache and coalescing fingerprints derived from requests.
//!
//! Three progressively finer keys govern sharing: the data-load key (one
//! download per URL), the image-load key (one decode/process chain per
//! identical output), and the memory-cache key (one stored bitmap per
//! identical output, ignoring transient load options).

use crate::loading::RequestCachePolicy;
use crate::request::{ImageRequest, ImageRequestOptions, ThumbnailOptions};

/// Fingerprint of a decoded image in the memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MemoryCacheKey {
    identifier: String,
    processors: Vec<String>,
    thumbnail: Option<ThumbnailOptions>,
}

impl MemoryCacheKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            identifier: request.cache_identifier(),
            processors: request.processor_identifiers(),
            thumbnail: request.thumbnail,
        }
    }
}

/// Fingerprint coalescing raw-byte downloads. Requests differing only in
/// processors share one download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DataLoadKey {
    identifier: String,
    cache_policy: RequestCachePolicy,
    allows_cellular: bool,
}

impl DataLoadKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            identifier: request.cache_identifier(),
            cache_policy: request.cache_policy(),
            allows_cellular: request.allows_cellular_access(),
        }
    }
}

/// Fingerprint coalescing whole loads (decode, process, decompress).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ImageLoadKey {
    memory: MemoryCacheKey,
    options: ImageRequestOptions,
    data: DataLoadKey,
}

impl ImageLoadKey {
    pub(crate) fn for_request(request: &ImageRequest) -> Self {
        Self {
            memory: MemoryCacheKey::for_request(request),
            options: request.options,
            data: DataLoadKey::for_request(request),
        }
    }
}

/// Textual data-cache key of the raw downloaded bytes.
pub(crate) fn data_cache_original_key(request: &ImageRequest) -> String {
    request.cache_identifier()
}

/// Textual data-cache key of the final (processed, re-encoded) image.
pub(crate) fn data_cache_image_key(request: &ImageRequest) -> String {
    let mut key = request.cache_identifier();
    for id in request.processor_identifiers() {
        key.push(',');
        key.push_str(&id);
    }
    if let Some(thumbnail) = request.thumbnail {
        key.push_str(&format!(
            ",thumb-{}-{}",
            thumbnail.max_pixel_size, thumbnail.prefer_embedded
        ));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{ImageProcessing, ProcessError, ProcessingContext};
    use crate::response::ImageContainer;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::Arc;
    use url::Url;

    struct TagProcessor(&'static str);

    impl ImageProcessing for TagProcessor {
        fn identifier(&self) -> &str {
            self.0
        }

        fn process(
            &self,
            container: ImageContainer,
            _context: &ProcessingContext,
        ) -> Result<ImageContainer, ProcessError> {
            Ok(container)
        }
    }

    fn request(url: &str) -> ImageRequest {
        ImageRequest::new(Url::parse(url).unwrap())
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn processors_change_memory_key_but_not_data_key() {
        let plain = request("https://example.com/cat.jpg");
        let processed = request("https://example.com/cat.jpg")
            .with_processors(vec![Arc::new(TagProcessor("resize"))]);

        assert_ne!(
            MemoryCacheKey::for_request(&plain),
            MemoryCacheKey::for_request(&processed)
        );
        assert_eq!(
            DataLoadKey::for_request(&plain),
            DataLoadKey::for_request(&processed)
        );
    }

    #[test]
    fn equal_keys_hash_equally() {
        let a = ImageLoadKey::for_request(&request("https://example.com/cat.jpg"));
        let b = ImageLoadKey::for_request(&request("https://example.com/cat.jpg"));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn load_options_split_image_keys() {
        let plain = request("https://example.com/cat.jpg");
        let mut reloading = plain.clone();
        reloading.options.reload_ignoring_cached_data = true;
        assert_ne!(
            ImageLoadKey::for_request(&plain),
            ImageLoadKey::for_request(&reloading)
        );
    }

    #[test]
    fn image_id_override_governs_every_key() {
        let by_url = request("https://example.com/cat.jpg");
        let by_id = request("https://other.example.com/fetch?x=1").with_image_id(
            by_url.cache_identifier(),
        );
        assert_eq!(
            MemoryCacheKey::for_request(&by_url).identifier,
            MemoryCacheKey::for_request(&by_id).identifier
        );
    }

    #[test]
    fn processed_data_cache_keys_append_processor_ids() {
        let processed = request("https://example.com/cat.jpg")
            .with_processors(vec![Arc::new(TagProcessor("resize"))]);
        assert_eq!(
            data_cache_image_key(&processed),
            "https://example.com/cat.jpg,resize"
        );
        assert_eq!(
            data_cache_original_key(&processed),
            "https://example.com/cat.jpg"
        );
    }
}
