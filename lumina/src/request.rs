use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::loading::{DataPublisher, DataRequest, RequestCachePolicy};
use crate::processing::ImageProcessing;

/// Priority of an image load.
///
/// Priorities order admission into every pipeline work queue; a job's
/// effective priority is the maximum across its live subscribers and can be
/// raised or lowered while the job is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    /// Convert the priority to a queue weight (higher is more urgent).
    pub fn weight(self) -> u8 {
        match self {
            Priority::VeryLow => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::VeryHigh => 4,
        }
    }

    pub(crate) fn from_weight(weight: u8) -> Self {
        match weight {
            0 => Priority::VeryLow,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }
}

/// Per-request switches controlling which caches and stages participate in a
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageRequestOptions {
    /// Do not consult the memory cache before loading.
    pub skip_memory_cache_read: bool,
    /// Do not store the produced image in the memory cache.
    pub skip_memory_cache_write: bool,
    /// Do not persist anything to the data cache.
    pub skip_disk_cache_writes: bool,
    /// Bypass cached encoded data and always hit the loader.
    pub reload_ignoring_cached_data: bool,
    /// Serve only from caches; fail with `DataMissingInCache` otherwise.
    pub return_cache_data_dont_load: bool,
    /// Skip the decompression stage for this request.
    pub skip_decompression: bool,
}

/// Thumbnail generation hints forwarded to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailOptions {
    /// Longest-side bound, in pixels, of the produced thumbnail.
    pub max_pixel_size: u32,
    /// Prefer a thumbnail embedded in the source over downscaling.
    pub prefer_embedded: bool,
}

impl ThumbnailOptions {
    pub fn new(max_pixel_size: u32) -> Self {
        Self {
            max_pixel_size,
            prefer_embedded: false,
        }
    }
}

/// Where the bytes for a request come from.
#[derive(Clone)]
pub enum ImageRequestResource {
    /// Plain URL fetched through the data loader.
    Url(Url),
    /// Pre-built request carrying headers, timeout, and cache policy.
    UrlRequest(DataRequest),
    /// User-supplied asynchronous byte producer.
    Publisher(DataPublisher),
}

impl ImageRequestResource {
    /// URL backing the resource, if any.
    pub fn url(&self) -> Option<&Url> {
        match self {
            ImageRequestResource::Url(url) => Some(url),
            ImageRequestResource::UrlRequest(request) => Some(&request.url),
            ImageRequestResource::Publisher(_) => None,
        }
    }
}

impl fmt::Debug for ImageRequestResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRequestResource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ImageRequestResource::UrlRequest(request) => {
                f.debug_tuple("UrlRequest").field(request).finish()
            }
            ImageRequestResource::Publisher(publisher) => {
                f.debug_tuple("Publisher").field(&publisher.id).finish()
            }
        }
    }
}

impl PartialEq for ImageRequestResource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ImageRequestResource::Url(a), ImageRequestResource::Url(b)) => a == b,
            (ImageRequestResource::UrlRequest(a), ImageRequestResource::UrlRequest(b)) => a == b,
            (ImageRequestResource::Publisher(a), ImageRequestResource::Publisher(b)) => {
                a.id == b.id
            }
            _ => false,
        }
    }
}

/// An image request: a resource plus the ordered transformations to apply.
///
/// Requests are values: cloning is cheap and equality is structural.
/// Equality deliberately ignores `user_info`: the cache fingerprints derived
/// from a request must not depend on opaque caller baggage.
#[derive(Clone)]
pub struct ImageRequest {
    pub resource: ImageRequestResource,
    /// Processors applied in order after decoding.
    pub processors: Vec<Arc<dyn ImageProcessing>>,
    pub thumbnail: Option<ThumbnailOptions>,
    pub options: ImageRequestOptions,
    pub priority: Priority,
    /// Overrides the URL as the cache key when set. Must be non-empty.
    pub image_id: Option<String>,
    pub user_info: HashMap<String, String>,
}

impl ImageRequest {
    pub fn new(url: Url) -> Self {
        Self::with_resource(ImageRequestResource::Url(url))
    }

    pub fn from_request(request: DataRequest) -> Self {
        Self::with_resource(ImageRequestResource::UrlRequest(request))
    }

    pub fn from_publisher(publisher: DataPublisher) -> Self {
        Self::with_resource(ImageRequestResource::Publisher(publisher))
    }

    fn with_resource(resource: ImageRequestResource) -> Self {
        Self {
            resource,
            processors: Vec::new(),
            thumbnail: None,
            options: ImageRequestOptions::default(),
            priority: Priority::default(),
            image_id: None,
            user_info: HashMap::new(),
        }
    }

    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessing>>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: ImageRequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: ThumbnailOptions) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    /// Stable identifier used as the basis of every cache fingerprint: the
    /// image-id override when present, otherwise the URL (or publisher id).
    pub(crate) fn cache_identifier(&self) -> String {
        if let Some(id) = &self.image_id {
            return id.clone();
        }
        match &self.resource {
            ImageRequestResource::Url(url) => url.to_string(),
            ImageRequestResource::UrlRequest(request) => request.url.to_string(),
            ImageRequestResource::Publisher(publisher) => publisher.id.clone(),
        }
    }

    pub(crate) fn processor_identifiers(&self) -> Vec<String> {
        self.processors
            .iter()
            .map(|p| p.identifier().to_string())
            .collect()
    }

    /// Effective cache policy of the outgoing URL request.
    pub(crate) fn cache_policy(&self) -> RequestCachePolicy {
        if self.options.reload_ignoring_cached_data {
            return RequestCachePolicy::ReloadIgnoringCacheData;
        }
        match &self.resource {
            ImageRequestResource::UrlRequest(request) => request.cache_policy,
            _ => RequestCachePolicy::default(),
        }
    }

    pub(crate) fn allows_cellular_access(&self) -> bool {
        match &self.resource {
            ImageRequestResource::UrlRequest(request) => request.allows_cellular_access,
            _ => true,
        }
    }

    /// True for `file://` resources, which bypass the loader and the data
    /// cache entirely.
    pub(crate) fn is_local_resource(&self) -> bool {
        self.resource
            .url()
            .map(|url| url.scheme() == "file")
            .unwrap_or(false)
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("resource", &self.resource)
            .field("processors", &self.processor_identifiers())
            .field("thumbnail", &self.thumbnail)
            .field("options", &self.options)
            .field("priority", &self.priority)
            .field("image_id", &self.image_id)
            .finish()
    }
}

impl PartialEq for ImageRequest {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.processor_identifiers() == other.processor_identifiers()
            && self.thumbnail == other.thumbnail
            && self.options == other.options
            && self.priority == other.priority
            && self.image_id == other.image_id
    }
}

impl Eq for ImageRequest {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::ProcessingContext;
    use crate::response::ImageContainer;

    struct TagProcessor(&'static str);

    impl ImageProcessing for TagProcessor {
        fn identifier(&self) -> &str {
            self.0
        }

        fn process(
            &self,
            container: ImageContainer,
            _context: &ProcessingContext,
        ) -> Result<ImageContainer, crate::processing::ProcessError> {
            Ok(container)
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn requests_with_equal_fields_are_equal() {
        let a = ImageRequest::new(url("https://example.com/cat.jpg"))
            .with_processors(vec![Arc::new(TagProcessor("resize"))]);
        let b = ImageRequest::new(url("https://example.com/cat.jpg"))
            .with_processors(vec![Arc::new(TagProcessor("resize"))]);
        assert_eq!(a, b);
    }

    #[test]
    fn user_info_does_not_affect_equality() {
        let a = ImageRequest::new(url("https://example.com/cat.jpg"));
        let mut b = a.clone();
        b.user_info.insert("caller".into(), "grid-view".into());
        assert_eq!(a, b);
    }

    #[test]
    fn image_id_overrides_url_as_identifier() {
        let request =
            ImageRequest::new(url("https://example.com/cat.jpg")).with_image_id("cat-v2");
        assert_eq!(request.cache_identifier(), "cat-v2");
    }

    #[test]
    fn reload_option_overrides_cache_policy() {
        let mut request = ImageRequest::new(url("https://example.com/cat.jpg"));
        request.options.reload_ignoring_cached_data = true;
        assert_eq!(
            request.cache_policy(),
            RequestCachePolicy::ReloadIgnoringCacheData
        );
    }

    #[test]
    fn local_resources_are_detected() {
        assert!(ImageRequest::new(url("file:///tmp/cat.jpg")).is_local_resource());
        assert!(!ImageRequest::new(url("https://example.com/cat.jpg")).is_local_resource());
    }
}
