use thiserror::Error;

use crate::loading::UrlResponseInfo;
use crate::request::ImageRequest;
use crate::response::ImageContainer;

/// Context forwarded to processors alongside the container.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub request: ImageRequest,
    pub url_response: Option<UrlResponseInfo>,
    /// False when processing a progressive preview. Failures on previews are
    /// swallowed; failures on the terminal image fail the load.
    pub is_completed: bool,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProcessError(pub String);

/// A single image transformation in a request's processor list.
///
/// Identifiers must be stable and content-addressed: two processors that
/// produce the same output for the same input must report the same
/// identifier, because identifiers feed every cache fingerprint.
pub trait ImageProcessing: Send + Sync {
    fn identifier(&self) -> &str;

    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessingContext,
    ) -> Result<ImageContainer, ProcessError>;
}
