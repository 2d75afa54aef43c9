//! Lumina is a concurrent image loading pipeline.
//!
//! A load request travels through a graph of reference-counted jobs that
//! fetch, decode, process, and decompress images. Equivalent work coalesces
//! onto shared jobs, priorities propagate upward, cancellation tears chains
//! down, and two cache layers (an in-process LRU and an injected blob
//! store) short-circuit repeat work. Interrupted downloads resume with
//! range requests.
//!
//! Concrete codecs, bitmap manipulation, and platform bindings stay outside
//! the crate; they are injected through the capability traits in
//! [`codecs`], [`processing`], [`decompression`], [`loading`], and
//! [`cache::data`].

pub mod cache;
pub mod codecs;
pub mod config;
pub mod decompression;
pub mod error;
mod keys;
pub mod loading;
pub mod pipeline;
pub mod processing;
pub mod request;
pub mod response;
pub mod task;

pub use cache::{DataCachePolicy, DataCaching, MemoryCache, MemoryCacheConfig};
pub use codecs::{
    DecoderRegistry, DecodingContext, EncodingContext, ImageDecoding, ImageEncoding,
};
pub use config::PipelineConfig;
pub use decompression::Decompressing;
pub use error::{DataLoadError, ImagePipelineError, Result};
pub use loading::{
    DataChunk, DataLoading, DataPublisher, DataRequest, DataStream, UrlSessionDataLoader,
    UrlResponseInfo, Validator,
};
pub use pipeline::{ImagePipeline, ImagePipelineBuilder};
pub use processing::{ImageProcessing, ProcessingContext};
pub use request::{
    ImageRequest, ImageRequestOptions, ImageRequestResource, Priority, ThumbnailOptions,
};
pub use response::{CacheOrigin, ImageContainer, ImageResponse, ImageType, PlatformImage};
pub use task::{ImageTask, TaskEvent, TaskEvents, TaskProgress, TaskState};
