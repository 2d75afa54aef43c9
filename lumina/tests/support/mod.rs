//! Shared fakes for pipeline integration tests: a scripted data loader, an
//! in-memory data cache, and trivial codecs.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use lumina::codecs::DecodeError;
use lumina::processing::ProcessError;
use lumina::{
    DataCaching, DataChunk, DataLoadError, DataLoading, DataRequest, DataStream, DecoderRegistry,
    Decompressing, DecodingContext, EncodingContext, ImageContainer, ImageDecoding, ImageEncoding,
    ImagePipeline, ImageProcessing, ImageRequest, ImageResponse, PipelineConfig, PlatformImage,
    ProcessingContext, TaskEvent, TaskEvents, UrlResponseInfo, Validator,
};

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("test URL parses")
}

/// Config with the timing-sensitive smoothing knobs off, so admission order
/// is fully deterministic.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        is_rate_limiter_enabled: false,
        is_congestion_control_enabled: false,
        ..PipelineConfig::default()
    }
}

pub fn response_info(
    url: &Url,
    status_code: u16,
    expected: Option<u64>,
    validator: Option<Validator>,
) -> UrlResponseInfo {
    UrlResponseInfo {
        url: url.clone(),
        status_code,
        expected_content_length: expected,
        validator,
    }
}

/// First chunk of a response, carrying its metadata.
pub fn first_chunk(data: &[u8], info: UrlResponseInfo) -> DataChunk {
    DataChunk {
        data: Bytes::copy_from_slice(data),
        response: Some(info),
    }
}

pub fn chunk(data: &[u8]) -> DataChunk {
    DataChunk {
        data: Bytes::copy_from_slice(data),
        response: None,
    }
}

pub enum LoaderScript {
    /// Deliver these items and end the stream.
    Immediate(Vec<Result<DataChunk, DataLoadError>>),
    /// Deliver whatever the test feeds through the channel.
    Channel(mpsc::UnboundedReceiver<Result<DataChunk, DataLoadError>>),
}

/// Data loader replaying pre-registered scripts in call order, recording
/// every outgoing request.
pub struct ScriptedLoader {
    scripts: Mutex<VecDeque<LoaderScript>>,
    requests: Mutex<Vec<DataRequest>>,
    calls: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push_immediate(&self, items: Vec<Result<DataChunk, DataLoadError>>) {
        self.scripts.lock().push_back(LoaderScript::Immediate(items));
    }

    /// Register a channel-fed response; the test drives it chunk by chunk
    /// and ends it by dropping the sender.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<Result<DataChunk, DataLoadError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(LoaderScript::Channel(rx));
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn request(&self, index: usize) -> DataRequest {
        self.requests.lock()[index].clone()
    }

    pub fn request_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.url.to_string())
            .collect()
    }
}

impl DataLoading for ScriptedLoader {
    fn load(&self, request: &DataRequest) -> DataStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        match self.scripts.lock().pop_front() {
            Some(LoaderScript::Immediate(items)) => Box::pin(futures::stream::iter(items)),
            Some(LoaderScript::Channel(rx)) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::iter(vec![Err(DataLoadError::Stream(
                "no scripted response".into(),
            ))])),
        }
    }
}

/// In-memory stand-in for the injected blob store.
pub struct MemoryDataCache {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MemoryDataCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_blocking(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert_blocking(&self, key: &str, data: &[u8]) {
        self.entries
            .lock()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[async_trait]
impl DataCaching for MemoryDataCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().get(key).cloned()
    }

    async fn put(&self, key: String, data: Bytes) {
        self.entries.lock().insert(key, data);
    }

    async fn remove(&self, key: String) {
        self.entries.lock().remove(&key);
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Decoder treating the byte buffer itself as the "image": width tracks the
/// buffer length, so tests can assert on dimensions and round-tripped data.
pub struct TestDecoder {
    min_partial_bytes: usize,
    fail_terminal: bool,
}

impl ImageDecoding for TestDecoder {
    fn identifier(&self) -> &str {
        "test-decoder"
    }

    fn decode(&mut self, data: &Bytes) -> Result<ImageContainer, DecodeError> {
        if self.fail_terminal {
            return Err(DecodeError("synthetic decode failure".into()));
        }
        Ok(container_for(data))
    }

    fn decode_partial(&mut self, data: &Bytes) -> Option<ImageContainer> {
        (data.len() >= self.min_partial_bytes).then(|| container_for(data))
    }
}

pub fn container_for(data: &Bytes) -> ImageContainer {
    ImageContainer::new(PlatformImage::new(data.len() as u32, 1, 4, Bytes::new()))
}

pub fn sized_container(width: u32, height: u32) -> ImageContainer {
    ImageContainer::new(PlatformImage::new(width, height, 4, Bytes::new()))
}

pub struct TestDecoders {
    pub min_partial_bytes: usize,
    pub fail_terminal: bool,
}

impl TestDecoders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            min_partial_bytes: usize::MAX,
            fail_terminal: false,
        })
    }

    pub fn progressive(min_partial_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            min_partial_bytes,
            fail_terminal: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            min_partial_bytes: usize::MAX,
            fail_terminal: true,
        })
    }
}

impl DecoderRegistry for TestDecoders {
    fn decoder_for(&self, _context: &DecodingContext) -> Option<Box<dyn ImageDecoding>> {
        Some(Box::new(TestDecoder {
            min_partial_bytes: self.min_partial_bytes,
            fail_terminal: self.fail_terminal,
        }))
    }
}

/// Processor that counts invocations and tags the container.
pub struct CountingProcessor {
    id: String,
    calls: Arc<AtomicUsize>,
}

impl CountingProcessor {
    pub fn new(id: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                id: id.to_string(),
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

impl ImageProcessing for CountingProcessor {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn process(
        &self,
        mut container: ImageContainer,
        _context: &ProcessingContext,
    ) -> Result<ImageContainer, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        container
            .user_info
            .insert(format!("processed-by-{}", self.id), "true".into());
        Ok(container)
    }
}

pub struct FailingProcessor {
    pub id: String,
}

impl ImageProcessing for FailingProcessor {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn process(
        &self,
        _container: ImageContainer,
        _context: &ProcessingContext,
    ) -> Result<ImageContainer, ProcessError> {
        Err(ProcessError("synthetic processing failure".into()))
    }
}

/// Encoder emitting a readable `encoded:{width}x{height}` payload.
pub struct TestEncoder;

impl ImageEncoding for TestEncoder {
    fn encode(&self, container: &ImageContainer, _context: &EncodingContext) -> Option<Bytes> {
        Some(Bytes::from(format!(
            "encoded:{}x{}",
            container.image.width(),
            container.image.height()
        )))
    }
}

/// Advisor that decompresses every terminal image and leaves a marker.
pub struct MarkingDecompressor;

impl Decompressing for MarkingDecompressor {
    fn should_decompress(&self, response: &ImageResponse, _request: &ImageRequest) -> bool {
        !response.is_preview()
    }

    fn decompress(&self, mut response: ImageResponse, _request: &ImageRequest) -> ImageResponse {
        response
            .container
            .user_info
            .insert("decompressed".into(), "true".into());
        response
    }
}

/// Drain a task event stream, bailing out on a stuck stream instead of
/// hanging the test.
pub async fn collect_events(mut events: TaskEvents) -> Vec<TaskEvent> {
    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.next()).await {
            Ok(Some(event)) => collected.push(event),
            Ok(None) => return collected,
            Err(_) => panic!("timed out draining task events; saw {collected:?}"),
        }
    }
}

/// Poll until `predicate` holds; fire-and-forget cache writes land shortly
/// after task completion.
pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn progress_events(events: &[TaskEvent]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Progress(progress) => Some((progress.completed, progress.total)),
            _ => None,
        })
        .collect()
}

pub fn finished_ok(events: &[TaskEvent]) -> bool {
    matches!(events.last(), Some(TaskEvent::Finished(Ok(_))))
}

/// Pipeline wired with the scripted loader and whole-buffer test decoders.
pub fn basic_pipeline(loader: &Arc<ScriptedLoader>) -> ImagePipeline {
    ImagePipeline::builder(test_config())
        .data_loader(loader.clone())
        .decoders(TestDecoders::new())
        .build()
}
