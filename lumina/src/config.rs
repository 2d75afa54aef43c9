use crate::cache::data::DataCachePolicy;
use crate::cache::memory::MemoryCacheConfig;
use crate::cache::resumable::ResumableDataStorage;

/// Pipeline configuration.
///
/// Plain record: every field's effect is local and documented on the
/// component it controls. Defaults mirror a phone-class deployment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent slots of the data-load queue.
    pub max_concurrent_data_loads: usize,
    /// Concurrent slots of the decode queue.
    pub max_concurrent_decodes: usize,
    /// Concurrent slots of the process queue.
    pub max_concurrent_processes: usize,
    /// Concurrent slots of the decompression queue.
    pub max_concurrent_decompressions: usize,
    /// Concurrent slots of the encode queue.
    pub max_concurrent_encodes: usize,
    /// Concurrent slots of the data-cache read/write queue.
    pub max_concurrent_data_cache_ops: usize,

    /// Emit previews decoded from partial data.
    pub is_progressive_decoding_enabled: bool,
    /// Retain partial bytes of failed downloads and resume with range
    /// requests.
    pub is_resumable_data_enabled: bool,
    /// Collapse equivalent work onto shared jobs.
    pub is_task_coalescing_enabled: bool,
    /// Smooth download submission with a leaky bucket.
    pub is_rate_limiter_enabled: bool,
    /// Pace data-load admissions to avoid session thrash.
    pub is_congestion_control_enabled: bool,
    /// Run the decompression stage when the advisor asks for it.
    pub is_decompression_enabled: bool,
    /// Store progressive previews in the memory cache.
    pub is_storing_previews_in_memory_cache: bool,
    /// Read `file://` resources directly instead of going through the
    /// loader.
    pub is_local_resources_support_enabled: bool,

    /// What to persist into the injected data cache.
    pub data_cache_policy: DataCachePolicy,
    /// Memory cache limits.
    pub memory_cache: MemoryCacheConfig,
    /// Soft byte bound of the resumable-download registry.
    pub resumable_data_size_limit: u64,
    /// Sustained data-load submissions per second once the burst allowance
    /// is spent.
    pub rate_limiter_rate: f64,
    /// Data-load submissions admitted instantly from a cold start.
    pub rate_limiter_burst: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_data_loads: 6,
            max_concurrent_decodes: 1,
            max_concurrent_processes: 2,
            max_concurrent_decompressions: 2,
            max_concurrent_encodes: 1,
            max_concurrent_data_cache_ops: 2,
            is_progressive_decoding_enabled: false,
            is_resumable_data_enabled: true,
            is_task_coalescing_enabled: true,
            is_rate_limiter_enabled: true,
            is_congestion_control_enabled: true,
            is_decompression_enabled: true,
            is_storing_previews_in_memory_cache: false,
            is_local_resources_support_enabled: true,
            data_cache_policy: DataCachePolicy::default(),
            memory_cache: MemoryCacheConfig::default(),
            resumable_data_size_limit: ResumableDataStorage::DEFAULT_SIZE_LIMIT,
            rate_limiter_rate: 80.0,
            rate_limiter_burst: 25.0,
        }
    }
}
