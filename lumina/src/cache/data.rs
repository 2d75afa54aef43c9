use async_trait::async_trait;
use bytes::Bytes;

/// Injected persistent blob store.
///
/// The pipeline owns no on-disk state; it decides *what* to persist and
/// defers storage to this capability. Writes are fire-and-forget from the
/// pipeline's perspective.
#[async_trait]
pub trait DataCaching: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn put(&self, key: String, data: Bytes);

    async fn remove(&self, key: String);

    async fn clear(&self);
}

/// What the pipeline persists into the data cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataCachePolicy {
    /// Raw downloaded bytes, always.
    StoreOriginalData,
    /// The encoded final bitmap, after processing.
    StoreEncodedImages,
    /// Both raw bytes and the encoded final bitmap.
    StoreAll,
    /// Raw bytes for plain requests; the encoded final image for requests
    /// with processors.
    #[default]
    Automatic,
}

impl DataCachePolicy {
    pub(crate) fn stores_original(self, has_processors: bool) -> bool {
        match self {
            DataCachePolicy::StoreOriginalData | DataCachePolicy::StoreAll => true,
            DataCachePolicy::StoreEncodedImages => false,
            DataCachePolicy::Automatic => !has_processors,
        }
    }

    pub(crate) fn stores_encoded(self, has_processors: bool) -> bool {
        match self {
            DataCachePolicy::StoreEncodedImages | DataCachePolicy::StoreAll => true,
            DataCachePolicy::StoreOriginalData => false,
            DataCachePolicy::Automatic => has_processors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DataCachePolicy::*;

    #[test]
    fn automatic_policy_splits_on_processors() {
        assert!(Automatic.stores_original(false));
        assert!(!Automatic.stores_original(true));
        assert!(Automatic.stores_encoded(true));
        assert!(!Automatic.stores_encoded(false));
    }

    #[test]
    fn store_all_persists_both() {
        for has_processors in [false, true] {
            assert!(StoreAll.stores_original(has_processors));
            assert!(StoreAll.stores_encoded(has_processors));
        }
    }

    #[test]
    fn single_purpose_policies_are_exclusive() {
        assert!(StoreOriginalData.stores_original(true));
        assert!(!StoreOriginalData.stores_encoded(true));
        assert!(StoreEncodedImages.stores_encoded(false));
        assert!(!StoreEncodedImages.stores_original(false));
    }
}
