use super::transform::{transform_url, ImageTransform};
use super::{
    object_key, probe_image, product_namespace, BulkDeleteReport, RemoteAssetStore, StoredAsset,
    UploadRequest,
};
use crate::error::AssetStoreError;
use crate::ids::ProductId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

const MEMORY_BASE_URL: &str = "memory://assets";

#[derive(Debug, Default)]
struct Faults {
    /// Uploads that may still succeed before every further upload fails.
    uploads_remaining: Option<usize>,
    fail_deletes: bool,
    failing_handles: HashSet<String>,
    unconfigured: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Key to stored size in bytes.
    objects: BTreeMap<String, usize>,
    faults: Faults,
    next_version: u64,
    upload_calls: usize,
    delete_calls: usize,
}

/// In-process object store with fault injection.
#[derive(Debug)]
pub struct MemoryAssetStore {
    namespace_prefix: String,
    inner: Mutex<Inner>,
}

impl Default for MemoryAssetStore {
    fn default() -> Self {
        Self::new("products")
    }
}

impl MemoryAssetStore {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        Self {
            namespace_prefix: namespace_prefix.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Let `n` more uploads succeed, then fail every upload after that.
    pub fn fail_uploads_after(&self, n: usize) {
        self.inner.lock().faults.uploads_remaining = Some(n);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.lock().faults.fail_deletes = fail;
    }

    /// Make deletes of one particular handle fail.
    pub fn fail_delete_of(&self, handle: &str) {
        self.inner.lock().faults.failing_handles.insert(handle.to_string());
    }

    /// Behave as if no bucket or credentials were configured.
    pub fn set_unconfigured(&self, unconfigured: bool) {
        self.inner.lock().faults.unconfigured = unconfigured;
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.inner.lock().objects.contains_key(handle)
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn stored_size(&self, handle: &str) -> Option<usize> {
        self.inner.lock().objects.get(handle).copied()
    }

    pub fn handles(&self) -> Vec<String> {
        self.inner.lock().objects.keys().cloned().collect()
    }

    pub fn upload_calls(&self) -> usize {
        self.inner.lock().upload_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.lock().delete_calls
    }

    /// Store raw bytes under `handle` without probing, to simulate objects
    /// the metadata store does not know about.
    pub fn insert_raw(&self, handle: &str, bytes_len: usize) {
        self.inner.lock().objects.insert(handle.to_string(), bytes_len);
    }

    fn delete_locked(inner: &mut Inner, handle: &str) -> Result<(), AssetStoreError> {
        if inner.faults.fail_deletes || inner.faults.failing_handles.contains(handle) {
            return Err(AssetStoreError::DeleteFailed {
                handle: handle.to_string(),
                reason: "injected delete failure".to_string(),
            });
        }
        inner.objects.remove(handle);
        Ok(())
    }
}

#[async_trait]
impl RemoteAssetStore for MemoryAssetStore {
    async fn upload(&self, request: UploadRequest) -> Result<StoredAsset, AssetStoreError> {
        let mut inner = self.inner.lock();
        inner.upload_calls += 1;

        if inner.faults.unconfigured {
            return Err(AssetStoreError::NotConfigured(
                "memory store marked unconfigured".to_string(),
            ));
        }
        match inner.faults.uploads_remaining.as_mut() {
            Some(0) => {
                return Err(AssetStoreError::UploadFailed(
                    "injected upload failure".to_string(),
                ))
            }
            Some(n) => *n -= 1,
            None => {}
        }

        let probe = probe_image(&request.bytes)?;
        let key = object_key(&request.namespace, request.name.as_deref(), &probe);

        inner.next_version += 1;
        let version = inner.next_version;
        inner.objects.insert(key.clone(), request.bytes.len());

        Ok(StoredAsset {
            url: format!("{}/{}?v={}", MEMORY_BASE_URL, key, version),
            handle: key,
            width: probe.width,
            height: probe.height,
            byte_size: request.bytes.len() as u64,
            format: probe.format_name().to_string(),
        })
    }

    async fn delete(&self, handle: &str) -> Result<(), AssetStoreError> {
        let mut inner = self.inner.lock();
        inner.delete_calls += 1;
        Self::delete_locked(&mut inner, handle)
    }

    async fn delete_all_under_namespace(
        &self,
        namespace: &str,
    ) -> Result<BulkDeleteReport, AssetStoreError> {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();

        let mut report = BulkDeleteReport::default();
        for key in keys {
            inner.delete_calls += 1;
            match Self::delete_locked(&mut inner, &key) {
                Ok(()) => report.deleted += 1,
                Err(_) => report.failed += 1,
            }
        }
        Ok(report)
    }

    fn namespace_for(&self, product_id: &ProductId) -> String {
        product_namespace(&self.namespace_prefix, product_id)
    }

    fn transformed_url(&self, handle: &str, transform: &ImageTransform) -> String {
        transform_url(MEMORY_BASE_URL, handle, transform)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sample_png;
    use super::*;

    fn product(id: &str) -> ProductId {
        ProductId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_upload_probes_and_stores() {
        let store = MemoryAssetStore::default();
        let ns = store.namespace_for(&product("p1"));
        let asset = store
            .upload(UploadRequest::new(sample_png(8, 4), ns))
            .await
            .unwrap();

        assert!(asset.handle.starts_with("products/p1/"));
        assert_eq!((asset.width, asset.height), (8, 4));
        assert_eq!(asset.format, "png");
        assert!(store.contains(&asset.handle));
    }

    #[tokio::test]
    async fn test_overwrite_changes_url_version() {
        let store = MemoryAssetStore::default();
        let ns = store.namespace_for(&product("p1"));
        let first = store
            .upload(UploadRequest::new(sample_png(2, 2), ns.clone()).with_name("main"))
            .await
            .unwrap();
        let second = store
            .upload(UploadRequest::new(sample_png(3, 3), ns).with_name("main"))
            .await
            .unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(store.stored_size(&second.handle), Some(second.byte_size as usize));
        assert_ne!(first.url, second.url);
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryAssetStore::default();
        store.insert_raw("products/p1/a.png", 10);
        tokio_test::assert_ok!(store.delete("products/p1/a.png").await);
        tokio_test::assert_ok!(store.delete("products/p1/a.png").await);
        assert!(!store.contains("products/p1/a.png"));
    }

    #[tokio::test]
    async fn test_injected_upload_failure() {
        let store = MemoryAssetStore::default();
        store.fail_uploads_after(1);
        let ns = store.namespace_for(&product("p1"));

        tokio_test::assert_ok!(store.upload(UploadRequest::new(sample_png(1, 1), ns.clone())).await);
        assert!(matches!(
            store.upload(UploadRequest::new(sample_png(1, 1), ns)).await,
            Err(AssetStoreError::UploadFailed(_))
        ));
        assert_eq!(store.upload_calls(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_store_rejects_uploads() {
        let store = MemoryAssetStore::default();
        store.set_unconfigured(true);
        let ns = store.namespace_for(&product("p1"));
        assert!(matches!(
            store.upload(UploadRequest::new(sample_png(1, 1), ns)).await,
            Err(AssetStoreError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_namespace_sweep_counts_failures_and_respects_boundaries() {
        let store = MemoryAssetStore::default();
        store.insert_raw("products/p1/a.png", 1);
        store.insert_raw("products/p1/b.png", 1);
        store.insert_raw("products/p10/c.png", 1);
        store.fail_delete_of("products/p1/b.png");

        let report = store.delete_all_under_namespace("products/p1").await.unwrap();
        assert_eq!(report, BulkDeleteReport { deleted: 1, failed: 1 });
        assert!(store.contains("products/p1/b.png"));
        assert!(store.contains("products/p10/c.png"));
    }
}
