//! Image metadata persistence.
//!
//! [`MetadataBackend`] is the collection-level contract a database has to
//! offer (filtered find, field-set updates, deletes, index setup).
//! [`MetadataStore`] layers the typed image operations on top and routes
//! every call through [`ConnectionSupervisor::with_retry`], so a dropped
//! connection is rebuilt transparently within the configured attempt budget.

pub mod memory;
pub mod model;
pub mod postgres;

use crate::connection::{ConnectionSupervisor, Connector};
use crate::error::MetadataError;
use crate::ids::{ImageId, ProductId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

pub use memory::{MemoryBackend, Op};
pub use model::{ImageAsset, ImagePatch, ImageQuery, NewImageAsset, SortOrder};
pub use postgres::PgBackend;

/// Collection operations over image records.
///
/// All failures are classified by the implementation: lost connections as
/// `ConnectionError::TopologyLost`, uniqueness violations as
/// `MetadataError::WriteConflict`.
#[async_trait]
pub trait MetadataBackend: Connector {
    /// Create the collection and its indexes if missing.
    async fn ensure_indexes(&self, handle: &Self::Handle) -> Result<(), MetadataError>;

    async fn find(
        &self,
        handle: &Self::Handle,
        query: &ImageQuery,
    ) -> Result<Vec<ImageAsset>, MetadataError>;

    /// Insert a record; the backend assigns `id` and `created_at`.
    async fn insert_one(
        &self,
        handle: &Self::Handle,
        image: &NewImageAsset,
        display_order: u32,
    ) -> Result<ImageAsset, MetadataError>;

    /// Returns the updated record, `None` if `id` does not exist.
    async fn update_one(
        &self,
        handle: &Self::Handle,
        id: ImageId,
        patch: &ImagePatch,
    ) -> Result<Option<ImageAsset>, MetadataError>;

    /// Apply `patch` to every record matching `filter`.
    async fn update_many(
        &self,
        handle: &Self::Handle,
        filter: &ImageQuery,
        patch: &ImagePatch,
    ) -> Result<u64, MetadataError>;

    /// Assign several display orders of one product atomically.
    async fn set_display_orders(
        &self,
        handle: &Self::Handle,
        product_id: &ProductId,
        orders: &[(ImageId, u32)],
    ) -> Result<u64, MetadataError>;

    async fn delete_one(&self, handle: &Self::Handle, id: ImageId) -> Result<bool, MetadataError>;

    async fn delete_many(
        &self,
        handle: &Self::Handle,
        filter: &ImageQuery,
    ) -> Result<u64, MetadataError>;

    async fn max_display_order(
        &self,
        handle: &Self::Handle,
        product_id: &ProductId,
    ) -> Result<Option<u32>, MetadataError>;
}

/// Typed CRUD over product images.
pub struct MetadataStore<B: MetadataBackend> {
    supervisor: Arc<ConnectionSupervisor<B>>,
    max_attempts: u32,
}

impl<B: MetadataBackend> Clone for MetadataStore<B> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<B: MetadataBackend> MetadataStore<B> {
    pub fn new(supervisor: Arc<ConnectionSupervisor<B>>) -> Self {
        let max_attempts = supervisor.settings().operations.max_attempts;
        Self {
            supervisor,
            max_attempts,
        }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor<B>> {
        &self.supervisor
    }

    fn backend(&self) -> &B {
        self.supervisor.connector()
    }

    async fn run<T, F, Fut>(&self, operation: F) -> Result<T, MetadataError>
    where
        F: Fn(B::Handle) -> Fut,
        Fut: Future<Output = Result<T, MetadataError>>,
    {
        self.supervisor.with_retry(self.max_attempts, operation).await
    }

    /// Create the schema and indexes if missing.
    #[instrument(skip(self))]
    pub async fn ensure_indexes(&self) -> Result<(), MetadataError> {
        let backend = self.backend();
        self.run(move |handle| async move { backend.ensure_indexes(&handle).await })
            .await
    }

    /// Insert an image at the end of its product's gallery.
    ///
    /// The display order is `max + 1` (or 0 for the first image). Reading
    /// the maximum and inserting are two steps; a concurrent insert for the
    /// same product surfaces as `WriteConflict`.
    #[instrument(skip(self, image), fields(product_id = %image.product_id, primary = image.is_primary))]
    pub async fn insert(&self, image: &NewImageAsset) -> Result<ImageAsset, MetadataError> {
        let backend = self.backend();
        let inserted = self
            .run(move |handle| async move {
                let order = backend
                    .max_display_order(&handle, &image.product_id)
                    .await?
                    .map_or(0, |max| max + 1);
                backend.insert_one(&handle, image, order).await
            })
            .await?;

        debug!(
            image_id = %inserted.id,
            display_order = inserted.display_order,
            "Image metadata inserted"
        );
        Ok(inserted)
    }

    pub async fn find(&self, query: &ImageQuery) -> Result<Vec<ImageAsset>, MetadataError> {
        let backend = self.backend();
        self.run(move |handle| async move { backend.find(&handle, query).await })
            .await
    }

    /// All images of a product, ordered by display order.
    pub async fn find_by_product(
        &self,
        product_id: &ProductId,
    ) -> Result<Vec<ImageAsset>, MetadataError> {
        self.find(&ImageQuery::by_product(product_id)).await
    }

    pub async fn find_one(&self, id: ImageId) -> Result<ImageAsset, MetadataError> {
        let mut found = self.find(&ImageQuery::by_id(id).limit(1)).await?;
        found.pop().ok_or(MetadataError::NotFound(id))
    }

    pub async fn find_primary(
        &self,
        product_id: &ProductId,
    ) -> Result<Option<ImageAsset>, MetadataError> {
        let mut found = self
            .find(&ImageQuery::by_product(product_id).primary(true).limit(1))
            .await?;
        Ok(found.pop())
    }

    pub async fn find_secondary(
        &self,
        product_id: &ProductId,
    ) -> Result<Vec<ImageAsset>, MetadataError> {
        self.find(&ImageQuery::by_product(product_id).primary(false))
            .await
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: ImageId, patch: &ImagePatch) -> Result<ImageAsset, MetadataError> {
        let backend = self.backend();
        self.run(move |handle| async move { backend.update_one(&handle, id, patch).await })
            .await?
            .ok_or(MetadataError::NotFound(id))
    }

    /// Apply `patch` to every image of the product.
    #[instrument(skip(self, patch))]
    pub async fn update_many_by_product(
        &self,
        product_id: &ProductId,
        patch: &ImagePatch,
    ) -> Result<u64, MetadataError> {
        let backend = self.backend();
        let filter = &ImageQuery::by_product(product_id);
        self.run(move |handle| async move { backend.update_many(&handle, filter, patch).await })
            .await
    }

    /// Clear the primary flag on every image of the product.
    pub async fn demote_all(&self, product_id: &ProductId) -> Result<u64, MetadataError> {
        let backend = self.backend();
        let filter = &ImageQuery::by_product(product_id).primary(true);
        let patch = &ImagePatch::primary(false);
        self.run(move |handle| async move { backend.update_many(&handle, filter, patch).await })
            .await
    }

    /// Assign display orders atomically.
    #[instrument(skip(self, orders), fields(count = orders.len()))]
    pub async fn set_display_orders(
        &self,
        product_id: &ProductId,
        orders: &[(ImageId, u32)],
    ) -> Result<u64, MetadataError> {
        let backend = self.backend();
        self.run(move |handle| async move {
            backend.set_display_orders(&handle, product_id, orders).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_one(&self, id: ImageId) -> Result<bool, MetadataError> {
        let backend = self.backend();
        self.run(move |handle| async move { backend.delete_one(&handle, id).await })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_all_by_product(&self, product_id: &ProductId) -> Result<u64, MetadataError> {
        let backend = self.backend();
        let filter = &ImageQuery::by_product(product_id);
        self.run(move |handle| async move { backend.delete_many(&handle, filter).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSettings;
    use crate::error::ConnectionError;
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use std::time::Duration;

    fn store() -> MetadataStore<MemoryBackend> {
        let settings = ConnectionSettings {
            target: "memory://catalog".to_string(),
            handshake: RetryPolicy::fixed(3, Duration::from_millis(1)),
            operations: RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(4)),
        };
        MetadataStore::new(Arc::new(ConnectionSupervisor::new(
            MemoryBackend::default(),
            settings,
        )))
    }

    fn new_image(product: &str, is_primary: bool) -> NewImageAsset {
        NewImageAsset {
            product_id: ProductId::parse(product).unwrap(),
            remote_handle: format!("products/{}/{}.png", product, ImageId::new()),
            url: "memory://assets/x.png".to_string(),
            alt_text: None,
            is_primary,
            width: 10,
            height: 10,
            byte_size: 100,
            format: "png".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    fn product(id: &str) -> ProductId {
        ProductId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_display_order() {
        let store = store();
        let a = store.insert(&new_image("p1", true)).await.unwrap();
        let b = store.insert(&new_image("p1", false)).await.unwrap();
        let other = store.insert(&new_image("p2", true)).await.unwrap();
        let c = store.insert(&new_image("p1", false)).await.unwrap();

        assert_eq!(
            (a.display_order, b.display_order, c.display_order),
            (0, 1, 2)
        );
        assert_eq!(other.display_order, 0);

        let ids: Vec<ImageId> = store
            .find_by_product(&product("p1"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn test_find_one_missing_is_not_found() {
        let store = store();
        let id = ImageId::new();
        assert_eq!(store.find_one(id).await.unwrap_err(), MetadataError::NotFound(id));
        assert_eq!(
            store.update(id, &ImagePatch::primary(true)).await.unwrap_err(),
            MetadataError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_primary_and_secondary_lookups() {
        let store = store();
        let primary = store.insert(&new_image("p1", true)).await.unwrap();
        store.insert(&new_image("p1", false)).await.unwrap();
        store.insert(&new_image("p1", false)).await.unwrap();

        let found = store.find_primary(&product("p1")).await.unwrap().unwrap();
        assert_eq!(found.id, primary.id);
        assert_eq!(store.find_secondary(&product("p1")).await.unwrap().len(), 2);
        assert!(store.find_primary(&product("p2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_demote_and_bulk_delete() {
        let store = store();
        store.insert(&new_image("p1", true)).await.unwrap();
        store.insert(&new_image("p1", false)).await.unwrap();
        store.insert(&new_image("p2", true)).await.unwrap();

        assert_eq!(store.demote_all(&product("p1")).await.unwrap(), 1);
        assert!(store.find_primary(&product("p1")).await.unwrap().is_none());
        assert!(store.find_primary(&product("p2")).await.unwrap().is_some());

        assert_eq!(store.delete_all_by_product(&product("p1")).await.unwrap(), 2);
        assert!(store.find_by_product(&product("p1")).await.unwrap().is_empty());
        assert_eq!(store.find_by_product(&product("p2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_display_orders_swaps_atomically() {
        let store = store();
        let a = store.insert(&new_image("p1", true)).await.unwrap();
        let b = store.insert(&new_image("p1", false)).await.unwrap();

        store
            .set_display_orders(&product("p1"), &[(b.id, 0), (a.id, 1)])
            .await
            .unwrap();

        let ids: Vec<ImageId> = store
            .find_by_product(&product("p1"))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_duplicate_display_order_is_write_conflict() {
        let store = store();
        store.insert(&new_image("p1", true)).await.unwrap();
        let b = store.insert(&new_image("p1", false)).await.unwrap();

        let err = store
            .update(b.id, &ImagePatch::display_order(0))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::WriteConflict(_)));
    }

    #[tokio::test]
    async fn test_operations_survive_one_topology_loss() {
        let store = store();
        store.insert(&new_image("p1", true)).await.unwrap();

        store.supervisor().connector().fail_next(
            Op::Find,
            MetadataError::Connection(ConnectionError::TopologyLost("connection reset".into())),
        );

        let images = store.find_by_product(&product("p1")).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(store.supervisor().connector().opens(), 2);
    }

    #[tokio::test]
    async fn test_persistent_topology_loss_is_fatal() {
        let store = store();
        let backend = store.supervisor().connector();
        for _ in 0..3 {
            backend.fail_next(
                Op::Find,
                MetadataError::Connection(ConnectionError::TopologyLost("closed".into())),
            );
        }

        let err = store.find_by_product(&product("p1")).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::Connection(ConnectionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(backend.calls(Op::Find), 3);
    }
}
