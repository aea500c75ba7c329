use super::model::{ImageAsset, ImagePatch, ImageQuery, NewImageAsset, SortOrder};
use super::MetadataBackend;
use crate::connection::Connector;
use crate::error::{ConnectionError, MetadataError};
use crate::ids::{ImageId, ProductId};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Backend operations, used to target injected failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    EnsureIndexes,
    Find,
    InsertOne,
    UpdateOne,
    UpdateMany,
    SetDisplayOrders,
    DeleteOne,
    DeleteMany,
    MaxDisplayOrder,
    /// Matches every operation.
    Any,
}

#[derive(Debug, Default)]
struct Inner {
    images: Vec<ImageAsset>,
    /// Generation of the currently open handle.
    live: Option<u64>,
    generation: u64,
    connect_failures: VecDeque<ConnectionError>,
    op_failures: VecDeque<(Op, MetadataError)>,
    calls: HashMap<Op, u32>,
    indexed: bool,
}

/// In-process metadata backend.
///
/// Enforces the same constraints as the Postgres schema: display orders are
/// unique per product and a product has at most one primary image.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `open` with `err`. Queued failures are consumed in order.
    pub fn fail_next_connect(&self, err: ConnectionError) {
        self.inner.lock().connect_failures.push_back(err);
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Op, err: MetadataError) {
        self.inner.lock().op_failures.push_back((op, err));
    }

    /// Simulate the server dropping the connection: the current handle stops
    /// being live and the next operation on it reports topology loss.
    pub fn drop_connection(&self) {
        self.inner.lock().live = None;
    }

    /// Number of successful opens.
    pub fn opens(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn indexed(&self) -> bool {
        self.inner.lock().indexed
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<ImageAsset> {
        self.inner.lock().images.clone()
    }

    fn begin(&self, op: Op, handle: &u64) -> Result<parking_lot::MutexGuard<'_, Inner>, MetadataError> {
        let mut inner = self.inner.lock();
        *inner.calls.entry(op).or_insert(0) += 1;

        if let Some(pos) = inner
            .op_failures
            .iter()
            .position(|(target, _)| *target == op || *target == Op::Any)
        {
            if let Some((_, err)) = inner.op_failures.remove(pos) {
                return Err(err);
            }
        }

        if inner.live != Some(*handle) {
            return Err(MetadataError::Connection(ConnectionError::TopologyLost(
                "handle is no longer connected".to_string(),
            )));
        }
        Ok(inner)
    }
}

/// Reject states that a unique index would reject.
fn check_constraints(images: &[ImageAsset]) -> Result<(), MetadataError> {
    let mut orders = HashSet::new();
    let mut primaries = HashSet::new();
    for image in images {
        if !orders.insert((&image.product_id, image.display_order)) {
            return Err(MetadataError::WriteConflict(format!(
                "display order {} already used by product {}",
                image.display_order, image.product_id
            )));
        }
        if image.is_primary && !primaries.insert(&image.product_id) {
            return Err(MetadataError::WriteConflict(format!(
                "product {} already has a primary image",
                image.product_id
            )));
        }
    }
    Ok(())
}

/// Apply `change` to a copy and commit only if the constraints still hold.
fn commit<T>(
    images: &mut Vec<ImageAsset>,
    change: impl FnOnce(&mut Vec<ImageAsset>) -> T,
) -> Result<T, MetadataError> {
    let mut next = images.clone();
    let out = change(&mut next);
    check_constraints(&next)?;
    *images = next;
    Ok(out)
}

#[async_trait]
impl Connector for MemoryBackend {
    type Handle = u64;

    async fn open(&self, _target: &str) -> Result<u64, ConnectionError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.connect_failures.pop_front() {
            return Err(err);
        }
        inner.generation += 1;
        inner.live = Some(inner.generation);
        Ok(inner.generation)
    }

    async fn close(&self, handle: u64) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.live == Some(handle) {
            inner.live = None;
        }
        Ok(())
    }

    fn is_live(&self, handle: &u64) -> bool {
        self.inner.lock().live == Some(*handle)
    }

    async fn ping(&self, handle: &u64) -> Result<(), ConnectionError> {
        if self.is_live(handle) {
            Ok(())
        } else {
            Err(ConnectionError::TopologyLost("handle is no longer connected".to_string()))
        }
    }
}

#[async_trait]
impl MetadataBackend for MemoryBackend {
    async fn ensure_indexes(&self, handle: &u64) -> Result<(), MetadataError> {
        let mut inner = self.begin(Op::EnsureIndexes, handle)?;
        inner.indexed = true;
        Ok(())
    }

    async fn find(&self, handle: &u64, query: &ImageQuery) -> Result<Vec<ImageAsset>, MetadataError> {
        let inner = self.begin(Op::Find, handle)?;
        let mut found: Vec<ImageAsset> = inner
            .images
            .iter()
            .filter(|image| query.matches(image))
            .cloned()
            .collect();

        found.sort_by(|a, b| {
            let ord = a
                .product_id
                .cmp(&b.product_id)
                .then(a.display_order.cmp(&b.display_order));
            match query.sort {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });

        let skip = query.skip.unwrap_or(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(found.into_iter().skip(skip).take(limit).collect())
    }

    async fn insert_one(
        &self,
        handle: &u64,
        image: &NewImageAsset,
        display_order: u32,
    ) -> Result<ImageAsset, MetadataError> {
        let mut inner = self.begin(Op::InsertOne, handle)?;
        let record = ImageAsset {
            id: ImageId::new(),
            product_id: image.product_id.clone(),
            remote_handle: image.remote_handle.clone(),
            url: image.url.clone(),
            alt_text: image.alt_text.clone(),
            display_order,
            is_primary: image.is_primary,
            width: image.width,
            height: image.height,
            byte_size: image.byte_size,
            format: image.format.clone(),
            uploaded_at: image.uploaded_at,
            created_at: Utc::now(),
        };
        let inserted = record.clone();
        commit(&mut inner.images, move |images| images.push(record))?;
        Ok(inserted)
    }

    async fn update_one(
        &self,
        handle: &u64,
        id: ImageId,
        patch: &ImagePatch,
    ) -> Result<Option<ImageAsset>, MetadataError> {
        let mut inner = self.begin(Op::UpdateOne, handle)?;
        commit(&mut inner.images, |images| {
            images.iter_mut().find(|image| image.id == id).map(|image| {
                patch.apply(image);
                image.clone()
            })
        })
    }

    async fn update_many(
        &self,
        handle: &u64,
        filter: &ImageQuery,
        patch: &ImagePatch,
    ) -> Result<u64, MetadataError> {
        let mut inner = self.begin(Op::UpdateMany, handle)?;
        commit(&mut inner.images, |images| {
            let mut count = 0;
            for image in images.iter_mut().filter(|image| filter.matches(image)) {
                patch.apply(image);
                count += 1;
            }
            count
        })
    }

    async fn set_display_orders(
        &self,
        handle: &u64,
        product_id: &ProductId,
        orders: &[(ImageId, u32)],
    ) -> Result<u64, MetadataError> {
        let mut inner = self.begin(Op::SetDisplayOrders, handle)?;
        commit(&mut inner.images, |images| {
            let mut count = 0;
            for (id, order) in orders {
                if let Some(image) = images
                    .iter_mut()
                    .find(|image| image.id == *id && &image.product_id == product_id)
                {
                    image.display_order = *order;
                    count += 1;
                }
            }
            count
        })
    }

    async fn delete_one(&self, handle: &u64, id: ImageId) -> Result<bool, MetadataError> {
        let mut inner = self.begin(Op::DeleteOne, handle)?;
        let before = inner.images.len();
        inner.images.retain(|image| image.id != id);
        Ok(inner.images.len() < before)
    }

    async fn delete_many(&self, handle: &u64, filter: &ImageQuery) -> Result<u64, MetadataError> {
        let mut inner = self.begin(Op::DeleteMany, handle)?;
        let before = inner.images.len();
        inner.images.retain(|image| !filter.matches(image));
        Ok((before - inner.images.len()) as u64)
    }

    async fn max_display_order(
        &self,
        handle: &u64,
        product_id: &ProductId,
    ) -> Result<Option<u32>, MetadataError> {
        let inner = self.begin(Op::MaxDisplayOrder, handle)?;
        Ok(inner
            .images
            .iter()
            .filter(|image| &image.product_id == product_id)
            .map(|image| image.display_order)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_image(product: &str, is_primary: bool) -> NewImageAsset {
        NewImageAsset {
            product_id: ProductId::parse(product).unwrap(),
            remote_handle: "products/p/x.png".to_string(),
            url: String::new(),
            alt_text: None,
            is_primary,
            width: 1,
            height: 1,
            byte_size: 1,
            format: "png".to_string(),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_second_primary_is_rejected() {
        let backend = MemoryBackend::new();
        let handle = backend.open("memory://").await.unwrap();
        backend.insert_one(&handle, &new_image("p1", true), 0).await.unwrap();

        let err = backend
            .insert_one(&handle, &new_image("p1", true), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::WriteConflict(_)));
        assert_eq!(backend.records().len(), 1);

        // Other products are independent.
        tokio_test::assert_ok!(backend.insert_one(&handle, &new_image("p2", true), 0).await);
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_topology_loss() {
        let backend = MemoryBackend::new();
        let handle = backend.open("memory://").await.unwrap();
        backend.drop_connection();

        assert!(!backend.is_live(&handle));
        let err = backend.find(&handle, &ImageQuery::default()).await.unwrap_err();
        assert!(err.is_topology_loss());
    }

    #[tokio::test]
    async fn test_injected_failures_target_one_operation() {
        let backend = MemoryBackend::new();
        let handle = backend.open("memory://").await.unwrap();
        backend.fail_next(Op::InsertOne, MetadataError::WriteConflict("boom".into()));

        tokio_test::assert_ok!(backend.find(&handle, &ImageQuery::default()).await);
        assert!(backend.insert_one(&handle, &new_image("p1", true), 0).await.is_err());
        tokio_test::assert_ok!(backend.insert_one(&handle, &new_image("p1", true), 0).await);
        assert_eq!(backend.calls(Op::InsertOne), 2);
    }

    #[tokio::test]
    async fn test_find_sorts_and_paginates() {
        let backend = MemoryBackend::new();
        let handle = backend.open("memory://").await.unwrap();
        for order in [2, 0, 1] {
            backend
                .insert_one(&handle, &new_image("p1", false), order)
                .await
                .unwrap();
        }

        let product = ProductId::parse("p1").unwrap();
        let desc = backend
            .find(&handle, &ImageQuery::by_product(&product).sorted(SortOrder::Descending))
            .await
            .unwrap();
        let orders: Vec<u32> = desc.iter().map(|i| i.display_order).collect();
        assert_eq!(orders, vec![2, 1, 0]);

        let page = backend
            .find(&handle, &ImageQuery::by_product(&product).skip(1).limit(1))
            .await
            .unwrap();
        assert_eq!(page[0].display_order, 1);
    }
}
