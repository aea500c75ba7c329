//! Product image orchestration.
//!
//! [`PrimaryImageCoordinator`] composes the object store and the metadata
//! store. There is no transaction spanning both: each operation runs a fixed
//! sequence of steps and, when one side commits and the other fails, reports
//! an [`OrchestrationError::PartialFailure`] naming the dangling object
//! instead of attempting compensation.
//!
//! Every product with at least one image has exactly one primary image after
//! each completed operation. Between the demote and promote steps of a
//! primary change, readers may briefly see no primary; they never see two.

use crate::asset_store::{BulkDeleteReport, ImageTransform, RemoteAssetStore, UploadRequest};
use crate::error::{MetadataError, OrchestrationError, Side};
use crate::ids::{ImageId, ProductId};
use crate::metadata_store::{
    ImageAsset, ImagePatch, MetadataBackend, MetadataStore, NewImageAsset,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// One image of a batch upload.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub alt_text: Option<String>,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            alt_text: None,
        }
    }

    pub fn with_alt_text(mut self, alt_text: impl Into<String>) -> Self {
        self.alt_text = Some(alt_text.into());
        self
    }
}

/// What happened to one batch item.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Committed(ImageAsset),
    Failed(OrchestrationError),
    /// Not attempted because an earlier item failed.
    Skipped,
}

/// Per-item result of [`PrimaryImageCoordinator::upload_batch`], in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.committed().count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Failed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Skipped))
            .count()
    }

    pub fn committed(&self) -> impl Iterator<Item = &ImageAsset> {
        self.outcomes.iter().filter_map(|o| match o {
            BatchOutcome::Committed(image) => Some(image),
            _ => None,
        })
    }
}

/// Result of deleting one image.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub deleted: ImageAsset,
    /// Image promoted to primary because the deleted one was primary.
    pub promoted: Option<ImageAsset>,
}

/// Result of removing everything a product owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProductTeardown {
    /// Images removed from both stores.
    pub images_deleted: usize,
    /// Objects swept from the product namespace afterwards.
    pub sweep: BulkDeleteReport,
}

/// Orchestrates image uploads, primary designation, ordering and deletion.
pub struct PrimaryImageCoordinator<B: MetadataBackend> {
    assets: Arc<dyn RemoteAssetStore>,
    metadata: MetadataStore<B>,
}

impl<B: MetadataBackend> PrimaryImageCoordinator<B> {
    pub fn new(assets: Arc<dyn RemoteAssetStore>, metadata: MetadataStore<B>) -> Self {
        Self { assets, metadata }
    }

    pub fn assets(&self) -> &Arc<dyn RemoteAssetStore> {
        &self.assets
    }

    pub fn metadata(&self) -> &MetadataStore<B> {
        &self.metadata
    }

    /// Upload bytes and record them. A failed insert after a successful
    /// upload leaves the object behind and is reported as a partial failure.
    async fn store_image(
        &self,
        operation: &'static str,
        product_id: &ProductId,
        bytes: Vec<u8>,
        alt_text: Option<String>,
        is_primary: bool,
    ) -> Result<ImageAsset, OrchestrationError> {
        let namespace = self.assets.namespace_for(product_id);
        let stored = self
            .assets
            .upload(UploadRequest::new(bytes, namespace))
            .await?;

        let record = NewImageAsset {
            product_id: product_id.clone(),
            remote_handle: stored.handle.clone(),
            url: stored.url,
            alt_text,
            is_primary,
            width: stored.width,
            height: stored.height,
            byte_size: stored.byte_size,
            format: stored.format,
            uploaded_at: Utc::now(),
        };

        match self.metadata.insert(&record).await {
            Ok(image) => {
                metrics::counter!("media.images.uploaded").increment(1);
                info!(
                    operation = operation,
                    image_id = %image.id,
                    remote_handle = %image.remote_handle,
                    display_order = image.display_order,
                    primary = image.is_primary,
                    "Image stored"
                );
                Ok(image)
            }
            Err(e) => {
                metrics::counter!("media.orphans.detected").increment(1);
                error!(
                    operation = operation,
                    remote_handle = %stored.handle,
                    error = %e,
                    "Uploaded object has no metadata record"
                );
                Err(OrchestrationError::PartialFailure {
                    operation,
                    succeeded: Side::RemoteStore,
                    failed: Side::MetadataStore,
                    remote_handle: stored.handle,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Upload a new primary image, demoting the current one first.
    ///
    /// If demotion fails nothing is uploaded.
    #[instrument(skip(self, bytes, alt_text), fields(product_id = %product_id, size_bytes = bytes.len()))]
    pub async fn upload_primary(
        &self,
        product_id: &ProductId,
        bytes: Vec<u8>,
        alt_text: Option<String>,
    ) -> Result<ImageAsset, OrchestrationError> {
        let demoted = self.metadata.demote_all(product_id).await?;
        debug!(demoted = demoted, "Demoted previous primary images");

        self.store_image("upload_primary", product_id, bytes, alt_text, true)
            .await
    }

    /// Upload a secondary image at the end of the gallery.
    #[instrument(skip(self, bytes, alt_text), fields(product_id = %product_id, size_bytes = bytes.len()))]
    pub async fn upload_additional(
        &self,
        product_id: &ProductId,
        bytes: Vec<u8>,
        alt_text: Option<String>,
    ) -> Result<ImageAsset, OrchestrationError> {
        self.store_image("upload_additional", product_id, bytes, alt_text, false)
            .await
    }

    /// Upload several images in order, marking `items[primary_index]` as the
    /// primary image.
    ///
    /// The first failing item stops the batch; items already committed stay
    /// committed and later items are reported as skipped. With an
    /// out-of-range or absent `primary_index` existing images keep their
    /// flags and every new image is secondary.
    #[instrument(skip(self, items), fields(product_id = %product_id, items = items.len()))]
    pub async fn upload_batch(
        &self,
        product_id: &ProductId,
        items: Vec<ImageUpload>,
        primary_index: Option<usize>,
    ) -> Result<BatchReport, OrchestrationError> {
        let primary_index = primary_index.filter(|&i| i < items.len());
        if primary_index.is_some() {
            self.metadata.demote_all(product_id).await?;
        }

        let mut report = BatchReport {
            outcomes: Vec::with_capacity(items.len()),
        };
        let mut aborted = false;

        for (index, item) in items.into_iter().enumerate() {
            if aborted {
                report.outcomes.push(BatchOutcome::Skipped);
                continue;
            }

            let is_primary = primary_index == Some(index);
            match self
                .store_image("upload_batch", product_id, item.bytes, item.alt_text, is_primary)
                .await
            {
                Ok(image) => report.outcomes.push(BatchOutcome::Committed(image)),
                Err(e) => {
                    warn!(index = index, error = %e, "Batch item failed, skipping the rest");
                    report.outcomes.push(BatchOutcome::Failed(e));
                    aborted = true;
                }
            }
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Batch upload finished"
        );
        Ok(report)
    }

    /// Make `image_id` the product's primary image.
    #[instrument(skip(self))]
    pub async fn set_primary(&self, image_id: ImageId) -> Result<ImageAsset, OrchestrationError> {
        let image = self.metadata.find_one(image_id).await?;
        self.metadata.demote_all(&image.product_id).await?;
        let promoted = self
            .metadata
            .update(image_id, &ImagePatch::primary(true))
            .await?;

        info!(product_id = %promoted.product_id, "Primary image changed");
        Ok(promoted)
    }

    /// Delete one image from both stores.
    ///
    /// The object is removed first; if that fails the record is kept. When
    /// the primary image is deleted, the remaining image with the lowest
    /// display order becomes primary.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, image_id: ImageId) -> Result<DeleteOutcome, OrchestrationError> {
        let image = self.metadata.find_one(image_id).await?;

        self.assets.delete(&image.remote_handle).await?;

        match self.metadata.delete_one(image_id).await {
            Ok(_) => {}
            Err(e) => {
                metrics::counter!("media.orphans.detected").increment(1);
                error!(
                    remote_handle = %image.remote_handle,
                    error = %e,
                    "Object deleted but metadata record remains"
                );
                return Err(OrchestrationError::PartialFailure {
                    operation: "delete_image",
                    succeeded: Side::RemoteStore,
                    failed: Side::MetadataStore,
                    remote_handle: image.remote_handle,
                    reason: e.to_string(),
                });
            }
        }
        metrics::counter!("media.images.deleted").increment(1);

        let promoted = if image.is_primary {
            self.promote_first(&image.product_id).await?
        } else {
            None
        };

        info!(
            product_id = %image.product_id,
            promoted = ?promoted.as_ref().map(|p| p.id),
            "Image deleted"
        );
        Ok(DeleteOutcome {
            deleted: image,
            promoted,
        })
    }

    /// Promote the remaining image with the lowest display order.
    async fn promote_first(
        &self,
        product_id: &ProductId,
    ) -> Result<Option<ImageAsset>, OrchestrationError> {
        let remaining = self.metadata.find_by_product(product_id).await?;
        let Some(first) = remaining.first() else {
            return Ok(None);
        };
        let promoted = self
            .metadata
            .update(first.id, &ImagePatch::primary(true))
            .await?;
        Ok(Some(promoted))
    }

    /// Delete every image of a product, continuing past individual failures.
    /// Returns the number of images removed from both stores.
    #[instrument(skip(self))]
    pub async fn delete_all_for_product(
        &self,
        product_id: &ProductId,
    ) -> Result<usize, OrchestrationError> {
        let images = self.metadata.find_by_product(product_id).await?;
        let total = images.len();
        let mut deleted = 0;

        for image in images {
            if let Err(e) = self.assets.delete(&image.remote_handle).await {
                warn!(image_id = %image.id, error = %e, "Keeping record, object delete failed");
                continue;
            }
            match self.metadata.delete_one(image.id).await {
                Ok(_) => {
                    metrics::counter!("media.images.deleted").increment(1);
                    deleted += 1;
                }
                Err(e) => {
                    metrics::counter!("media.orphans.detected").increment(1);
                    warn!(image_id = %image.id, error = %e, "Object deleted but record remains");
                }
            }
        }

        info!(deleted = deleted, total = total, "Deleted product images");
        Ok(deleted)
    }

    /// Delete every image, then sweep anything left in the product namespace.
    #[instrument(skip(self))]
    pub async fn teardown_product(
        &self,
        product_id: &ProductId,
    ) -> Result<ProductTeardown, OrchestrationError> {
        let images_deleted = self.delete_all_for_product(product_id).await?;
        let namespace = self.assets.namespace_for(product_id);
        let sweep = self.assets.delete_all_under_namespace(&namespace).await?;

        Ok(ProductTeardown {
            images_deleted,
            sweep,
        })
    }

    /// Reassign display orders `0..n` following `ordered_ids`, which must
    /// list every image of the product exactly once.
    #[instrument(skip(self, ordered_ids), fields(count = ordered_ids.len()))]
    pub async fn reorder(
        &self,
        product_id: &ProductId,
        ordered_ids: &[ImageId],
    ) -> Result<Vec<ImageAsset>, OrchestrationError> {
        let current: HashSet<ImageId> = self
            .metadata
            .find_by_product(product_id)
            .await?
            .into_iter()
            .map(|image| image.id)
            .collect();

        let requested: HashSet<ImageId> = ordered_ids.iter().copied().collect();
        if requested.len() != ordered_ids.len() {
            return Err(OrchestrationError::InvalidRequest(
                "image ids must not repeat".to_string(),
            ));
        }
        if requested != current {
            return Err(OrchestrationError::InvalidRequest(format!(
                "expected exactly the {} images of product {}",
                current.len(),
                product_id
            )));
        }

        let orders: Vec<(ImageId, u32)> = ordered_ids
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position as u32))
            .collect();
        self.metadata.set_display_orders(product_id, &orders).await?;

        Ok(self.metadata.find_by_product(product_id).await?)
    }

    /// Move one image to `display_order`. Fails with a write conflict if
    /// another image of the product already holds it.
    pub async fn set_display_order(
        &self,
        image_id: ImageId,
        display_order: u32,
    ) -> Result<ImageAsset, OrchestrationError> {
        Ok(self
            .metadata
            .update(image_id, &ImagePatch::display_order(display_order))
            .await?)
    }

    pub async fn update_alt_text(
        &self,
        image_id: ImageId,
        alt_text: Option<String>,
    ) -> Result<ImageAsset, OrchestrationError> {
        Ok(self
            .metadata
            .update(image_id, &ImagePatch::alt_text(alt_text))
            .await?)
    }

    /// All images of a product, in display order.
    pub async fn images(&self, product_id: &ProductId) -> Result<Vec<ImageAsset>, MetadataError> {
        self.metadata.find_by_product(product_id).await
    }

    pub async fn primary_image(
        &self,
        product_id: &ProductId,
    ) -> Result<Option<ImageAsset>, MetadataError> {
        self.metadata.find_primary(product_id).await
    }

    pub async fn secondary_images(
        &self,
        product_id: &ProductId,
    ) -> Result<Vec<ImageAsset>, MetadataError> {
        self.metadata.find_secondary(product_id).await
    }

    /// Display URL for an image, transformed unless `transform` is the identity.
    pub async fn image_url(
        &self,
        image_id: ImageId,
        transform: &ImageTransform,
    ) -> Result<String, MetadataError> {
        let image = self.metadata.find_one(image_id).await?;
        if transform.is_identity() {
            Ok(image.url)
        } else {
            Ok(self.assets.transformed_url(&image.remote_handle, transform))
        }
    }
}
