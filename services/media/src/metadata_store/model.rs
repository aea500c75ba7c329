use crate::ids::{ImageId, ProductId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored image metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    /// Store-assigned image ID
    pub id: ImageId,
    /// Owning product
    pub product_id: ProductId,
    /// Object store handle (object key)
    pub remote_handle: String,
    /// Displayable URL
    pub url: String,
    /// Alternative text for accessibility
    pub alt_text: Option<String>,
    /// Position within the product's gallery
    pub display_order: u32,
    /// Whether this is the product's primary image
    pub is_primary: bool,
    /// Image width
    pub width: u32,
    /// Image height
    pub height: u32,
    /// Image size in bytes
    pub byte_size: u64,
    /// Image format
    pub format: String,
    /// When the bytes were uploaded
    pub uploaded_at: DateTime<Utc>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the caller when inserting. The store assigns `id`,
/// `display_order` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImageAsset {
    pub product_id: ProductId,
    pub remote_handle: String,
    pub url: String,
    pub alt_text: Option<String>,
    pub is_primary: bool,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Field-set update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePatch {
    pub is_primary: Option<bool>,
    /// `Some(None)` clears the alt text.
    pub alt_text: Option<Option<String>>,
    pub display_order: Option<u32>,
}

impl ImagePatch {
    pub fn primary(is_primary: bool) -> Self {
        Self {
            is_primary: Some(is_primary),
            ..Default::default()
        }
    }

    pub fn alt_text(alt_text: Option<String>) -> Self {
        Self {
            alt_text: Some(alt_text),
            ..Default::default()
        }
    }

    pub fn display_order(order: u32) -> Self {
        Self {
            display_order: Some(order),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_primary.is_none() && self.alt_text.is_none() && self.display_order.is_none()
    }

    /// Apply the patch to an in-memory record.
    pub fn apply(&self, image: &mut ImageAsset) {
        if let Some(is_primary) = self.is_primary {
            image.is_primary = is_primary;
        }
        if let Some(ref alt_text) = self.alt_text {
            image.alt_text = alt_text.clone();
        }
        if let Some(order) = self.display_order {
            image.display_order = order;
        }
    }
}

/// Sort direction on `display_order`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, sort and pagination for image lookups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageQuery {
    pub id: Option<ImageId>,
    pub product_id: Option<ProductId>,
    pub is_primary: Option<bool>,
    pub sort: SortOrder,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl ImageQuery {
    pub fn by_id(id: ImageId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_product(product_id: &ProductId) -> Self {
        Self {
            product_id: Some(product_id.clone()),
            ..Default::default()
        }
    }

    pub fn primary(mut self, is_primary: bool) -> Self {
        self.is_primary = Some(is_primary);
        self
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `image` passes the filter part of the query.
    pub fn matches(&self, image: &ImageAsset) -> bool {
        self.id.map_or(true, |id| image.id == id)
            && self
                .product_id
                .as_ref()
                .map_or(true, |p| &image.product_id == p)
            && self.is_primary.map_or(true, |p| image.is_primary == p)
    }
}
