//! Binary object storage for product images.
//!
//! Every product owns a namespace (`{prefix}/{product_id}`) in the object
//! store. Uploads return an opaque handle (the object key) together with the
//! displayable URL and the dimensions probed from the image header.

pub mod memory;
pub mod s3;
pub mod transform;

use crate::error::AssetStoreError;
use crate::ids::ProductId;
use async_trait::async_trait;
use image::ImageFormat;
use std::io::Cursor;

pub use memory::MemoryAssetStore;
pub use s3::S3AssetStore;
pub use transform::{Crop, ImageTransform};

/// Bytes to store and where to store them.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    /// Product namespace, see [`RemoteAssetStore::namespace_for`].
    pub namespace: String,
    /// Object name inside the namespace; a fresh unique name when `None`.
    /// Uploading twice under the same name replaces the first object.
    pub name: Option<String>,
}

impl UploadRequest {
    pub fn new(bytes: Vec<u8>, namespace: impl Into<String>) -> Self {
        Self {
            bytes,
            namespace: namespace.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// What the object store knows about an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    /// Opaque identifier used for later deletes.
    pub handle: String,
    /// Displayable URL. Carries a content version so that replacing an
    /// object under the same name yields a different URL.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: String,
}

/// Outcome of a best-effort namespace sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkDeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Remote store for image bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteAssetStore: Send + Sync {
    /// Store the bytes and describe the result.
    async fn upload(&self, request: UploadRequest) -> Result<StoredAsset, AssetStoreError>;

    /// Remove one object. Removing an object that is already gone succeeds.
    async fn delete(&self, handle: &str) -> Result<(), AssetStoreError>;

    /// Remove everything below `namespace`, counting individual failures
    /// instead of aborting. Only a failure to enumerate is an error.
    async fn delete_all_under_namespace(
        &self,
        namespace: &str,
    ) -> Result<BulkDeleteReport, AssetStoreError>;

    /// Namespace owning all objects of `product_id`.
    fn namespace_for(&self, product_id: &ProductId) -> String;

    /// URL of `handle` with resize/quality/format parameters applied on the fly.
    fn transformed_url(&self, handle: &str, transform: &ImageTransform) -> String;
}

/// Header-level facts about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl ImageProbe {
    /// Short lowercase format name, e.g. `jpg`, `png`, `webp`.
    pub fn format_name(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }
}

/// Read format and dimensions from the image header without decoding pixels.
pub fn probe_image(bytes: &[u8]) -> Result<ImageProbe, AssetStoreError> {
    if bytes.is_empty() {
        return Err(AssetStoreError::UploadFailed("image is empty".to_string()));
    }

    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AssetStoreError::UploadFailed(format!("cannot read image: {}", e)))?;

    let format = reader
        .format()
        .ok_or_else(|| AssetStoreError::UploadFailed("unrecognized image format".to_string()))?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| AssetStoreError::UploadFailed(format!("cannot read image header: {}", e)))?;

    Ok(ImageProbe {
        width,
        height,
        format,
    })
}

/// Namespace for a product below `prefix`.
pub fn product_namespace(prefix: &str, product_id: &ProductId) -> String {
    format!("{}/{}", prefix, product_id)
}

/// Object key for a new upload: `{namespace}/{name}.{ext}`.
pub fn object_key(namespace: &str, name: Option<&str>, probe: &ImageProbe) -> String {
    let name = match name {
        Some(name) => sanitize_path_component(name),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    format!("{}/{}.{}", namespace, name, probe.format_name())
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Get content type for image format
pub(crate) fn get_content_type(format: &str) -> String {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        "gif" => "image/gif".to_string(),
        "avif" => "image/avif".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

/// Encode a solid PNG of the given size.
#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_png() {
        let probe = probe_image(&sample_png(12, 7)).unwrap();
        assert_eq!((probe.width, probe.height), (12, 7));
        assert_eq!(probe.format_name(), "png");
    }

    #[test]
    fn test_probe_rejects_garbage() {
        assert!(matches!(
            probe_image(b"definitely not an image"),
            Err(AssetStoreError::UploadFailed(_))
        ));
        assert!(matches!(probe_image(&[]), Err(AssetStoreError::UploadFailed(_))));
    }

    #[test]
    fn test_object_key_layout() {
        let product = ProductId::parse("sku-42").unwrap();
        let ns = product_namespace("products", &product);
        assert_eq!(ns, "products/sku-42");

        let probe = probe_image(&sample_png(1, 1)).unwrap();
        assert_eq!(object_key(&ns, Some("front view"), &probe), "products/sku-42/front_view.png");

        let generated = object_key(&ns, None, &probe);
        assert!(generated.starts_with("products/sku-42/"));
        assert!(generated.ends_with(".png"));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("front-1"), "front-1");
        assert_eq!(sanitize_path_component("a/../b"), "a____b");
    }

    #[test]
    fn test_get_content_type() {
        assert_eq!(get_content_type("jpg"), "image/jpeg");
        assert_eq!(get_content_type("PNG"), "image/png");
        assert_eq!(get_content_type("unknown"), "application/octet-stream");
    }
}
