use super::transform::{transform_url, ImageTransform};
use super::{
    get_content_type, object_key, probe_image, product_namespace, BulkDeleteReport,
    RemoteAssetStore, StoredAsset, UploadRequest,
};
use crate::config::AssetStoreConfig;
use crate::error::AssetStoreError;
use crate::ids::ProductId;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

/// Product images stored in an S3 bucket, served from `public_base_url`.
pub struct S3AssetStore {
    client: S3Client,
    bucket: String,
    config: AssetStoreConfig,
}

impl S3AssetStore {
    /// Create a store for the configured bucket.
    pub async fn new(config: &AssetStoreConfig) -> Result<Self, AssetStoreError> {
        if config.bucket.trim().is_empty() {
            return Err(AssetStoreError::NotConfigured("assets.bucket is empty".to_string()));
        }
        if config.public_base_url.trim().is_empty() {
            return Err(AssetStoreError::NotConfigured(
                "assets.public_base_url is empty".to_string(),
            ));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        if aws_config.credentials_provider().is_none() {
            return Err(AssetStoreError::NotConfigured(
                "no AWS credentials provider available".to_string(),
            ));
        }

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            namespace_prefix = %config.namespace_prefix,
            "S3 asset store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Single PUT for small images. Returns the object's ETag.
    async fn simple_upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        dimensions: (u32, u32),
    ) -> Result<Option<String>, AssetStoreError> {
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .metadata("width", dimensions.0.to_string())
            .metadata("height", dimensions.1.to_string())
            .send()
            .await
            .map_err(|e| upload_failed("put_object", &e))?;

        Ok(output.e_tag().map(String::from))
    }

    /// Multipart upload for large images. Aborted if any part fails.
    async fn multipart_upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        dimensions: (u32, u32),
    ) -> Result<Option<String>, AssetStoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .metadata("width", dimensions.0.to_string())
            .metadata("height", dimensions.1.to_string())
            .send()
            .await
            .map_err(|e| upload_failed("create_multipart_upload", &e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| AssetStoreError::UploadFailed("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, bytes).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                let output = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| upload_failed("complete_multipart_upload", &e))?;

                Ok(output.e_tag().map(String::from))
            }
            Err(err) => {
                if let Err(e) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<CompletedPart>, AssetStoreError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| upload_failed("upload_part", &e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(output.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }

    /// Every key below `namespace/`, following continuation tokens.
    async fn list_namespace(&self, namespace: &str) -> Result<Vec<String>, AssetStoreError> {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| AssetStoreError::DeleteFailed {
                handle: prefix.clone(),
                reason: format!("list_objects_v2: {}", DisplayErrorContext(&e)),
            })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl RemoteAssetStore for S3AssetStore {
    #[instrument(skip(self, request), fields(namespace = %request.namespace, size_bytes = request.bytes.len()))]
    async fn upload(&self, request: UploadRequest) -> Result<StoredAsset, AssetStoreError> {
        let probe = probe_image(&request.bytes)?;
        let key = object_key(&request.namespace, request.name.as_deref(), &probe);
        let content_type = get_content_type(probe.format_name());
        let dimensions = (probe.width, probe.height);

        debug!(key = %key, content_type = %content_type, "Uploading image to S3");

        let etag = if request.bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(&key, &request.bytes, &content_type, dimensions)
                .await?
        } else {
            self.simple_upload(&key, &request.bytes, &content_type, dimensions)
                .await?
        };

        let version = version_token(etag.as_deref());
        info!(key = %key, width = probe.width, height = probe.height, "Image uploaded");

        Ok(StoredAsset {
            url: public_url(&self.config.public_base_url, &key, &version),
            handle: key,
            width: probe.width,
            height: probe.height,
            byte_size: request.bytes.len() as u64,
            format: probe.format_name().to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, handle: &str) -> Result<(), AssetStoreError> {
        // S3 answers 204 for keys that do not exist, so this is idempotent.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(handle)
            .send()
            .await
            .map_err(|e| AssetStoreError::DeleteFailed {
                handle: handle.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(key = %handle, "Image deleted from S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_all_under_namespace(
        &self,
        namespace: &str,
    ) -> Result<BulkDeleteReport, AssetStoreError> {
        let keys = self.list_namespace(namespace).await?;

        let results: Vec<Result<(), AssetStoreError>> = stream::iter(keys)
            .map(|key| async move { self.delete(&key).await })
            .buffer_unordered(self.config.delete_concurrency.max(1))
            .collect()
            .await;

        let mut report = BulkDeleteReport::default();
        for result in results {
            match result {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to delete object during namespace sweep");
                    report.failed += 1;
                }
            }
        }

        info!(
            namespace = %namespace,
            deleted = report.deleted,
            failed = report.failed,
            "Namespace sweep finished"
        );
        Ok(report)
    }

    fn namespace_for(&self, product_id: &ProductId) -> String {
        product_namespace(&self.config.namespace_prefix, product_id)
    }

    fn transformed_url(&self, handle: &str, transform: &ImageTransform) -> String {
        let base = self
            .config
            .transform_base_url
            .as_deref()
            .unwrap_or(&self.config.public_base_url);
        transform_url(base, handle, transform)
    }
}

fn upload_failed<E>(operation: &str, err: &E) -> AssetStoreError
where
    E: std::error::Error,
{
    AssetStoreError::UploadFailed(format!("{}: {}", operation, DisplayErrorContext(err)))
}

/// Short cache-busting token derived from the ETag.
fn version_token(etag: Option<&str>) -> String {
    match etag.map(|t| t.trim_matches('"')).filter(|t| !t.is_empty()) {
        Some(tag) => tag.chars().take(12).collect(),
        None => chrono::Utc::now().timestamp_millis().to_string(),
    }
}

fn public_url(base: &str, key: &str, version: &str) -> String {
    format!("{}/{}?v={}", base.trim_end_matches('/'), key, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_token_from_etag() {
        assert_eq!(
            version_token(Some("\"9b2cf535f27731c974343645a3985328\"")),
            "9b2cf535f277"
        );
        assert_eq!(version_token(Some("abc")), "abc");
    }

    #[test]
    fn test_version_token_without_etag() {
        let token = version_token(None);
        assert!(!token.is_empty());
        assert!(token.chars().all(|c| c.is_ascii_digit()));
        assert!(!version_token(Some("\"\"")).is_empty());
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://cdn.example.com/", "products/p1/a.png", "abc"),
            "https://cdn.example.com/products/p1/a.png?v=abc"
        );
    }

    #[tokio::test]
    async fn test_missing_bucket_is_not_configured() {
        let config = AssetStoreConfig {
            public_base_url: "https://cdn.example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            S3AssetStore::new(&config).await,
            Err(AssetStoreError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_public_base_is_not_configured() {
        let config = AssetStoreConfig {
            bucket: "catalog-images".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            S3AssetStore::new(&config).await,
            Err(AssetStoreError::NotConfigured(_))
        ));
    }
}
