use async_trait::async_trait;
use reqwest::Method;

use crate::backend::{Backend, check_status};
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// `max-age` in seconds for the stored object.
    pub cache_control: String,
    /// Overwrite an existing object at the same key.
    pub upsert: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            cache_control: "3600".to_string(),
            upsert: false,
        }
    }
}

/// Bucket/key object uploads.
/// Real implementation: `Backend`. Test double: `MemoryBackend`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<(), BackendError>;
}

#[async_trait]
impl ObjectStore for Backend {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<(), BackendError> {
        let url = self.config().endpoint(&format!(
            "storage/v1/object/{}/{}",
            bucket,
            key.trim_start_matches('/')
        ))?;
        let content_type = mime_guess::from_path(key).first_or_octet_stream();
        let size = body.len();

        let resp = self
            .request(Method::POST, url)
            .header("cache-control", format!("max-age={}", options.cache_control))
            .header("x-upsert", options.upsert.to_string())
            .header("content-type", content_type.as_ref())
            .body(body)
            .send()
            .await?;
        check_status(resp).await?;
        tracing::info!(bucket, key, bytes = size, "object uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_never_overwrite() {
        let options = UploadOptions::default();
        assert_eq!(options.cache_control, "3600");
        assert!(!options.upsert);
    }
}
