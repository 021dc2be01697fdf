use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

/// Durable binary object storage for uploaded images.
///
/// `put` overwrites on key collision, so repeating a write is safe.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Object key for a job's image. Unique per job id.
pub fn image_key(job_id: Uuid, extension: &str) -> String {
    format!("images/{}.{}", job_id, extension)
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::Status(other)),
    }
}

#[async_trait]
impl ImageStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (_, status) = self.bucket.head_object(key).await.map_err(StorageError::S3)?;
        match check_status(key, status) {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await.map_err(StorageError::S3)?;
        match check_status(key, response.status_code()) {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Image object not found: {0}")]
    NotFound(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned unexpected status {0}")]
    Status(u16),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_key_is_scoped_by_job() {
        let id = Uuid::new_v4();
        assert_eq!(image_key(id, "jpg"), format!("images/{id}.jpg"));
        assert_ne!(image_key(id, "jpg"), image_key(Uuid::new_v4(), "jpg"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status("k", 200).is_ok());
        assert!(matches!(check_status("k", 404), Err(StorageError::NotFound(_))));
        assert!(matches!(check_status("k", 503), Err(StorageError::Status(503))));
    }
}
