use super::StorageMetrics;
use crate::error::{Error, Result};

/// Recognized S3 backend variant. Selecting it is valid configuration, but
/// every operation reports NotImplemented until the bucket integration is
/// provisioned.
pub struct S3Archive {
    bucket: String,
}

impl S3Archive {
    pub fn new(bucket: String, region: Option<String>) -> Self {
        tracing::warn!(
            "s3 archive backend selected (bucket={bucket}, region={region:?}) but not yet provisioned"
        );
        S3Archive { bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn save_archive(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
        Err(Error::NotImplemented("s3 archive backend"))
    }

    pub fn list_archives(&self) -> Result<Vec<String>> {
        Err(Error::NotImplemented("s3 archive backend"))
    }

    pub fn get_archive(&self, _name: &str) -> Result<Vec<u8>> {
        Err(Error::NotImplemented("s3 archive backend"))
    }

    pub fn delete_archive(&self, _name: &str) -> Result<()> {
        Err(Error::NotImplemented("s3 archive backend"))
    }

    pub fn get_storage_metrics(&self) -> Result<StorageMetrics> {
        Err(Error::NotImplemented("s3 archive backend"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_operations_not_implemented() {
        let backend = S3Archive::new("logs-bucket".into(), Some("us-east-1".into()));
        assert_eq!(backend.bucket(), "logs-bucket");
        assert!(matches!(
            backend.save_archive("a.json", b"x"),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(backend.list_archives(), Err(Error::NotImplemented(_))));
        assert!(matches!(
            backend.get_archive("a.json"),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            backend.delete_archive("a.json"),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            backend.get_storage_metrics(),
            Err(Error::NotImplemented(_))
        ));
    }
}
