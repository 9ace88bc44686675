use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use super::StorageMetrics;
use crate::error::{Error, Result};

/// Filesystem-backed archive storage. The directory is created with owner-only
/// permissions on first use.
pub struct LocalArchive {
    dir: PathBuf,
    init: Once,
}

impl LocalArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalArchive {
            dir: dir.into(),
            init: Once::new(),
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        let mut created: Result<()> = Ok(());
        self.init.call_once(|| {
            created = (|| {
                fs::create_dir_all(&self.dir)
                    .map_err(|e| Error::Storage(format!("create archive dir: {e}")))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                        .map_err(|e| Error::Storage(format!("chmod archive dir: {e}")))?;
                }
                Ok(())
            })();
        });
        created
    }

    /// Reject names with path separators so a crafted name cannot escape
    /// the archive directory.
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(Error::validation(format!("invalid archive name {name:?}")));
        }
        Ok(self.dir.join(name))
    }

    pub fn save_archive(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        let path = self.path_for(name)?;
        fs::write(&path, bytes).map_err(|e| Error::Storage(format!("write archive: {e}")))
    }

    pub fn list_archives(&self) -> Result<Vec<String>> {
        if !Path::new(&self.dir).exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries =
            fs::read_dir(&self.dir).map_err(|e| Error::Storage(format!("list archives: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn get_archive(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound("archive")),
            Err(e) => Err(Error::Storage(format!("read archive: {e}"))),
        }
    }

    pub fn delete_archive(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound("archive")),
            Err(e) => Err(Error::Storage(format!("delete archive: {e}"))),
        }
    }

    pub fn get_storage_metrics(&self) -> Result<StorageMetrics> {
        let names = self.list_archives()?;
        let mut total_bytes = 0u64;
        for name in &names {
            if let Ok(meta) = fs::metadata(self.dir.join(name)) {
                total_bytes += meta.len();
            }
        }
        Ok(StorageMetrics {
            count: names.len() as u64,
            total_bytes,
            oldest: names.first().cloned(),
            newest: names.last().cloned(),
        })
    }
}
