use std::path::{Path, PathBuf};

use story_core::GameCode;
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported image type {0:?}; expected png, jpg, jpeg or gif")]
    UnsupportedType(String),
    #[error("image is empty")]
    Empty,
    #[error("image is {size} bytes; the limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid image reference {0:?}")]
    BadReference(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Illustrations on local disk, one file per upload.
#[derive(Clone, Debug)]
pub struct ImageStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Checks type and size; returns the extension the file will be stored
    /// under.
    pub fn validate(
        &self,
        filename: Option<&str>,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<&'static str, UploadError> {
        let ext = image_extension(filename, content_type)?;
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        Ok(ext)
    }

    pub async fn save(
        &self,
        code: &GameCode,
        ext: &str,
        bytes: &[u8],
    ) -> Result<String, UploadError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let reference = format!("{code}-{}.{ext}", Uuid::new_v4().simple());
        tokio::fs::write(self.dir.join(&reference), bytes).await?;
        Ok(reference)
    }

    pub async fn load(&self, reference: &str) -> Result<(Vec<u8>, &'static str), UploadError> {
        let path = self.resolve(reference)?;
        let ext = reference.rsplit('.').next().unwrap_or_default();
        let bytes = tokio::fs::read(path).await?;
        Ok((bytes, content_type_for(ext)))
    }

    pub async fn remove(&self, reference: &str) -> Result<(), UploadError> {
        let path = self.resolve(reference)?;
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, UploadError> {
        if reference.is_empty()
            || reference.contains(['/', '\\'])
            || reference.starts_with('.')
        {
            return Err(UploadError::BadReference(reference.to_string()));
        }
        Ok(self.dir.join(reference))
    }
}

/// Picks the extension from the file name, falling back to the subtype of
/// the declared content type.
pub fn image_extension(
    filename: Option<&str>,
    content_type: Option<&str>,
) -> Result<&'static str, UploadError> {
    let from_name = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext);
    let from_type = content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|ct| ct.trim().strip_prefix("image/"));
    let candidate = from_name.or(from_type).unwrap_or_default();
    let lowered = candidate.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .iter()
        .find(|allowed| **allowed == lowered)
        .copied()
        .ok_or_else(|| UploadError::UnsupportedType(candidate.to_string()))
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
