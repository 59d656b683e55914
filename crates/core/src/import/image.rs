//! Local image file inspection.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::driver::ContentType;

/// Smallest storage the platform creates.
pub const STORAGE_MIN_SIZE_GB: u32 = 10;
/// Largest storage the platform creates.
pub const STORAGE_MAX_SIZE_GB: u32 = 4096;

const GIB: u64 = 1024 * 1024 * 1024;

/// Errors raised while inspecting an image file.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported image format '{0}', expected .raw or .gz")]
    UnsupportedFormat(PathBuf),

    #[error("Image needs {size_gb} GB of storage, the maximum is {max_gb} GB")]
    TooLarge { size_gb: u64, max_gb: u32 },

    #[error("Failed to read image: {0}")]
    Io(#[from] io::Error),
}

/// An inspected image file, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub path: PathBuf,
    pub content_type: ContentType,
    /// Bytes on disk.
    pub file_size: u64,
    /// Bytes once decompressed (equal to `file_size` for raw images).
    pub content_size: u64,
}

impl ImageFile {
    /// Check the extension and measure the decompressed size.
    pub async fn inspect(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref().to_path_buf();
        let content_type = content_type_for(&path)?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        let content_size = match content_type {
            ContentType::OctetStream => metadata.len(),
            ContentType::Gzip => {
                let gz_path = path.clone();
                tokio::task::spawn_blocking(move || decompressed_size(&gz_path))
                    .await
                    .map_err(io::Error::other)??
            }
        };

        let image = Self {
            path,
            content_type,
            file_size: metadata.len(),
            content_size,
        };
        if image.size_gb() > u64::from(STORAGE_MAX_SIZE_GB) {
            return Err(ImageError::TooLarge {
                size_gb: image.size_gb(),
                max_gb: STORAGE_MAX_SIZE_GB,
            });
        }
        Ok(image)
    }

    /// Decompressed size in whole GB, rounded up.
    pub fn size_gb(&self) -> u64 {
        self.content_size.div_ceil(GIB)
    }

    /// Storage to create for this image: the override, or the image size
    /// raised to the platform minimum.
    pub fn required_storage_size(&self, size_override: Option<u32>) -> u32 {
        if let Some(size) = size_override {
            return size;
        }
        // size_gb is bounded by STORAGE_MAX_SIZE_GB after inspect
        let size = u32::try_from(self.size_gb()).unwrap_or(STORAGE_MAX_SIZE_GB);
        size.max(STORAGE_MIN_SIZE_GB)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn content_type_for(path: &Path) -> Result<ContentType, ImageError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("raw") => Ok(ContentType::OctetStream),
        Some(ext) if ext.eq_ignore_ascii_case("gz") => Ok(ContentType::Gzip),
        _ => Err(ImageError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn decompressed_size(path: &Path) -> io::Result<u64> {
    let mut decoder = MultiGzDecoder::new(File::open(path)?);
    io::copy(&mut decoder, &mut io::sink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn image(content_size: u64) -> ImageFile {
        ImageFile {
            path: PathBuf::from("disk.raw"),
            content_type: ContentType::OctetStream,
            file_size: content_size,
            content_size,
        }
    }

    #[test]
    fn test_size_gb_rounds_up() {
        assert_eq!(image(0).size_gb(), 0);
        assert_eq!(image(1).size_gb(), 1);
        assert_eq!(image(GIB).size_gb(), 1);
        assert_eq!(image(GIB + 1).size_gb(), 2);
    }

    #[test]
    fn test_required_storage_size() {
        assert_eq!(image(GIB).required_storage_size(None), 10);
        assert_eq!(image(12 * GIB).required_storage_size(None), 12);
        assert_eq!(image(12 * GIB).required_storage_size(Some(50)), 50);
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(
            content_type_for(Path::new("a/disk.raw")).unwrap(),
            ContentType::OctetStream
        );
        assert_eq!(
            content_type_for(Path::new("disk.raw.GZ")).unwrap(),
            ContentType::Gzip
        );
        assert!(matches!(
            content_type_for(Path::new("disk.qcow2")),
            Err(ImageError::UnsupportedFormat(_))
        ));
        assert!(content_type_for(Path::new("disk")).is_err());
    }

    #[tokio::test]
    async fn test_inspect_raw_sparse_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.raw");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(12 * GIB).unwrap();

        let image = ImageFile::inspect(&path).await.unwrap();
        assert_eq!(image.content_type, ContentType::OctetStream);
        assert_eq!(image.size_gb(), 12);
        assert_eq!(image.file_name(), "disk.raw");
    }

    #[tokio::test]
    async fn test_inspect_gzip_measures_decompressed_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.raw.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&vec![0u8; 3 * 1024 * 1024]).unwrap();
        encoder.finish().unwrap();

        let image = ImageFile::inspect(&path).await.unwrap();
        assert_eq!(image.content_type, ContentType::Gzip);
        assert_eq!(image.content_size, 3 * 1024 * 1024);
        assert!(image.file_size < image.content_size);
        assert_eq!(image.size_gb(), 1);
    }

    #[tokio::test]
    async fn test_inspect_too_large() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.raw");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len((u64::from(STORAGE_MAX_SIZE_GB) + 1) * GIB).unwrap();

        let err = ImageFile::inspect(&path).await.unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { size_gb: 4097, .. }));
    }

    #[tokio::test]
    async fn test_inspect_missing_file() {
        let err = ImageFile::inspect("/nonexistent/disk.raw").await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }
}
