//! Image import pipeline.
//!
//! Steps, in order:
//! - `CreateStorage`: empty disk in the first zone, sized for the image
//! - `UploadImage`: stream the file, verify the SHA-256 reported back
//! - `CloneStorage`: concurrent clones to the remaining zones
//! - `CreateTemplate`: concurrent templatize per zone, optionally
//!   replacing an existing template of the same name

mod cleanup;
mod clone;
mod create_storage;
mod digest;
mod image;
mod importer;
mod state;
mod template;
mod upload;

pub use clone::CloneStorage;
pub use create_storage::CreateStorage;
pub use digest::{digest_bytes, DigestHandle, DigestingReader};
pub use image::{ImageError, ImageFile, STORAGE_MAX_SIZE_GB, STORAGE_MIN_SIZE_GB};
pub use importer::Importer;
pub use state::ImportState;
pub use template::CreateTemplate;
pub use upload::UploadImage;
