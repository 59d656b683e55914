//! Import pipeline lifecycle tests against the in-memory platform.
//!
//! Covered:
//! - single and multi-zone imports of raw and gzip images
//! - integrity failure after upload
//! - partial clone and template fan-out failures with full compensation
//! - preflight checks and template replacement
//! - multi-member gzip images and corrupted uploads
//! - resources created by a call whose wait then failed

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use imagesmith_core::{
    config::ImportConfig,
    driver::StorageType,
    import::{ImageError, Importer},
    testing::{fixtures, InjectedError, MockDriver, Operation},
    ArtifactKind, ConfigError, PipelineError, PipelineFailure,
};

struct Harness {
    driver: Arc<MockDriver>,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            driver: Arc::new(MockDriver::new()),
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn raw_image(&self) -> PathBuf {
        fixtures::raw_image(self.dir.path(), "disk.raw", 64 * 1024).expect("write image")
    }

    fn gzip_image(&self) -> PathBuf {
        fixtures::gzip_image(self.dir.path(), "disk.raw.gz", 256 * 1024).expect("write image")
    }

    async fn import(
        &self,
        config: ImportConfig,
        image: &Path,
    ) -> Result<imagesmith_core::Artifact, PipelineFailure> {
        Importer::new(config, self.driver.clone())
            .run(image, CancellationToken::new())
            .await
    }

    async fn disks(&self) -> usize {
        self.driver
            .storages()
            .await
            .iter()
            .filter(|s| s.kind == StorageType::Disk)
            .count()
    }
}

#[tokio::test]
async fn test_single_zone_raw_import() {
    let h = Harness::new();
    let image = h.raw_image();

    let artifact = h
        .import(fixtures::import_config(&["fi-hel1"], "golden"), &image)
        .await
        .expect("import should succeed");

    assert_eq!(artifact.kind(), ArtifactKind::Import);
    assert_eq!(artifact.builder_id(), "imagesmith.import");
    assert_eq!(artifact.to_string(), "golden [fi-hel1]");
    assert_eq!(artifact.state("size"), Some(&serde_json::json!(10)));
    assert_eq!(artifact.state("source_image"), Some(&serde_json::json!("disk.raw")));

    let templates = h.driver.templates().await;
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].title, "golden");
    assert_eq!(artifact.id(), templates[0].uuid);
    // the upload disk is removed once the template exists
    assert_eq!(h.disks().await, 0);
}

#[tokio::test]
async fn test_multi_zone_gzip_import() {
    let h = Harness::new();
    h.driver.set_clone_jitter(Duration::from_millis(30)).await;
    let image = h.gzip_image();

    let artifact = h
        .import(
            fixtures::import_config(&["fi-hel1", "de-fra1", "nl-ams1"], "golden"),
            &image,
        )
        .await
        .expect("import should succeed");

    let mut zones: Vec<String> = artifact.templates().iter().map(|t| t.zone.clone()).collect();
    zones.sort();
    assert_eq!(zones, vec!["de-fra1", "fi-hel1", "nl-ams1"]);
    assert_eq!(artifact.id().split(',').count(), 3);

    let by_zone = artifact.state("templates_by_zone").unwrap();
    assert!(by_zone.get("de-fra1").is_some());

    // every clone started from the uploaded disk in the first zone
    let clones = h.driver.calls_for(Operation::CloneStorage).await;
    assert_eq!(clones.len(), 2);
    assert_eq!(clones[0].target, clones[1].target);

    assert_eq!(h.disks().await, 0);
    assert_eq!(h.driver.templates().await.len(), 3);
}

#[tokio::test]
async fn test_checksum_mismatch_deletes_uploaded_storage() {
    let h = Harness::new();
    h.driver.set_checksum_override("deadbeef").await;
    let image = h.raw_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1", "de-fra1"], "golden"), &image)
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::ChecksumMismatch { actual, .. } => assert_eq!(actual, "deadbeef"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(failure.cleanup_errors.is_empty());
    assert!(h.driver.storages().await.is_empty());
    // the verification failure happens before any clone is attempted
    assert!(h.driver.calls_for(Operation::CloneStorage).await.is_empty());
}

#[tokio::test]
async fn test_partial_clone_failure_cleans_up_successful_clones() {
    let h = Harness::new();
    h.driver
        .fail_on(
            Operation::CloneStorage,
            Some("de-fra1"),
            InjectedError::rejected("STORAGE_RESOURCES_UNAVAILABLE"),
        )
        .await;
    let image = h.raw_image();

    let failure = h
        .import(
            fixtures::import_config(&["fi-hel1", "de-fra1", "nl-ams1"], "golden"),
            &image,
        )
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::PartialFailure {
            operation,
            total,
            failures,
        } => {
            assert_eq!(*operation, "clone");
            assert_eq!(*total, 2);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].contains("de-fra1"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    // the nl-ams1 clone succeeded and was removed together with the upload
    let deleted = h.driver.calls_for(Operation::DeleteStorage).await;
    assert_eq!(deleted.len(), 2);
    assert!(h.driver.storages().await.is_empty());
    assert!(h.driver.calls_for(Operation::CreateTemplate).await.is_empty());
}

#[tokio::test]
async fn test_partial_template_failure_removes_created_templates() {
    let h = Harness::new();
    h.driver
        .fail_on(
            Operation::CreateTemplate,
            Some("de-fra1"),
            InjectedError::Timeout,
        )
        .await;
    let image = h.raw_image();

    let failure = h
        .import(
            fixtures::import_config(&["fi-hel1", "de-fra1", "nl-ams1"], "golden"),
            &image,
        )
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::PartialFailure {
            operation, total, ..
        } => {
            assert_eq!(*operation, "template creation");
            assert_eq!(*total, 3);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.driver.templates().await.is_empty());
    assert_eq!(h.disks().await, 0);
}

#[tokio::test]
async fn test_existing_template_rejected_without_replace() {
    let h = Harness::new();
    h.driver.add_template("golden", "de-fra1").await;
    let image = h.raw_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1", "de-fra1"], "golden"), &image)
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::Config(ConfigError::Invalid(problems)) => {
            assert_eq!(problems.len(), 1);
            assert!(problems[0].contains("de-fra1"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.driver.calls_for(Operation::CreateStorage).await.is_empty());
}

#[tokio::test]
async fn test_unavailable_zones_reported_together() {
    let h = Harness::new();
    let image = h.raw_image();

    let failure = h
        .import(
            fixtures::import_config(&["fi-hel1", "xx-nowhere1", "yy-nowhere2"], "golden"),
            &image,
        )
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::Config(err) => assert_eq!(err.problems().len(), 2),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.driver.storages().await.is_empty());
}

#[tokio::test]
async fn test_replace_existing_swaps_template() {
    let h = Harness::new();
    let old = h.driver.add_template("golden", "fi-hel1").await;
    let image = h.raw_image();

    let config = ImportConfig {
        replace_existing: true,
        ..fixtures::import_config(&["fi-hel1"], "golden")
    };
    let artifact = h.import(config, &image).await.expect("import should succeed");

    let templates = h.driver.templates().await;
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].title, "golden");
    assert_ne!(templates[0].uuid, old.uuid);
    assert_eq!(artifact.templates()[0].title, "golden");

    let created = h.driver.calls_for(Operation::CreateTemplate).await;
    assert_eq!(created.len(), 1);
    assert_eq!(h.driver.calls_for(Operation::RenameStorage).await.len(), 1);
}

#[tokio::test]
async fn test_failed_rename_keeps_temporary_template() {
    let h = Harness::new();
    let old = h.driver.add_template("golden", "fi-hel1").await;
    h.driver
        .fail_on(Operation::RenameStorage, None, InjectedError::rejected("STORAGE_STATE_ILLEGAL"))
        .await;
    let image = h.raw_image();

    let config = ImportConfig {
        replace_existing: true,
        ..fixtures::import_config(&["fi-hel1"], "golden")
    };
    let failure = h.import(config, &image).await.unwrap_err();
    assert!(matches!(failure.error, PipelineError::PartialFailure { .. }));

    let templates = h.driver.templates().await;
    assert_eq!(templates.len(), 1);
    assert_ne!(templates[0].uuid, old.uuid);
    assert!(templates[0].title.starts_with("golden-"));
    assert!(templates[0].title.ends_with("-tmp"));
    assert_eq!(h.disks().await, 0);
}

#[tokio::test]
async fn test_unsupported_image_fails_before_any_call() {
    let h = Harness::new();
    let image = h.dir.path().join("disk.qcow2");
    std::fs::write(&image, b"qcow").unwrap();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1"], "golden"), &image)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        PipelineError::Image(ImageError::UnsupportedFormat(_))
    ));
    assert!(h.driver.calls().await.is_empty());
}

#[tokio::test]
async fn test_cleanup_errors_do_not_replace_terminal_error() {
    let h = Harness::new();
    h.driver.set_checksum_override("deadbeef").await;
    h.driver
        .fail_on(Operation::DeleteStorage, None, InjectedError::rejected("SERVICE_UNAVAILABLE"))
        .await;
    let image = h.raw_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1"], "golden"), &image)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::ChecksumMismatch { .. }));
    assert_eq!(failure.cleanup_errors.len(), 1);
    // cleanup makes a single attempt
    assert_eq!(h.driver.calls_for(Operation::DeleteStorage).await.len(), 1);
    assert_eq!(h.disks().await, 1);
}

#[tokio::test]
async fn test_cancelled_import_compensates() {
    let h = Harness::new();
    h.driver.set_latency(Duration::from_millis(40)).await;
    let image = h.raw_image();
    let cancel = CancellationToken::new();

    let importer = Importer::new(
        fixtures::import_config(&["fi-hel1", "de-fra1"], "golden"),
        h.driver.clone(),
    );
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let failure = importer.run(&image, cancel).await.unwrap_err();
    assert!(failure.error.is_cancelled());
    assert!(h.driver.storages().await.is_empty());
}

#[tokio::test]
async fn test_multi_member_gzip_import() {
    let h = Harness::new();
    let image = fixtures::multi_member_gzip_image(h.dir.path(), "disk.raw.gz", 96 * 1024, 3)
        .expect("write image");

    let artifact = h
        .import(fixtures::import_config(&["fi-hel1", "de-fra1"], "golden"), &image)
        .await
        .expect("import should succeed");

    assert_eq!(artifact.templates().len(), 2);
    assert_eq!(h.disks().await, 0);
}

#[tokio::test]
async fn test_corrupted_upload_fails_verification() {
    let h = Harness::new();
    h.driver.corrupt_uploads().await;
    let image = h.gzip_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1"], "golden"), &image)
        .await
        .unwrap_err();

    match &failure.error {
        PipelineError::ChecksumMismatch { expected, actual } => assert_ne!(expected, actual),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(failure.cleanup_errors.is_empty());
    assert!(h.driver.storages().await.is_empty());
}

#[tokio::test]
async fn test_storage_that_never_comes_online_is_deleted() {
    let h = Harness::new();
    h.driver
        .fail_after_create(Operation::CreateStorage, None, InjectedError::Timeout)
        .await;
    let image = h.raw_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1"], "golden"), &image)
        .await
        .unwrap_err();

    assert!(failure.error.is_timeout());
    assert_eq!(h.driver.calls_for(Operation::DeleteStorage).await.len(), 1);
    assert!(h.driver.storages().await.is_empty());
    assert!(h.driver.calls_for(Operation::ImportStorage).await.is_empty());
}

#[tokio::test]
async fn test_cancelled_clone_wait_still_deletes_clone() {
    let h = Harness::new();
    h.driver
        .fail_after_create(Operation::CloneStorage, Some("de-fra1"), InjectedError::Cancelled)
        .await;
    let image = h.raw_image();

    let failure = h
        .import(
            fixtures::import_config(&["fi-hel1", "de-fra1", "nl-ams1"], "golden"),
            &image,
        )
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::PartialFailure { .. }));
    // upload disk plus both clones
    assert_eq!(h.driver.calls_for(Operation::DeleteStorage).await.len(), 3);
    assert!(h.driver.storages().await.is_empty());
}

#[tokio::test]
async fn test_unfinished_template_is_deleted() {
    let h = Harness::new();
    h.driver
        .fail_after_create(Operation::CreateTemplate, Some("de-fra1"), InjectedError::Timeout)
        .await;
    let image = h.raw_image();

    let failure = h
        .import(fixtures::import_config(&["fi-hel1", "de-fra1"], "golden"), &image)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::PartialFailure { .. }));
    assert!(failure.retained_templates.is_empty());
    assert_eq!(h.driver.calls_for(Operation::DeleteTemplate).await.len(), 2);
    assert!(h.driver.templates().await.is_empty());
    assert_eq!(h.disks().await, 0);
}
