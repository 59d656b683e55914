//! Result of a successful build or import.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::driver::{Driver, DriverError, Storage};

/// Which pipeline produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Build,
    Import,
}

impl ArtifactKind {
    pub fn builder_id(&self) -> &'static str {
        match self {
            ArtifactKind::Build => "imagesmith.build",
            ArtifactKind::Import => "imagesmith.import",
        }
    }
}

/// Templates created by one run, plus metadata for downstream consumers.
pub struct Artifact {
    kind: ArtifactKind,
    templates: Vec<Storage>,
    metadata: BTreeMap<String, Value>,
    driver: Arc<dyn Driver>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, templates: Vec<Storage>, driver: Arc<dyn Driver>) -> Self {
        let by_zone: Map<String, Value> = templates
            .iter()
            .map(|t| (t.zone.clone(), Value::String(t.uuid.clone())))
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("templates_by_zone".to_string(), Value::Object(by_zone));
        Self {
            kind,
            templates,
            metadata,
            driver,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn builder_id(&self) -> &'static str {
        self.kind.builder_id()
    }

    /// Template UUIDs joined with commas.
    pub fn id(&self) -> String {
        self.templates
            .iter()
            .map(|t| t.uuid.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn templates(&self) -> &[Storage] {
        &self.templates
    }

    pub fn insert_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Metadata value by key.
    pub fn state(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Delete every template of this artifact. Keeps going after a failure
    /// and returns the first error.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<(), DriverError> {
        let mut first_error = None;
        for template in &self.templates {
            info!("Deleting template '{}' ({})", template.title, template.uuid);
            if let Err(e) = self.driver.delete_template(&template.uuid, cancel).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ArtifactKind::Build => write!(f, "Storage template created, UUID: {}", self.id()),
            ArtifactKind::Import => {
                let title = self
                    .templates
                    .first()
                    .map(|t| t.title.as_str())
                    .unwrap_or_default();
                let zones: Vec<&str> = self.templates.iter().map(|t| t.zone.as_str()).collect();
                write!(f, "{} [{}]", title, zones.join(", "))
            }
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("kind", &self.kind)
            .field("templates", &self.templates)
            .field("metadata", &self.metadata)
            .field("driver", &self.driver.name())
            .finish()
    }
}
