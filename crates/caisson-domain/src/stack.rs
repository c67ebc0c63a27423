use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{PlaceholderToken, ResourceName};

/// Deployment-wide settings, built once from the stack file and passed to
/// every component of a deployment pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContext {
    pub stack: String,
    pub cluster: String,
    pub region: String,
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: ResourceName,
    pub field: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.resource, self.field)
    }
}

/// A string value that is either written in the stack file or taken from an
/// output field of another resource once that resource is realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ValueSource {
    Literal { value: String },
    Ref(OutputRef),
}

impl ValueSource {
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    #[must_use]
    pub const fn output_ref(&self) -> Option<&OutputRef> {
        match self {
            Self::Literal { .. } => None,
            Self::Ref(output) => Some(output),
        }
    }
}

impl fmt::Display for ValueSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal { value } => value.fmt(formatter),
            Self::Ref(output) => write!(formatter, "${{{output}}}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// `<registry-host>/<repository>` without tag.
    pub repository: String,
    pub tag: String,
    pub context: Option<PathBuf>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub engine: String,
    pub db_name: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    /// Endpoint of an already provisioned instance.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub data: BTreeMap<String, ValueSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub template: PathBuf,
    pub substitutions: BTreeMap<PlaceholderToken, ValueSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Name of the `Deployment` workload to scale.
    pub target: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub cpu_utilization: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKind {
    Image(ImageSpec),
    Database(DatabaseSpec),
    Secret(SecretSpec),
    Manifest(ManifestSpec),
    Autoscaler(AutoscalerSpec),
}

impl ResourceKind {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Database(_) => "database",
            Self::Secret(_) => "secret",
            Self::Manifest(_) => "manifest",
            Self::Autoscaler(_) => "autoscaler",
        }
    }

    /// Output fields a realized resource of this kind exposes to `ref()`.
    #[must_use]
    pub const fn output_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Image(_) => &["image_name", "repository", "tag"],
            Self::Database(_) => &["address", "port", "username", "db_name"],
            Self::Secret(_) | Self::Autoscaler(_) => &["name"],
            Self::Manifest(_) => &["name", "objects"],
        }
    }

    /// Every output reference read by this resource's inputs.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        match self {
            Self::Secret(secret) => secret.data.values().filter_map(ValueSource::output_ref).collect(),
            Self::Manifest(manifest) => manifest
                .substitutions
                .values()
                .filter_map(ValueSource::output_ref)
                .collect(),
            Self::Image(_) | Self::Database(_) | Self::Autoscaler(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: ResourceName,
    pub depends_on: Vec<ResourceName>,
    pub kind: ResourceKind,
}

impl ResourceSpec {
    #[must_use]
    pub const fn new(name: ResourceName, kind: ResourceKind) -> Self {
        Self {
            name,
            depends_on: Vec::new(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    pub path: PathBuf,
    pub context: DeployContext,
    pub resources: Vec<ResourceSpec>,
    pub exports: BTreeMap<String, ValueSource>,
}

impl StackSpec {
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources
            .iter()
            .find(|resource| resource.name.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Listed in the consumer's `depends_on`.
    Declared,
    /// Implied by the consumer reading one of the upstream's output fields.
    Reference,
}

/// The consumer may only be submitted once the upstream is realized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub consumer: ResourceName,
    pub upstream: ResourceName,
    pub kind: EdgeKind,
}
