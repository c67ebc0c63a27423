mod kubectl;
mod recording;

use std::collections::BTreeMap;

use caisson_domain::{AutoscalerSpec, DatabaseSpec, ImageRef, ImageSpec, ResourceName};
use futures::future::BoxFuture;
use serde_json::json;

use crate::error::EngineError;
use crate::template::MaterializedManifest;

pub use kubectl::KubectlEngine;
pub use recording::{RecordingEngine, TraceEvent, TracePhase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEndpoint {
    pub address: String,
    pub port: u16,
}

/// Work handed to an engine once every upstream it reads is realized.
#[derive(Debug)]
pub enum Submission {
    Secret {
        name: ResourceName,
        namespace: String,
        data: BTreeMap<String, String>,
    },
    Manifest {
        name: ResourceName,
        namespace: String,
        manifest: MaterializedManifest,
    },
    Autoscaler {
        name: ResourceName,
        namespace: String,
        spec: AutoscalerSpec,
    },
}

impl Submission {
    #[must_use]
    pub const fn name(&self) -> &ResourceName {
        match self {
            Self::Secret { name, .. } | Self::Manifest { name, .. } | Self::Autoscaler { name, .. } => {
                name
            }
        }
    }
}

/// Output fields of a realized submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Realized {
    pub outputs: BTreeMap<String, String>,
}

impl Realized {
    #[must_use]
    pub fn named(name: &ResourceName) -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert("name".to_string(), name.to_string());
        Self { outputs }
    }

    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(field.to_string(), value.into());
        self
    }
}

/// Realizes declared resources.
///
/// Callers only submit once every upstream of the submitted resource has been
/// realized; an engine never needs to order work itself.
pub trait ProvisioningEngine: Send + Sync {
    fn build_image<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a ImageSpec,
    ) -> BoxFuture<'a, Result<ImageRef, EngineError>>;

    fn provision_database<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a DatabaseSpec,
    ) -> BoxFuture<'a, Result<DatabaseEndpoint, EngineError>>;

    fn submit(&self, submission: Submission) -> BoxFuture<'_, Result<Realized, EngineError>>;
}

/// Number of non-empty documents in a multi-document YAML stream.
pub(crate) fn count_documents(text: &str) -> usize {
    text.split('\n')
        .collect::<Vec<_>>()
        .split(|line| line.trim_end() == "---")
        .filter(|document| {
            document.iter().any(|line| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !trimmed.starts_with('#')
            })
        })
        .count()
}

pub(crate) fn secret_object(
    name: &ResourceName,
    namespace: &str,
    data: &BTreeMap<String, String>,
) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": { "name": name.as_str(), "namespace": namespace },
        "stringData": data,
    })
}

pub(crate) fn autoscaler_object(
    name: &ResourceName,
    namespace: &str,
    spec: &AutoscalerSpec,
) -> serde_json::Value {
    json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": { "name": name.as_str(), "namespace": namespace },
        "spec": {
            "scaleTargetRef": {
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": spec.target,
            },
            "minReplicas": spec.min_replicas,
            "maxReplicas": spec.max_replicas,
            "metrics": [{
                "type": "Resource",
                "resource": {
                    "name": "cpu",
                    "target": { "type": "Utilization", "averageUtilization": spec.cpu_utilization },
                },
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;

    use caisson_domain::{AutoscalerSpec, ResourceName};

    use super::{autoscaler_object, count_documents, secret_object};

    #[test]
    fn counts_yaml_documents() {
        let text = "apiVersion: apps/v1\nkind: Deployment\n---\n# comment only\n---\napiVersion: v1\nkind: Service\n";
        assert_eq!(count_documents(text), 2);
        assert_eq!(count_documents(""), 0);
    }

    #[test]
    fn secret_object_carries_string_data() {
        let mut data = BTreeMap::new();
        data.insert("DB_NAME".to_string(), "appdb".to_string());
        let name = ResourceName::try_from("db-connection").expect("name");

        let object = secret_object(&name, "default", &data);
        assert_eq!(object["metadata"]["name"], "db-connection");
        assert_eq!(object["stringData"]["DB_NAME"], "appdb");
    }

    #[test]
    fn autoscaler_object_targets_deployment() {
        let name = ResourceName::try_from("backend-hpa").expect("name");
        let spec = AutoscalerSpec {
            target: "backend".to_string(),
            min_replicas: 1,
            max_replicas: 5,
            cpu_utilization: 50,
        };

        let object = autoscaler_object(&name, "default", &spec);
        assert_eq!(object["spec"]["scaleTargetRef"]["name"], "backend");
        assert_eq!(object["spec"]["maxReplicas"], 5);
        assert_eq!(
            object["spec"]["metrics"][0]["resource"]["target"]["averageUtilization"],
            50
        );
    }
}
