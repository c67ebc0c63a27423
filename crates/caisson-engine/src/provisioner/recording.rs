use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use caisson_domain::{DatabaseSpec, DeployContext, ImageRef, ImageSpec, ResourceName};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use super::{
    DatabaseEndpoint, ProvisioningEngine, Realized, Submission, autoscaler_object,
    count_documents, secret_object,
};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Submitted,
    Realized,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub sequence: u64,
    pub resource: ResourceName,
    pub phase: TracePhase,
}

/// Engine that realizes everything in memory and records the order it was
/// asked to do so.
#[derive(Debug)]
pub struct RecordingEngine {
    region: String,
    failures: BTreeSet<ResourceName>,
    delays: BTreeMap<ResourceName, Duration>,
    trace: Mutex<Vec<TraceEvent>>,
    rendered: Mutex<BTreeMap<ResourceName, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingEngine {
    #[must_use]
    pub fn new(context: &DeployContext) -> Self {
        Self {
            region: context.region.clone(),
            failures: BTreeSet::new(),
            delays: BTreeMap::new(),
            trace: Mutex::new(Vec::new()),
            rendered: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reject the named resource when it is submitted.
    #[must_use]
    pub fn fail_on(mut self, name: ResourceName) -> Self {
        self.failures.insert(name);
        self
    }

    /// Hold the named resource between submission and realization.
    #[must_use]
    pub fn with_delay(mut self, name: ResourceName, delay: Duration) -> Self {
        self.delays.insert(name, delay);
        self
    }

    #[must_use]
    pub fn trace(&self) -> Vec<TraceEvent> {
        lock(&self.trace).clone()
    }

    /// Content a manifest or generated object was submitted with.
    #[must_use]
    pub fn rendered(&self, name: &str) -> Option<String> {
        lock(&self.rendered)
            .iter()
            .find(|(key, _)| key.as_str() == name)
            .map(|(_, value)| value.clone())
    }

    fn record(&self, resource: &ResourceName, phase: TracePhase) {
        let mut trace = lock(&self.trace);
        let sequence = u64::try_from(trace.len()).unwrap_or(u64::MAX);
        debug!(resource = %resource, ?phase, sequence, "recorded engine event");
        trace.push(TraceEvent {
            sequence,
            resource: resource.clone(),
            phase,
        });
    }

    async fn realize<T, F>(&self, name: &ResourceName, work: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Result<T, EngineError> + Send,
    {
        self.record(name, TracePhase::Submitted);
        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }

        let result = if self.failures.contains(name) {
            Err(EngineError::Rejected {
                message: format!("{name} was rejected by the engine"),
            })
        } else {
            work()
        };

        let phase = if result.is_ok() {
            TracePhase::Realized
        } else {
            TracePhase::Failed
        };
        self.record(name, phase);
        result
    }

    fn keep_rendered(&self, name: &ResourceName, content: String) {
        lock(&self.rendered).insert(name.clone(), content);
    }

    fn encode(what: &ResourceName, value: &serde_json::Value) -> Result<String, EngineError> {
        serde_json::to_string_pretty(value).map_err(|source| EngineError::Encode {
            what: what.to_string(),
            source,
        })
    }
}

impl ProvisioningEngine for RecordingEngine {
    fn build_image<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a ImageSpec,
    ) -> BoxFuture<'a, Result<ImageRef, EngineError>> {
        self.realize(name, move || {
            ImageRef::from_repository(&spec.repository, &spec.tag).map_err(EngineError::from)
        })
        .boxed()
    }

    fn provision_database<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a DatabaseSpec,
    ) -> BoxFuture<'a, Result<DatabaseEndpoint, EngineError>> {
        self.realize(name, move || {
            let address = spec
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("{name}.{}.db.invalid", self.region));
            Ok(DatabaseEndpoint {
                address,
                port: spec.port,
            })
        })
        .boxed()
    }

    fn submit(&self, submission: Submission) -> BoxFuture<'_, Result<Realized, EngineError>> {
        async move {
            let name = submission.name().clone();
            self.realize(&name, || match submission {
                Submission::Secret {
                    name,
                    namespace,
                    data,
                } => {
                    let content = Self::encode(&name, &secret_object(&name, &namespace, &data))?;
                    self.keep_rendered(&name, content);
                    Ok(Realized::named(&name))
                }
                Submission::Manifest { name, manifest, .. } => {
                    let content = manifest.consume()?;
                    let objects = count_documents(&content);
                    self.keep_rendered(&name, content);
                    Ok(Realized::named(&name).with("objects", objects.to_string()))
                }
                Submission::Autoscaler {
                    name,
                    namespace,
                    spec,
                } => {
                    let content =
                        Self::encode(&name, &autoscaler_object(&name, &namespace, &spec))?;
                    self.keep_rendered(&name, content);
                    Ok(Realized::named(&name))
                }
            })
            .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;
    use std::path::PathBuf;

    use caisson_domain::{
        DatabaseSpec, DeployContext, ImageSpec, PlaceholderToken, ResourceName, SubstitutionTable,
    };

    use super::{RecordingEngine, TracePhase};
    use crate::provisioner::{ProvisioningEngine, Submission};
    use crate::template::materialize_in;

    fn name(value: &str) -> ResourceName {
        ResourceName::try_from(value).expect("name")
    }

    fn context() -> DeployContext {
        DeployContext {
            stack: "app".to_string(),
            cluster: "app-cluster".to_string(),
            region: "us-east-1".to_string(),
            namespace: "default".to_string(),
            kubeconfig: None,
        }
    }

    fn database(endpoint: Option<&str>) -> DatabaseSpec {
        DatabaseSpec {
            engine: "mysql".to_string(),
            db_name: "appdb".to_string(),
            username: "admin".to_string(),
            password: "Admin12345!".to_string(),
            port: 3306,
            endpoint: endpoint.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn database_endpoint_falls_back_to_synthetic_host() {
        let engine = RecordingEngine::new(&context());

        let synthetic = engine
            .provision_database(&name("mysql-db"), &database(None))
            .await
            .expect("provision");
        assert_eq!(synthetic.address, "mysql-db.us-east-1.db.invalid");

        let configured = engine
            .provision_database(&name("mysql-db"), &database(Some("db.internal")))
            .await
            .expect("provision");
        assert_eq!(configured.address, "db.internal");
        assert_eq!(configured.port, 3306);
    }

    #[tokio::test]
    async fn builds_image_reference_from_repository() {
        let engine = RecordingEngine::new(&context());
        let spec = ImageSpec {
            repository: "123456789012.dkr.ecr.us-east-1.amazonaws.com/backend-repo".to_string(),
            tag: "latest".to_string(),
            context: None,
            platform: Some("linux/amd64".to_string()),
        };

        let image = engine
            .build_image(&name("backend-image"), &spec)
            .await
            .expect("build");
        assert_eq!(
            image.to_string(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/backend-repo:latest"
        );

        let phases: Vec<_> = engine.trace().into_iter().map(|event| event.phase).collect();
        assert_eq!(phases, vec![TracePhase::Submitted, TracePhase::Realized]);
    }

    #[tokio::test]
    async fn manifest_submission_consumes_the_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("frontend.yaml");
        fs::write(&template, "image: local/frontend:latest\n").expect("write template");
        let substitutions: SubstitutionTable = [(
            PlaceholderToken::try_from("local/frontend:latest").expect("token"),
            "registry/frontend:v1".to_string(),
        )]
        .into_iter()
        .collect();
        let manifest = materialize_in(temp.path(), &template, &substitutions).expect("materialize");
        let artifact: PathBuf = manifest.path().to_path_buf();

        let engine = RecordingEngine::new(&context());
        let realized = engine
            .submit(Submission::Manifest {
                name: name("frontend"),
                namespace: "default".to_string(),
                manifest,
            })
            .await
            .expect("submit");

        assert!(!artifact.exists());
        assert_eq!(realized.outputs.get("objects").map(String::as_str), Some("1"));
        assert_eq!(
            engine.rendered("frontend").as_deref(),
            Some("image: registry/frontend:v1\n")
        );
    }

    #[tokio::test]
    async fn injected_failure_is_recorded() {
        let engine = RecordingEngine::new(&context()).fail_on(name("db-connection"));

        let error = engine
            .submit(Submission::Secret {
                name: name("db-connection"),
                namespace: "default".to_string(),
                data: std::collections::BTreeMap::new(),
            })
            .await
            .expect_err("must fail");

        assert!(error.to_string().contains("db-connection"), "{error}");
        let trace = engine.trace();
        assert_eq!(trace.last().map(|event| event.phase), Some(TracePhase::Failed));
        assert_eq!(engine.rendered("db-connection"), None);
    }
}
