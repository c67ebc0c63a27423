use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use caisson_domain::{DatabaseSpec, DeployContext, ImageRef, ImageSpec, ResourceName};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    DatabaseEndpoint, ProvisioningEngine, Realized, Submission, autoscaler_object, secret_object,
};
use crate::error::EngineError;
use crate::template::MaterializedManifest;

const ROLLOUT_KINDS: &[&str] = &["deployment", "statefulset", "daemonset"];

/// Engine that builds images with `docker` and applies objects to a cluster
/// with `kubectl`.
#[derive(Debug)]
pub struct KubectlEngine {
    kubectl: PathBuf,
    docker: Option<PathBuf>,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl KubectlEngine {
    /// # Errors
    ///
    /// Returns an error when `kubectl` is not on `PATH`.
    pub fn new(context: &DeployContext, timeout: Duration) -> Result<Self, EngineError> {
        let kubectl =
            which::which("kubectl").map_err(|_| EngineError::BinaryNotFound { binary: "kubectl" })?;
        Ok(Self::with_binaries(
            kubectl,
            which::which("docker").ok(),
            context,
            timeout,
        ))
    }

    pub(crate) fn with_binaries(
        kubectl: PathBuf,
        docker: Option<PathBuf>,
        context: &DeployContext,
        timeout: Duration,
    ) -> Self {
        Self {
            kubectl,
            docker,
            kubeconfig: context.kubeconfig.clone(),
            timeout,
        }
    }

    async fn run(
        &self,
        program: &'static str,
        binary: &Path,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<String, EngineError> {
        let rendered_args = args.join(" ");
        debug!(program, args = %rendered_args, "running command");

        let output = tokio::time::timeout(self.timeout, spawn_and_wait(binary, args, stdin))
            .await
            .map_err(|_| EngineError::Timeout {
                what: format!("{program} {rendered_args}"),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|source| EngineError::CommandSpawn {
                program,
                args: rendered_args.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                program,
                args: rendered_args,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn kubectl(&self, args: Vec<String>, stdin: Option<String>) -> Result<String, EngineError> {
        let args = kubectl_args(self.kubeconfig.as_deref(), args);
        self.run("kubectl", &self.kubectl, &args, stdin).await
    }

    async fn apply_object(
        &self,
        name: &ResourceName,
        namespace: &str,
        object: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let body = serde_json::to_string(object).map_err(|source| EngineError::Encode {
            what: name.to_string(),
            source,
        })?;
        self.kubectl(
            vec![
                "apply".to_string(),
                "--namespace".to_string(),
                namespace.to_string(),
                "-f".to_string(),
                "-".to_string(),
            ],
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn apply_manifest(
        &self,
        name: &ResourceName,
        namespace: &str,
        manifest: MaterializedManifest,
    ) -> Result<Realized, EngineError> {
        let applied = self
            .kubectl(
                vec![
                    "apply".to_string(),
                    "--namespace".to_string(),
                    namespace.to_string(),
                    "-o".to_string(),
                    "name".to_string(),
                    "-f".to_string(),
                    manifest.path().to_string_lossy().into_owned(),
                ],
                None,
            )
            .await;
        manifest.discard()?;
        let applied = applied?;

        let objects: Vec<&str> = applied
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        for target in rollout_targets(&objects) {
            debug!(resource = %name, target, "waiting for rollout");
            self.kubectl(
                vec![
                    "rollout".to_string(),
                    "status".to_string(),
                    "--namespace".to_string(),
                    namespace.to_string(),
                    format!("--timeout={}s", self.timeout.as_secs()),
                    target.to_string(),
                ],
                None,
            )
            .await?;
        }

        Ok(Realized::named(name).with("objects", objects.len().to_string()))
    }
}

async fn spawn_and_wait(
    binary: &Path,
    args: &[String],
    stdin: Option<String>,
) -> std::io::Result<Output> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }

    child.wait_with_output().await
}

fn kubectl_args(kubeconfig: Option<&Path>, args: Vec<String>) -> Vec<String> {
    let Some(kubeconfig) = kubeconfig else {
        return args;
    };
    let mut out = vec![
        "--kubeconfig".to_string(),
        kubeconfig.to_string_lossy().into_owned(),
    ];
    out.extend(args);
    out
}

/// Applied objects whose rollout can be awaited, as printed by `kubectl apply -o name`.
fn rollout_targets<'a>(objects: &[&'a str]) -> Vec<&'a str> {
    objects
        .iter()
        .copied()
        .filter(|object| {
            object
                .split_once('/')
                .and_then(|(kind, _)| kind.split('.').next())
                .is_some_and(|kind| ROLLOUT_KINDS.contains(&kind))
        })
        .collect()
}

fn docker_build_args(image: &ImageRef, spec: &ImageSpec, context: &Path) -> Vec<String> {
    let mut args = vec!["build".to_string()];
    if let Some(platform) = &spec.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    args.push("--tag".to_string());
    args.push(image.to_string());
    args.push(context.to_string_lossy().into_owned());
    args
}

impl KubectlEngine {
    async fn build(&self, name: &ResourceName, spec: &ImageSpec) -> Result<ImageRef, EngineError> {
        let image = ImageRef::from_repository(&spec.repository, &spec.tag)?;
        let Some(context) = &spec.context else {
            debug!(resource = %name, image = %image, "using prebuilt image");
            return Ok(image);
        };
        let docker = self
            .docker
            .as_deref()
            .ok_or(EngineError::BinaryNotFound { binary: "docker" })?;

        self.run("docker", docker, &docker_build_args(&image, spec, context), None)
            .await?;
        self.run(
            "docker",
            docker,
            &["push".to_string(), image.to_string()],
            None,
        )
        .await?;
        info!(resource = %name, image = %image, "pushed image");
        Ok(image)
    }

    async fn apply_submission(&self, submission: Submission) -> Result<Realized, EngineError> {
        match submission {
            Submission::Secret {
                name,
                namespace,
                data,
            } => {
                self.apply_object(&name, &namespace, &secret_object(&name, &namespace, &data))
                    .await?;
                Ok(Realized::named(&name))
            }
            Submission::Manifest {
                name,
                namespace,
                manifest,
            } => self.apply_manifest(&name, &namespace, manifest).await,
            Submission::Autoscaler {
                name,
                namespace,
                spec,
            } => {
                self.apply_object(
                    &name,
                    &namespace,
                    &autoscaler_object(&name, &namespace, &spec),
                )
                .await?;
                Ok(Realized::named(&name))
            }
        }
    }
}

impl ProvisioningEngine for KubectlEngine {
    fn build_image<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a ImageSpec,
    ) -> BoxFuture<'a, Result<ImageRef, EngineError>> {
        self.build(name, spec).boxed()
    }

    fn provision_database<'a>(
        &'a self,
        name: &'a ResourceName,
        spec: &'a DatabaseSpec,
    ) -> BoxFuture<'a, Result<DatabaseEndpoint, EngineError>> {
        let endpoint = spec
            .endpoint
            .clone()
            .map(|address| DatabaseEndpoint {
                address,
                port: spec.port,
            })
            .ok_or_else(|| EngineError::MissingEndpoint {
                name: name.to_string(),
            });
        futures::future::ready(endpoint).boxed()
    }

    fn submit(&self, submission: Submission) -> BoxFuture<'_, Result<Realized, EngineError>> {
        self.apply_submission(submission).boxed()
    }
}
