use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use caisson_domain::{DomainValidationError, ResourceName};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("manifest template not found or unreadable: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// A value some consumer waits on never became available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{origin} did not resolve: {reason}")]
pub struct Unresolved {
    /// The resource whose failure caused the value to be missing.
    pub origin: ResourceName,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{consumer} was submitted before {upstream} was realized")]
pub struct DependencyViolation {
    pub consumer: ResourceName,
    pub upstream: ResourceName,
}

#[derive(Debug, Error)]
pub enum StackEvalError {
    #[error("failed to canonicalize stack path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stack path has no parent: {path}")]
    MissingStackParent { path: PathBuf },
    #[error("failed to read stack: {path}")]
    ReadStack {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    LuaRuntime {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },
    #[error("{path}: stack {{ ... }} must be declared exactly once")]
    MissingContext { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency graph has missing nodes:\n  - {details}")]
    MissingNodes { details: String },
    #[error("{message}")]
    Invariant { message: String },
    #[error("dependency cycle detected among: {cycle}")]
    CycleDetected { cycle: String },
    #[error("{consumer} reads unknown output {reference} ({kind} outputs: {available})")]
    UnknownOutput {
        consumer: String,
        reference: String,
        kind: &'static str,
        available: String,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("binary \"{binary}\" not found on PATH")]
    BinaryNotFound { binary: &'static str },
    #[error("failed to execute {program} {args}")]
    CommandSpawn {
        program: &'static str,
        args: String,
        #[source]
        source: io::Error,
    },
    #[error("command failed: {program} {args} (exit: {status}): {stderr}")]
    CommandFailed {
        program: &'static str,
        args: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    InvalidImage(#[from] DomainValidationError),
    #[error("failed to encode {what} as JSON")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database {name} has no endpoint configured")]
    MissingEndpoint { name: String },
    #[error("{message}")]
    Rejected { message: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    StackEval(#[from] StackEvalError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
