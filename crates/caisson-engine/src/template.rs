use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use caisson_domain::SubstitutionTable;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tracing::debug;

use crate::error::TemplateError;

const ARTIFACT_PREFIX: &str = "caisson-";
const ARTIFACT_SUFFIX: &str = ".yaml";

/// Replace every literal occurrence of each token with its replacement.
///
/// Matching is plain byte-for-byte text search, unaware of word boundaries or
/// YAML structure. Tokens that do not occur in `text` are ignored.
#[must_use]
pub fn substitute(text: &str, substitutions: &SubstitutionTable) -> String {
    let mut rendered = text.to_string();
    for (token, replacement) in substitutions.iter() {
        if rendered.contains(token.as_str()) {
            rendered = rendered.replace(token.as_str(), replacement);
        }
    }
    rendered
}

/// Tokens of `substitutions` that never occur in `text`.
#[must_use]
pub fn absent_tokens<'a>(text: &str, substitutions: &'a SubstitutionTable) -> Vec<&'a str> {
    substitutions
        .iter()
        .map(|(token, _)| token.as_str())
        .filter(|token| !text.contains(token))
        .collect()
}

pub(crate) fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// A substituted manifest written to a uniquely named temporary file.
///
/// The file is removed when the value is consumed, discarded, or dropped, so
/// it can be read at most once.
#[derive(Debug)]
pub struct MaterializedManifest {
    template: PathBuf,
    path: TempPath,
    content_hash: String,
}

impl MaterializedManifest {
    #[must_use]
    pub fn template(&self) -> &Path {
        &self.template
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Read the materialized content and delete the artifact.
    ///
    /// # Errors
    ///
    /// Returns an error when the artifact cannot be read or removed.
    pub fn consume(self) -> Result<String, TemplateError> {
        let Self { path, .. } = self;
        let content = fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            context: format!("failed to read materialized manifest {}", path.display()),
            source,
        })?;
        close_artifact(path)?;
        Ok(content)
    }

    /// Delete the artifact without reading it.
    ///
    /// # Errors
    ///
    /// Returns an error when the artifact cannot be removed.
    pub fn discard(self) -> Result<(), TemplateError> {
        close_artifact(self.path)
    }
}

fn close_artifact(path: TempPath) -> Result<(), TemplateError> {
    let display = path.display().to_string();
    path.close().map_err(|source| TemplateError::Io {
        context: format!("failed to remove materialized manifest {display}"),
        source,
    })
}

/// Materialize `template` into the system temporary directory.
///
/// # Errors
///
/// Returns [`TemplateError::NotFound`] when the template cannot be read and
/// [`TemplateError::Io`] when the temporary artifact cannot be written.
pub fn materialize(
    template: &Path,
    substitutions: &SubstitutionTable,
) -> Result<MaterializedManifest, TemplateError> {
    materialize_in(&std::env::temp_dir(), template, substitutions)
}

/// Materialize `template` into a temporary file created inside `dir`.
///
/// The template is read before anything is created, so a missing template
/// never leaves an artifact behind.
///
/// # Errors
///
/// Returns [`TemplateError::NotFound`] when the template cannot be read and
/// [`TemplateError::Io`] when the temporary artifact cannot be written.
pub fn materialize_in(
    dir: &Path,
    template: &Path,
    substitutions: &SubstitutionTable,
) -> Result<MaterializedManifest, TemplateError> {
    let source = fs::read_to_string(template).map_err(|source| TemplateError::NotFound {
        path: template.to_path_buf(),
        source,
    })?;
    let rendered = substitute(&source, substitutions);

    let mut file = tempfile::Builder::new()
        .prefix(ARTIFACT_PREFIX)
        .suffix(ARTIFACT_SUFFIX)
        .tempfile_in(dir)
        .map_err(|source| TemplateError::Io {
            context: format!("failed to create materialized manifest in {}", dir.display()),
            source,
        })?;
    file.write_all(rendered.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|source| TemplateError::Io {
            context: format!(
                "failed to write materialized manifest {}",
                file.path().display()
            ),
            source,
        })?;

    let path = file.into_temp_path();
    debug!(
        template = %template.display(),
        artifact = %path.display(),
        substitutions = substitutions.len(),
        "materialized manifest"
    );

    Ok(MaterializedManifest {
        template: template.to_path_buf(),
        path,
        content_hash: sha256_bytes(rendered.as_bytes()),
    })
}
