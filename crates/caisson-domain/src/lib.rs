use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod report;
mod stack;

pub use report::{
    DeployReport, PlanReport, PlannedResource, ResourceResult, ResourceStatus,
};
pub use stack::{
    AutoscalerSpec, DatabaseSpec, DependencyEdge, DeployContext, EdgeKind, ImageSpec,
    ManifestSpec, OutputRef, ResourceKind, ResourceSpec, SecretSpec, StackSpec, ValueSource,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainValidationError {
    #[error("resource name must not be empty")]
    EmptyResourceName,
    #[error("placeholder token must not be empty")]
    EmptyPlaceholderToken,
    #[error("invalid image reference \"{value}\": {reason}")]
    InvalidImageRef { value: String, reason: &'static str },
}

macro_rules! non_blank_string {
    ($(#[$meta:meta])* $name:ident, $error:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wrap a string, rejecting values that are empty.
            ///
            /// # Errors
            ///
            /// Returns an error when `value` is empty.
            pub fn new(value: String) -> Result<Self, DomainValidationError> {
                if Self::is_blank(&value) {
                    Err($error)
                } else {
                    Ok(Self(value))
                }
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = DomainValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(formatter)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

non_blank_string!(
    /// Name of a declared stack resource, unique within a stack.
    ResourceName,
    DomainValidationError::EmptyResourceName
);

non_blank_string!(
    /// Literal text standing in for a value that is only known at deploy time.
    ///
    /// Whitespace is significant: a token is matched byte for byte.
    PlaceholderToken,
    DomainValidationError::EmptyPlaceholderToken
);

impl ResourceName {
    fn is_blank(value: &str) -> bool {
        value.trim().is_empty()
    }
}

impl PlaceholderToken {
    const fn is_blank(value: &str) -> bool {
        value.is_empty()
    }
}

/// A pushed container image location of the form `<registry-host>/<repository>:<tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: String,
}

impl ImageRef {
    /// Parse a full image reference.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry host, repository, or tag is missing.
    pub fn parse(value: &str) -> Result<Self, DomainValidationError> {
        let invalid = |reason| DomainValidationError::InvalidImageRef {
            value: value.to_string(),
            reason,
        };

        let (registry, rest) = value
            .split_once('/')
            .ok_or_else(|| invalid("expected <registry-host>/<repository>:<tag>"))?;
        if registry.is_empty() {
            return Err(invalid("registry host is empty"));
        }
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(|| invalid("missing tag"))?;
        if repository.is_empty() {
            return Err(invalid("repository is empty"));
        }
        if tag.is_empty() || tag.contains('/') {
            return Err(invalid("missing tag"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Join a repository URL (`<registry-host>/<repository>`) with a tag.
    ///
    /// # Errors
    ///
    /// Returns an error when the joined value is not a valid image reference.
    pub fn from_repository(repository_url: &str, tag: &str) -> Result<Self, DomainValidationError> {
        Self::parse(&format!("{repository_url}:{tag}"))
    }

    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn repository_url(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}

/// Placeholder token to replacement text. Iteration order is the token's
/// lexicographic order, so applying a table is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubstitutionTable(BTreeMap<PlaceholderToken, String>);

impl SubstitutionTable {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, token: PlaceholderToken, replacement: String) -> Option<String> {
        self.0.insert(token, replacement)
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.as_str() == token)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlaceholderToken, &str)> {
        self.0.iter().map(|(key, value)| (key, value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(PlaceholderToken, String)> for SubstitutionTable {
    fn from_iter<I: IntoIterator<Item = (PlaceholderToken, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::{DomainValidationError, ImageRef, PlaceholderToken, ResourceName, SubstitutionTable};

    #[test]
    fn resource_name_rejects_blank_values() {
        let error = ResourceName::try_from("   ").expect_err("blank names must be rejected");
        assert!(matches!(error, DomainValidationError::EmptyResourceName));
    }

    #[test]
    fn placeholder_token_rejects_empty_but_keeps_whitespace() {
        let error = PlaceholderToken::try_from("").expect_err("empty tokens must be rejected");
        assert!(matches!(error, DomainValidationError::EmptyPlaceholderToken));

        let token = PlaceholderToken::try_from(" ").expect("whitespace is a literal token");
        assert_eq!(token.as_str(), " ");
    }

    #[test]
    fn image_ref_parses_registry_repository_and_tag() {
        let image =
            ImageRef::parse("123456789012.dkr.ecr.us-east-1.amazonaws.com/backend-repo:latest")
                .expect("valid image ref");
        assert_eq!(image.registry(), "123456789012.dkr.ecr.us-east-1.amazonaws.com");
        assert_eq!(image.repository(), "backend-repo");
        assert_eq!(image.tag(), "latest");
        assert_eq!(
            image.to_string(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/backend-repo:latest"
        );
    }

    #[test]
    fn image_ref_allows_registry_port_and_nested_repository() {
        let image = ImageRef::parse("localhost:5000/team/frontend:v1").expect("valid image ref");
        assert_eq!(image.registry(), "localhost:5000");
        assert_eq!(image.repository(), "team/frontend");
        assert_eq!(image.repository_url(), "localhost:5000/team/frontend");
        assert_eq!(image.tag(), "v1");
    }

    #[test]
    fn image_ref_rejects_missing_parts() {
        for value in ["backend:latest", "/backend:latest", "registry/backend", "registry/:v1", "registry/backend:"] {
            let error = ImageRef::parse(value).expect_err("invalid image ref");
            assert!(
                matches!(error, DomainValidationError::InvalidImageRef { .. }),
                "{value}: {error}"
            );
        }
    }

    #[test]
    fn substitution_table_iterates_in_token_order() {
        let table: SubstitutionTable = [
            (
                PlaceholderToken::try_from("local/frontend:latest").expect("token"),
                "b".to_string(),
            ),
            (
                PlaceholderToken::try_from("local/backend:latest").expect("token"),
                "a".to_string(),
            ),
        ]
        .into_iter()
        .collect();

        let keys: Vec<&str> = table.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["local/backend:latest", "local/frontend:latest"]);
        assert_eq!(table.get("local/frontend:latest"), Some("b"));
    }
}
