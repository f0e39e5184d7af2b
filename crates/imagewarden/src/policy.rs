//! The compliance policy: an allow-list of image identities, each with
//! the versions of that image that may be used.

use std::collections::HashMap;

use image_refs::{ImageIdentity, NormalizedImage, ReferenceError, VersionSelector};
use indexmap::{IndexMap, IndexSet};
use serde_yaml::Value;
use thiserror::Error;

/// The policy value that allows any version of an image.
const WILDCARD: &str = "*";

/// Errors produced while building a [`CompliancePolicy`] from its
/// configured form.
#[derive(Debug, Error)]
pub(crate) enum PolicyError {
    #[error("no images are allowed by the policy")]
    Empty,
    #[error("invalid image `{key}`")]
    InvalidImage {
        key: String,
        #[source]
        source: ReferenceError,
    },
    #[error("`{key}` and `{other}` name the same image")]
    Duplicate { key: String, other: String },
    #[error("no versions listed for `{key}` (use \"*\" to allow any version)")]
    EmptyVersions { key: String },
    #[error("versions for `{key}` must be strings, but found {found}")]
    NonStringVersion { key: String, found: &'static str },
    #[error("invalid version `{version}` for `{key}`")]
    InvalidVersion {
        key: String,
        version: String,
        #[source]
        source: ReferenceError,
    },
    #[error("`{key}` must be a list of versions or \"*\", but found {found}")]
    InvalidEntry { key: String, found: &'static str },
}

/// The versions of a single image that the policy allows.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AllowedVersions {
    /// Every version is allowed, including `latest` and digests.
    Any,
    /// Only these exact tags and digests are allowed.
    Only(IndexSet<VersionSelector>),
}

impl AllowedVersions {
    fn from_value(key: &str, value: &Value) -> Result<Self, PolicyError> {
        let versions = match value {
            Value::String(version) => vec![version.as_str()],
            Value::Sequence(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(version) => Ok(version.as_str()),
                    other => Err(PolicyError::NonStringVersion {
                        key: key.into(),
                        found: describe(other),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(PolicyError::InvalidEntry {
                    key: key.into(),
                    found: describe(other),
                });
            }
        };

        if versions.is_empty() {
            return Err(PolicyError::EmptyVersions { key: key.into() });
        }

        if versions.iter().any(|v| v.trim() == WILDCARD) {
            return Ok(Self::Any);
        }

        versions
            .into_iter()
            .map(|version| {
                VersionSelector::parse(version).map_err(|source| PolicyError::InvalidVersion {
                    key: key.into(),
                    version: version.into(),
                    source,
                })
            })
            .collect::<Result<IndexSet<_>, _>>()
            .map(Self::Only)
    }

    fn allows(&self, version: &VersionSelector) -> bool {
        match self {
            Self::Any => true,
            Self::Only(versions) => versions.contains(version),
        }
    }
}

/// A loaded, read-only compliance policy.
#[derive(Clone, Debug, Default)]
pub(crate) struct CompliancePolicy {
    entries: IndexMap<ImageIdentity, AllowedVersions>,
}

impl CompliancePolicy {
    /// Builds a policy from the `images` mapping of a configuration file.
    ///
    /// Keys are normalized exactly like image references, so two keys
    /// that spell the same image differently are rejected as duplicates.
    pub(crate) fn from_entries(entries: &IndexMap<String, Value>) -> Result<Self, PolicyError> {
        if entries.is_empty() {
            return Err(PolicyError::Empty);
        }

        let mut seen: HashMap<ImageIdentity, &str> = HashMap::new();
        let mut policy = Self::default();

        for (key, value) in entries {
            let identity =
                ImageIdentity::parse(key).map_err(|source| PolicyError::InvalidImage {
                    key: key.clone(),
                    source,
                })?;

            if let Some(other) = seen.insert(identity.clone(), key) {
                return Err(PolicyError::Duplicate {
                    key: key.clone(),
                    other: other.into(),
                });
            }

            let allowed = AllowedVersions::from_value(key, value)?;
            policy.entries.insert(identity, allowed);
        }

        Ok(policy)
    }

    /// Returns the compliance verdict for `image`.
    ///
    /// An image with no policy entry is never compliant. Neither `latest`
    /// nor a digest gets any special treatment: both must be listed
    /// explicitly unless the entry allows any version.
    pub(crate) fn is_compliant(&self, image: &NormalizedImage) -> bool {
        self.entries
            .get(image.identity())
            .is_some_and(|allowed| allowed.allows(image.version()))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "nothing",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
