//! Container image references and their canonical form.
//!
//! An image can be spelled many ways: `nginx`, `nginx:latest`,
//! `docker.io/library/nginx:latest` and `index.docker.io/library/nginx`
//! all name the same thing. [`NormalizedImage`] collapses these spellings
//! into a single comparable value, split into an [`ImageIdentity`]
//! (registry and repository path) and a [`VersionSelector`]
//! (tag or digest).

#![deny(missing_docs)]

use std::{fmt::Display, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// The registry that references without an explicit registry resolve to.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The namespace that single-segment names on the default registry
/// (i.e. "official" images) live under.
pub const OFFICIAL_NAMESPACE: &str = "library";

/// The tag implied by a reference with neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Hostnames that are all spellings of [`DEFAULT_REGISTRY`].
const DEFAULT_REGISTRY_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// A single `/`-delimited component of a repository path.
///
/// See: <https://github.com/distribution/reference/blob/main/reference.go>
static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap()
});

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").unwrap());

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*:[a-fA-F0-9]{32,}$").unwrap()
});

/// Errors produced while parsing an image reference.
#[derive(Debug, Error, PartialEq)]
pub enum ReferenceError {
    /// Nothing was left after stripping whitespace and quotes.
    #[error("empty image reference")]
    Empty,
    /// An `@` was present, but wasn't followed by a valid `algorithm:hex` digest.
    #[error("malformed digest in `{0}`")]
    MalformedDigest(String),
    /// A `:` tag separator was present, but nothing followed it.
    #[error("empty tag in `{0}`")]
    EmptyTag(String),
    /// The tag contains characters that no registry accepts.
    #[error("invalid tag `{tag}` in `{reference}`")]
    InvalidTag {
        /// The full reference.
        reference: String,
        /// The offending tag.
        tag: String,
    },
    /// The repository path is empty or has an invalid component.
    #[error("invalid repository path in `{0}`")]
    InvalidPath(String),
    /// A bare identity was expected, but the input carries a tag or digest.
    #[error("`{0}` names a version, but only a bare image name is allowed here")]
    UnexpectedVersion(String),
}

/// How a reference selects a particular version of an image.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VersionSelector {
    /// A mutable tag, e.g. `1.21` or `latest`.
    Tag(String),
    /// An immutable content digest, e.g. `sha256:…`. Always lowercase.
    Digest(String),
}

impl VersionSelector {
    /// The selector implied by a reference that doesn't specify one.
    pub fn latest() -> Self {
        Self::Tag(DEFAULT_TAG.into())
    }

    /// Parses a standalone tag or digest, e.g. from an allow-list.
    ///
    /// Anything containing a `:` is treated as a digest.
    pub fn parse(version: &str) -> Result<Self, ReferenceError> {
        let version = version.trim();

        if version.is_empty() {
            Err(ReferenceError::EmptyTag(version.into()))
        } else if version.contains(':') {
            if DIGEST.is_match(version) {
                Ok(Self::Digest(version.to_ascii_lowercase()))
            } else {
                Err(ReferenceError::MalformedDigest(version.into()))
            }
        } else if TAG.is_match(version) {
            Ok(Self::Tag(version.into()))
        } else {
            Err(ReferenceError::InvalidTag {
                reference: version.into(),
                tag: version.into(),
            })
        }
    }

    /// Returns `true` if this selector is the `latest` tag.
    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Tag(tag) if tag == DEFAULT_TAG)
    }

    /// Returns `true` if this selector is a digest.
    pub fn is_digest(&self) -> bool {
        matches!(self, Self::Digest(_))
    }

    /// The tag or digest as written.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(tag) => tag,
            Self::Digest(digest) => digest,
        }
    }
}

impl Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of an image, independent of its version:
/// a registry and a repository path within that registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIdentity {
    /// The registry host (and port), or `None` for [`DEFAULT_REGISTRY`].
    registry: Option<String>,
    /// The repository path, with [`OFFICIAL_NAMESPACE`] filled in
    /// for single-segment names on the default registry.
    path: String,
}

impl ImageIdentity {
    /// Parses a bare image identity such as `nginx` or `ghcr.io/acme/base`.
    ///
    /// Fails with [`ReferenceError::UnexpectedVersion`] if the input
    /// carries a tag or digest.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        match split_reference(raw)? {
            (identity, None) => Ok(identity),
            (_, Some(_)) => Err(ReferenceError::UnexpectedVersion(raw.trim().into())),
        }
    }

    // https://stackoverflow.com/a/42116190
    fn is_registry(segment: &str) -> bool {
        segment == "localhost" || segment.contains('.') || segment.contains(':')
    }

    fn from_name(name: &str, reference: &str) -> Result<Self, ReferenceError> {
        let (registry, path) = match name.split_once('/') {
            Some((first, rest)) if Self::is_registry(first) => {
                (Some(first.to_ascii_lowercase()), rest)
            }
            _ => (None, name),
        };

        if path.is_empty() || !path.split('/').all(|c| PATH_COMPONENT.is_match(c)) {
            return Err(ReferenceError::InvalidPath(reference.into()));
        }

        let registry = registry.filter(|r| !DEFAULT_REGISTRY_ALIASES.contains(&r.as_str()));

        let path = if registry.is_none() && !path.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{path}")
        } else {
            path.into()
        };

        Ok(Self { registry, path })
    }

    /// The registry this image lives on, with the default filled in.
    pub fn registry(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// The registry, if it isn't [`DEFAULT_REGISTRY`].
    pub fn explicit_registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    /// The repository path within the registry.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Display for ImageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry(), self.path)
    }
}

impl FromStr for ImageIdentity {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ImageIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A fully canonicalized image reference.
///
/// Two references to the same image and version always produce
/// equal `NormalizedImage`s, regardless of how they were spelled.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedImage {
    identity: ImageIdentity,
    version: VersionSelector,
}

impl NormalizedImage {
    /// Normalizes a raw reference, as it might appear after `FROM`
    /// or `image:`.
    ///
    /// Surrounding whitespace and quotes are ignored. A digest takes
    /// precedence over a tag when both are present; a reference with
    /// neither is treated as `latest`.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let (identity, version) = split_reference(raw)?;

        Ok(Self {
            identity,
            version: version.unwrap_or_else(VersionSelector::latest),
        })
    }

    /// The version-independent identity of this image.
    pub fn identity(&self) -> &ImageIdentity {
        &self.identity
    }

    /// The tag or digest this reference selects.
    pub fn version(&self) -> &VersionSelector {
        &self.version
    }

    /// The canonical spelling of this reference, which itself
    /// normalizes back to `self`.
    pub fn canonical_form(&self) -> String {
        self.to_string()
    }
}

impl Display for NormalizedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            VersionSelector::Tag(tag) => write!(f, "{}:{tag}", self.identity),
            VersionSelector::Digest(digest) => write!(f, "{}@{digest}", self.identity),
        }
    }
}

impl FromStr for NormalizedImage {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NormalizedImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Splits a reference into its identity and its (optional) version.
fn split_reference(raw: &str) -> Result<(ImageIdentity, Option<VersionSelector>), ReferenceError> {
    let reference = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim();

    if reference.is_empty() {
        return Err(ReferenceError::Empty);
    }

    let (name, digest) = match reference.split_once('@') {
        Some((name, digest)) => {
            if name.is_empty() || !DIGEST.is_match(digest) {
                return Err(ReferenceError::MalformedDigest(reference.into()));
            }
            (name, Some(digest.to_ascii_lowercase()))
        }
        None => (reference, None),
    };

    // The tag separator is the last `:` after the last `/`; any `:`
    // before that belongs to a registry port.
    let tail = name.rfind('/').map_or(0, |idx| idx + 1);
    let (name, tag) = match name[tail..].rfind(':') {
        Some(idx) => (&name[..tail + idx], Some(&name[tail + idx + 1..])),
        None => (name, None),
    };

    let version = match (digest, tag) {
        // The digest wins; whatever tag accompanied it is ignored.
        (Some(digest), _) => Some(VersionSelector::Digest(digest)),
        (None, Some("")) => return Err(ReferenceError::EmptyTag(reference.into())),
        (None, Some(tag)) if !TAG.is_match(tag) => {
            return Err(ReferenceError::InvalidTag {
                reference: reference.into(),
                tag: tag.into(),
            });
        }
        (None, Some(tag)) => Some(VersionSelector::Tag(tag.into())),
        (None, None) => None,
    };

    let identity = ImageIdentity::from_name(name, reference)?;

    Ok((identity, version))
}
