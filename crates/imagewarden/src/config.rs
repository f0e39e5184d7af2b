use std::fs;

use camino::Utf8Path;
use image_refs::NormalizedImage;
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    App,
    policy::{CompliancePolicy, PolicyError},
};

const CONFIG_CANDIDATES: &[&str] = &[
    "imagewarden.yml",
    "imagewarden.yaml",
    ".github/imagewarden.yml",
    ".github/imagewarden.yaml",
];

#[derive(Error, Debug)]
#[error("configuration error in {path}")]
pub(crate) struct ConfigError {
    /// The path to the configuration file (or discovery directory)
    /// that caused this error.
    path: String,
    /// The source of this error.
    pub(crate) source: ConfigErrorInner,
}

#[derive(Error, Debug)]
pub(crate) enum ConfigErrorInner {
    /// An I/O error occurred while loading the configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is syntactically invalid.
    #[error("invalid configuration syntax")]
    Syntax(#[source] serde_yaml::Error),

    /// The `images` policy is semantically invalid.
    #[error("invalid `images` policy")]
    Policy(#[from] PolicyError),

    /// An `ignore-tags` entry is empty.
    #[error("`ignore-tags` entries can't be empty")]
    EmptyIgnoredTag,

    /// Discovery found nothing to load.
    #[error("no configuration file found (tried: {})", CONFIG_CANDIDATES.join(", "))]
    Missing,
}

fn default_ignore_tags() -> Vec<String> {
    vec!["local".into()]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    org: Option<String>,
    images: IndexMap<String, serde_yaml::Value>,
    #[serde(default = "default_ignore_tags")]
    ignore_tags: Vec<String>,
}

impl RawConfig {
    fn load(contents: &str) -> Result<Self, ConfigErrorInner> {
        serde_yaml::from_str(contents).map_err(ConfigErrorInner::Syntax)
    }
}

/// A loaded configuration: the compliance policy plus run defaults.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// The organization to audit when none is given on the command line.
    pub(crate) org: Option<String>,
    pub(crate) policy: CompliancePolicy,
    ignore_tags: Vec<String>,
}

impl Config {
    pub(crate) fn load(contents: &str) -> Result<Self, ConfigErrorInner> {
        let raw = RawConfig::load(contents)?;

        if raw.ignore_tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(ConfigErrorInner::EmptyIgnoredTag);
        }

        Ok(Self {
            org: raw.org.filter(|org| !org.trim().is_empty()),
            policy: CompliancePolicy::from_entries(&raw.images)?,
            ignore_tags: raw.ignore_tags,
        })
    }

    fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        tracing::debug!("loading config from `{path}`");

        fs::read_to_string(path)
            .map_err(ConfigErrorInner::from)
            .and_then(|contents| Self::load(&contents))
            .map_err(|err| ConfigError {
                path: path.to_string(),
                source: err,
            })
    }

    /// Looks for a configuration file in `dir`, trying each of
    /// the known candidate names in order.
    fn discover_in_dir(dir: &Utf8Path) -> Result<Self, ConfigError> {
        tracing::debug!("attempting config discovery in `{dir}`");

        for candidate in CONFIG_CANDIDATES {
            let candidate_path = dir.join(candidate);
            if candidate_path.is_file() {
                tracing::debug!("found config candidate at `{candidate_path}`");
                return Self::from_path(&candidate_path);
            }
        }

        Err(ConfigError {
            path: dir.to_string(),
            source: ConfigErrorInner::Missing,
        })
    }

    /// Loads the [`Config`] for the given [`App`]: the `--config` file
    /// if one was given, otherwise one discovered in the working directory.
    pub(crate) fn new(app: &App) -> Result<Self, ConfigError> {
        match &app.config {
            Some(path) => Self::from_path(path),
            None => Self::discover_in_dir(Utf8Path::new(".")),
        }
    }

    /// Returns `true` if references to `image` should be skipped entirely,
    /// e.g. because its tag marks a locally built image.
    pub(crate) fn ignores(&self, image: &NormalizedImage) -> bool {
        let version = image.version();
        !version.is_digest() && self.ignore_tags.iter().any(|tag| tag == version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use image_refs::NormalizedImage;

    use super::{Config, ConfigErrorInner};
    use crate::policy::PolicyError;

    #[test]
    fn test_load_minimal() {
        let config = Config::load("images:\n  nginx: ['1.21']\n").unwrap();

        assert_eq!(config.org, None);
        assert_eq!(config.policy.len(), 1);
        assert!(config.ignores(&NormalizedImage::parse("app:local").unwrap()));
        assert!(!config.ignores(&NormalizedImage::parse("app:1.0").unwrap()));
    }

    #[test]
    fn test_load_full() {
        let config = Config::load(
            r#"
org: acme
images:
  library/nginx: ["1.21", "1.22"]
  python: "*"
ignore-tags: [dev, snapshot]
"#,
        )
        .unwrap();

        assert_eq!(config.org.as_deref(), Some("acme"));
        assert_eq!(config.policy.len(), 2);
        assert!(config.ignores(&NormalizedImage::parse("app:snapshot").unwrap()));
        assert!(!config.ignores(&NormalizedImage::parse("app:local").unwrap()));
    }

    #[test]
    fn test_load_json() {
        let config = Config::load(r#"{"images": {"nginx": ["1.21"]}}"#).unwrap();
        assert_eq!(config.policy.len(), 1);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            Config::load("images: {}"),
            Err(ConfigErrorInner::Policy(PolicyError::Empty))
        ));
        assert!(matches!(
            Config::load("org: acme"),
            Err(ConfigErrorInner::Syntax(_))
        ));
        assert!(matches!(
            Config::load("images: {nginx: '*'}\nunknown: 1"),
            Err(ConfigErrorInner::Syntax(_))
        ));
        assert!(matches!(
            Config::load("images: {nginx: [1.21]}"),
            Err(ConfigErrorInner::Policy(
                PolicyError::NonStringVersion { .. }
            ))
        ));
        assert!(matches!(
            Config::load("images: {nginx: '*'}\nignore-tags: ['']"),
            Err(ConfigErrorInner::EmptyIgnoredTag)
        ));
    }

    #[test]
    fn test_discover_in_dir() {
        let dir = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/integration/test-data/config-scenarios");

        let config = Config::discover_in_dir(&dir.join("config-in-root")).unwrap();
        assert_eq!(config.org.as_deref(), Some("root-org"));

        let config = Config::discover_in_dir(&dir.join("config-in-dotgithub")).unwrap();
        assert_eq!(config.org.as_deref(), Some("dotgithub-org"));

        let err = Config::discover_in_dir(&dir.join("no-config")).unwrap_err();
        assert!(matches!(err.source, ConfigErrorInner::Missing));
    }
}
