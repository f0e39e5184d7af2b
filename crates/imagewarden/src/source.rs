//! Repository content sources.
//!
//! A repository is audited from a snapshot of its relevant files: the
//! Dockerfiles and pipeline definitions that can name base images.
//! Snapshots come either from a local directory or from a GitHub
//! repository tarball (see [`crate::github`]).

use std::{ffi::OsStr, fmt::Display, io::ErrorKind};

use camino::{Utf8Path, Utf8PathBuf};
use ignore::WalkBuilder;
use thiserror::Error;

use crate::tips;

/// The kinds of files that can reference images.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FileKind {
    /// A Dockerfile or Containerfile.
    Dockerfile,
    /// A CI/CD pipeline or compose definition.
    Pipeline,
}

impl FileKind {
    /// Classifies a repository-relative path, or returns `None` if the
    /// file isn't one we extract images from.
    pub(crate) fn from_path(path: &Utf8Path) -> Option<Self> {
        let name = path.file_name()?.to_ascii_lowercase();
        let yaml = name.ends_with(".yml") || name.ends_with(".yaml");
        let in_dir = |dir: &str| path.parent().is_some_and(|parent| parent.ends_with(dir));

        if ((name.starts_with("dockerfile") || name.starts_with("containerfile"))
            && !name.ends_with(".md"))
            || name.ends_with(".dockerfile")
        {
            return Some(Self::Dockerfile);
        }

        let pipeline = matches!(
            name.as_str(),
            ".gitlab-ci.yml"
                | ".gitlab-ci.yaml"
                | "azure-pipelines.yml"
                | "azure-pipelines.yaml"
                | "bitbucket-pipelines.yml"
                | ".drone.yml"
                | ".travis.yml"
                | "jenkinsfile"
        ) || name.starts_with("jenkinsfile.")
            || (yaml && in_dir(".github/workflows"))
            || (name == "config.yml" && in_dir(".circleci"))
            || (yaml && (name.starts_with("docker-compose") || name.starts_with("compose.")))
            || (yaml && path.components().any(|c| c.as_str() == ".concourse"))
            || (yaml && name.contains("pipeline"));

        pipeline.then_some(Self::Pipeline)
    }

    pub(crate) fn is_pipeline(self) -> bool {
        matches!(self, Self::Pipeline)
    }
}

/// A GitHub repository slug, i.e. `owner/repo[@ref]`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RepoSlug {
    /// The owner of the repository.
    pub(crate) owner: String,
    /// The name of the repository.
    pub(crate) repo: String,
    /// An optional Git reference, e.g. a branch or tag name.
    /// `None` means the repository's default branch.
    pub(crate) git_ref: Option<String>,
}

impl RepoSlug {
    pub(crate) fn new(owner: &str, repo: &str, git_ref: Option<&str>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            git_ref: git_ref.map(Into::into),
        }
    }
}

impl std::str::FromStr for RepoSlug {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, git_ref) = match s.rsplit_once('@') {
            Some((path, git_ref)) => (path, Some(git_ref)),
            None => (s, None),
        };

        let components = path.split('/').collect::<Vec<_>>();

        match components.as_slice() {
            [owner, repo]
                if !owner.is_empty()
                    && !repo.is_empty()
                    && git_ref.is_none_or(|git_ref| !git_ref.is_empty()) =>
            {
                Ok(Self::new(owner, repo, git_ref))
            }
            [_] => Err(anyhow::anyhow!(tips(
                format!("invalid repo slug (too short): {s}"),
                &["pass owner/repo or owner/repo@ref"]
            ))),
            [_, _] => Err(anyhow::anyhow!(tips(
                format!("invalid repo slug (empty component): {s}"),
                &["pass owner/repo or owner/repo@ref"]
            ))),
            _ => Err(anyhow::anyhow!(tips(
                format!("invalid repo slug (too many parts): {s}"),
                &["pass owner/repo or owner/repo@ref"]
            ))),
        }
    }
}

impl Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)?;
        if let Some(git_ref) = &self.git_ref {
            write!(f, "@{git_ref}")?;
        }
        Ok(())
    }
}

/// A single relevant file from a repository snapshot.
#[derive(Clone, Debug)]
pub(crate) struct SourceFile {
    /// The file's path, relative to the repository root.
    pub(crate) path: Utf8PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) contents: String,
}

impl SourceFile {
    /// Returns a [`SourceFile`] for `path`, or `None` if the path
    /// isn't a Dockerfile or pipeline definition.
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, contents: impl Into<String>) -> Option<Self> {
        let path = path.into();
        let kind = FileKind::from_path(&path)?;

        Some(Self {
            path,
            kind,
            contents: contents.into(),
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum SourceError {
    /// An I/O error occurred while reading the directory.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    /// The directory walk itself failed.
    #[error("couldn't walk directory")]
    Walk(#[from] ignore::Error),
    /// A walked path isn't valid UTF-8.
    #[error("invalid (non-UTF-8) path")]
    InvalidPath(#[from] camino::FromPathError),
    /// The directory has no final component to name the repository by.
    #[error("can't name a repository after `{0}`")]
    Unnamed(Utf8PathBuf),
}

/// A snapshot of one repository's relevant files.
#[derive(Clone, Debug)]
pub(crate) struct RepositorySource {
    /// The repository's name, as shown in reports.
    pub(crate) name: String,
    /// The branch (or other Git ref) the snapshot was taken from, if known.
    pub(crate) git_ref: Option<String>,
    pub(crate) files: Vec<SourceFile>,
}

impl RepositorySource {
    /// Collects a repository snapshot from a local directory.
    ///
    /// `.gitignore` files are honored even without a `.git/` directory,
    /// and files are visited in file name order. Files that aren't
    /// valid UTF-8 are skipped.
    #[tracing::instrument(skip_all, fields(dir = %dir))]
    pub(crate) fn from_dir(dir: &Utf8Path) -> Result<Self, SourceError> {
        let canonical = dir.canonicalize_utf8()?;
        let name = canonical
            .file_name()
            .ok_or_else(|| SourceError::Unnamed(canonical.clone()))?
            .to_string();

        let mut walker = WalkBuilder::new(dir);
        walker
            .standard_filters(false)
            .require_git(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .filter_entry(|entry| entry.file_name() != OsStr::new(".git"))
            .sort_by_file_name(|a, b| a.cmp(b));

        let mut files = vec![];
        for entry in walker.build() {
            let entry = entry?;
            let path = <&Utf8Path>::try_from(entry.path())?;

            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(dir).unwrap_or(path);
            let Some(kind) = FileKind::from_path(relative) else {
                continue;
            };

            match std::fs::read_to_string(path) {
                Ok(contents) => files.push(SourceFile {
                    path: relative.to_owned(),
                    kind,
                    contents,
                }),
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    tracing::warn!("skipping {path}: not valid UTF-8");
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!("collected {len} files from {name}", len = files.len());

        Ok(Self {
            name,
            git_ref: None,
            files,
        })
    }

    /// Builds a repository snapshot from files retrieved from GitHub.
    pub(crate) fn remote(slug: &RepoSlug, files: Vec<SourceFile>) -> Self {
        Self {
            name: format!("{}/{}", slug.owner, slug.repo),
            git_ref: slug.git_ref.clone(),
            files,
        }
    }
}
