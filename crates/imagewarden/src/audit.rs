//! The audit driver: extraction, normalization, policy matching and
//! classification for each repository in turn.

use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    classify::{Classifications, classify},
    config::Config,
    extract::{ImageReference, Recognition, extract},
    source::RepositorySource,
    summary::{Summary, summarize},
};

/// Something the run couldn't classify, surfaced instead of dropped.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Diagnostic {
    /// A reference built from variables that can't be resolved.
    Unresolved {
        repository: String,
        file: Utf8PathBuf,
        line: Option<usize>,
        raw: String,
    },
    /// A reference that isn't a valid image reference.
    Unparseable {
        repository: String,
        file: Utf8PathBuf,
        line: Option<usize>,
        raw: String,
        reason: String,
    },
    /// A repository that couldn't be retrieved or read.
    SkippedRepository { repository: String, reason: String },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved {
                repository,
                file,
                line,
                raw,
            } => {
                write_location(f, repository, file, *line)?;
                write!(f, ": unresolved:{raw}")
            }
            Self::Unparseable {
                repository,
                file,
                line,
                raw,
                reason,
            } => {
                write_location(f, repository, file, *line)?;
                write!(f, ": unparseable image reference `{raw}`: {reason}")
            }
            Self::SkippedRepository { repository, reason } => {
                write!(f, "{repository}: skipped: {reason}")
            }
        }
    }
}

fn write_location(
    f: &mut std::fmt::Formatter<'_>,
    repository: &str,
    file: &Utf8Path,
    line: Option<usize>,
) -> std::fmt::Result {
    write!(f, "{repository}: {file}")?;
    match line {
        Some(line) => write!(f, ":{line}"),
        None => Ok(()),
    }
}

/// Accumulates classifications and diagnostics across repositories.
pub(crate) struct Auditor<'a> {
    config: &'a Config,
    results: Classifications,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Auditor<'a> {
    pub(crate) fn new(config: &'a Config) -> Self {
        Self {
            config,
            results: Classifications::default(),
            diagnostics: vec![],
        }
    }

    /// Audits every file in `source`.
    #[tracing::instrument(skip_all, fields(repository = %source.name))]
    pub(crate) fn audit_repository(&mut self, source: &RepositorySource) {
        self.results
            .scanned(&source.name, source.git_ref.as_deref());

        for file in &source.files {
            for reference in extract(&source.name, file) {
                self.audit_reference(&reference);
            }
        }
    }

    fn audit_reference(&mut self, reference: &ImageReference) {
        match reference.recognize() {
            Ok(Recognition::Recognized(image)) => {
                if self.config.ignores(&image) {
                    tracing::debug!("ignoring {image} ({})", reference.raw_text);
                    return;
                }

                let compliant = self.config.policy.is_compliant(&image);
                let result = classify(reference, image, compliant);
                tracing::debug!(
                    "{file}: {image} is {classification:?}",
                    file = result.source_file_path,
                    image = result.normalized_image,
                    classification = result.classification,
                );
                self.results.add(result);
            }
            Ok(Recognition::Unresolved(raw)) => self.diagnose(Diagnostic::Unresolved {
                repository: reference.source_repository.clone(),
                file: reference.source_file_path.clone(),
                line: reference.line(),
                raw,
            }),
            Ok(Recognition::NotAnImage) => {
                tracing::debug!("{} is not an image", reference.raw_text);
            }
            Err(err) => self.diagnose(Diagnostic::Unparseable {
                repository: reference.source_repository.clone(),
                file: reference.source_file_path.clone(),
                line: reference.line(),
                raw: reference.raw_text.clone(),
                reason: err.to_string(),
            }),
        }
    }

    /// Records that `repository` couldn't be audited at all.
    pub(crate) fn skip_repository(&mut self, repository: &str, reason: impl Display) {
        self.diagnose(Diagnostic::SkippedRepository {
            repository: repository.into(),
            reason: reason.to_string(),
        });
    }

    fn diagnose(&mut self, diagnostic: Diagnostic) {
        tracing::warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn results(&self) -> &Classifications {
        &self.results
    }

    pub(crate) fn finish(self) -> AuditReport {
        AuditReport {
            results: self.results,
            diagnostics: self.diagnostics,
        }
    }
}

/// The finalized results of a run.
#[derive(Debug)]
pub(crate) struct AuditReport {
    pub(crate) results: Classifications,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl AuditReport {
    pub(crate) fn summary(&self) -> Summary {
        summarize(&self.results, &self.diagnostics)
    }
}
