//! Image reference extraction.
//!
//! Extraction is purely textual: each file kind has a scanner that finds
//! the places an image can be named and yields the text found there.
//! Recognizing that text as an image (or not) happens afterwards, in
//! [`ImageReference::recognize`].

use camino::Utf8PathBuf;
use image_refs::{NormalizedImage, ReferenceError};
use indexmap::{IndexMap, map::Entry};

use crate::source::{FileKind, SourceFile};

mod dockerfile;
mod pipeline;

/// A single place in a file where a scanner found an image reference.
#[derive(Clone, Debug, PartialEq)]
struct Occurrence {
    /// The reference exactly as written.
    raw: String,
    /// The literal reference after variable substitution, or `None`
    /// if it depends on something we can't resolve.
    resolved: Option<String>,
    /// The 1-based line the reference starts on.
    line: usize,
}

impl Occurrence {
    /// An occurrence whose text is used verbatim. Anything that still
    /// looks like a variable leaves it unresolved.
    fn literal(raw: &str, line: usize) -> Self {
        Self {
            raw: raw.into(),
            resolved: (!raw.contains('$')).then(|| raw.into()),
            line,
        }
    }
}

/// An image reference found in a repository file.
#[derive(Clone, Debug)]
pub(crate) struct ImageReference {
    pub(crate) raw_text: String,
    resolved: Option<String>,
    pub(crate) source_repository: String,
    pub(crate) source_file_path: Utf8PathBuf,
    pub(crate) is_pipeline_file: bool,
    /// Every line this reference appears on, in file order.
    pub(crate) lines: Vec<usize>,
}

/// What an extracted reference turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Recognition {
    /// A concrete image.
    Recognized(NormalizedImage),
    /// A reference built from variables we can't resolve; carries the raw text.
    Unresolved(String),
    /// Syntactically in image position, but not an image (e.g. `scratch`).
    NotAnImage,
}

impl ImageReference {
    pub(crate) fn recognize(&self) -> Result<Recognition, ReferenceError> {
        let Some(text) = self.resolved.as_deref() else {
            return Ok(Recognition::Unresolved(self.raw_text.clone()));
        };

        if text.trim().eq_ignore_ascii_case("scratch") {
            return Ok(Recognition::NotAnImage);
        }

        NormalizedImage::parse(text).map(Recognition::Recognized)
    }

    pub(crate) fn line(&self) -> Option<usize> {
        self.lines.first().copied()
    }
}

/// Extracts every distinct image reference from `file`.
///
/// A reference written the same way several times in one file is
/// reported once, with all of its lines. Never fails: content with
/// nothing recognizable yields nothing.
pub(crate) fn extract(repository: &str, file: &SourceFile) -> Vec<ImageReference> {
    let occurrences = match file.kind {
        FileKind::Dockerfile => dockerfile::extract(&file.contents),
        FileKind::Pipeline => {
            pipeline::extract(&file.contents, pipeline::Dialect::from_path(&file.path))
        }
    };

    let mut references: IndexMap<String, ImageReference> = IndexMap::new();
    for occurrence in occurrences {
        match references.entry(occurrence.raw.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().lines.push(occurrence.line),
            Entry::Vacant(entry) => {
                entry.insert(ImageReference {
                    raw_text: occurrence.raw,
                    resolved: occurrence.resolved,
                    source_repository: repository.into(),
                    source_file_path: file.path.clone(),
                    is_pipeline_file: file.kind.is_pipeline(),
                    lines: vec![occurrence.line],
                });
            }
        }
    }

    references
        .into_values()
        .map(|mut reference| {
            reference.lines.sort_unstable();
            reference
        })
        .collect()
}

/// Strips one layer of matching quotes from `value`.
fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    value
}
