//! Summary statistics over a run's finalized results.

use std::collections::HashSet;

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde::Serialize;

use crate::{
    audit::Diagnostic,
    classify::{Classifications, ResultSet},
};

#[derive(Debug, Default, PartialEq, Serialize)]
pub(crate) struct DiagnosticCounts {
    pub(crate) unresolved: usize,
    pub(crate) unparseable: usize,
    pub(crate) skipped_repositories: usize,
}

/// How often a single image appears in one result set.
#[derive(Debug, PartialEq, Serialize)]
pub(crate) struct ImageCount {
    pub(crate) image: String,
    pub(crate) count: usize,
    /// The share of the set's rows, in percent.
    pub(crate) percentage: f64,
}

#[derive(Debug, PartialEq, Serialize)]
pub(crate) struct Summary {
    pub(crate) total_repositories_scanned: usize,
    pub(crate) total_unique_images: usize,
    pub(crate) compliant_count: usize,
    pub(crate) non_compliant_count: usize,
    pub(crate) pipeline_non_compliant_count: usize,
    pub(crate) compliant_images: Vec<ImageCount>,
    pub(crate) pipeline_images: Vec<ImageCount>,
    pub(crate) diagnostics: DiagnosticCounts,
}

impl Summary {
    /// The number of rows across all three reports.
    pub(crate) fn total_rows(&self) -> usize {
        self.compliant_count + self.non_compliant_count + self.pipeline_non_compliant_count
    }
}

/// Reduces finalized results to their summary.
pub(crate) fn summarize(results: &Classifications, diagnostics: &[Diagnostic]) -> Summary {
    let unique_images = results
        .compliant
        .iter()
        .chain(results.non_compliant.iter())
        .chain(results.pipeline_non_compliant.iter())
        .map(|result| &result.normalized_image)
        .collect::<HashSet<_>>();

    let mut counts = DiagnosticCounts::default();
    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Unresolved { .. } => counts.unresolved += 1,
            Diagnostic::Unparseable { .. } => counts.unparseable += 1,
            Diagnostic::SkippedRepository { .. } => counts.skipped_repositories += 1,
        }
    }

    Summary {
        total_repositories_scanned: results.repositories().count(),
        total_unique_images: unique_images.len(),
        compliant_count: results.compliant.len(),
        non_compliant_count: results.non_compliant.len(),
        pipeline_non_compliant_count: results.pipeline_non_compliant.len(),
        compliant_images: breakdown(&results.compliant),
        pipeline_images: breakdown(&results.pipeline_non_compliant),
        diagnostics: counts,
    }
}

/// Counts rows per image, most frequent first.
fn breakdown(set: &ResultSet) -> Vec<ImageCount> {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for result in set.iter() {
        *counts.entry(result.normalized_image.to_string()).or_default() += 1;
    }

    let total = set.len() as f64;
    counts
        .into_iter()
        .sorted_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)))
        .map(|(image, count)| ImageCount {
            image,
            count,
            percentage: count as f64 * 100.0 / total,
        })
        .collect()
}
