//! Classification of recognized images into report buckets.

use camino::Utf8PathBuf;
use image_refs::NormalizedImage;
use indexmap::{IndexMap, map::Entry};

use crate::extract::ImageReference;

/// The report bucket a classified image lands in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Classification {
    Compliant,
    NonCompliant,
    /// Non-compliant, and found in a pipeline definition. Takes
    /// precedence over [`Classification::NonCompliant`].
    NonCompliantInPipeline,
}

impl Classification {
    pub(crate) fn new(compliant: bool, is_pipeline_file: bool) -> Self {
        match (compliant, is_pipeline_file) {
            (true, _) => Self::Compliant,
            (false, false) => Self::NonCompliant,
            (false, true) => Self::NonCompliantInPipeline,
        }
    }
}

/// The identity of a row in a [`ResultSet`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ResultKey {
    repository: String,
    image: NormalizedImage,
    file: Utf8PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClassificationResult {
    pub(crate) classification: Classification,
    pub(crate) source_repository: String,
    pub(crate) normalized_image: NormalizedImage,
    pub(crate) source_file_path: Utf8PathBuf,
    pub(crate) raw_text: String,
}

impl ClassificationResult {
    pub(crate) fn key(&self) -> ResultKey {
        ResultKey {
            repository: self.source_repository.clone(),
            image: self.normalized_image.clone(),
            file: self.source_file_path.clone(),
        }
    }
}

/// Classifies a recognized reference, given the policy's verdict on it.
pub(crate) fn classify(
    reference: &ImageReference,
    normalized: NormalizedImage,
    compliant: bool,
) -> ClassificationResult {
    ClassificationResult {
        classification: Classification::new(compliant, reference.is_pipeline_file),
        source_repository: reference.source_repository.clone(),
        normalized_image: normalized,
        source_file_path: reference.source_file_path.clone(),
        raw_text: reference.raw_text.clone(),
    }
}

/// A deduplicated, insertion-ordered collection of results.
#[derive(Clone, Debug, Default)]
pub(crate) struct ResultSet {
    results: IndexMap<ResultKey, ClassificationResult>,
}

impl ResultSet {
    /// Adds `result`, returning `false` (and leaving the set unchanged)
    /// if a result with the same key is already present.
    pub(crate) fn add(&mut self, result: ClassificationResult) -> bool {
        match self.results.entry(result.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(result);
                true
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.results.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ClassificationResult> {
        self.results.values()
    }
}

/// Every classification made during a run, partitioned into the
/// three report buckets, plus the repositories that were scanned.
#[derive(Debug, Default)]
pub(crate) struct Classifications {
    pub(crate) compliant: ResultSet,
    pub(crate) non_compliant: ResultSet,
    pub(crate) pipeline_non_compliant: ResultSet,
    /// Scanned repositories and the Git ref each was scanned at.
    repositories: IndexMap<String, Option<String>>,
}

impl Classifications {
    /// Records that `repository` was scanned, even if it yields no results.
    pub(crate) fn scanned(&mut self, repository: &str, git_ref: Option<&str>) {
        self.repositories
            .insert(repository.into(), git_ref.map(Into::into));
    }

    /// Adds `result` to the set for its classification.
    pub(crate) fn add(&mut self, result: ClassificationResult) -> bool {
        self.set_mut(result.classification).add(result)
    }

    pub(crate) fn set(&self, classification: Classification) -> &ResultSet {
        match classification {
            Classification::Compliant => &self.compliant,
            Classification::NonCompliant => &self.non_compliant,
            Classification::NonCompliantInPipeline => &self.pipeline_non_compliant,
        }
    }

    fn set_mut(&mut self, classification: Classification) -> &mut ResultSet {
        match classification {
            Classification::Compliant => &mut self.compliant,
            Classification::NonCompliant => &mut self.non_compliant,
            Classification::NonCompliantInPipeline => &mut self.pipeline_non_compliant,
        }
    }

    pub(crate) fn repositories(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    /// The Git ref `repository` was scanned at, if known.
    pub(crate) fn git_ref(&self, repository: &str) -> Option<&str> {
        self.repositories.get(repository)?.as_deref()
    }

    /// Returns `true` if `repository` has any non-compliant results.
    pub(crate) fn has_non_compliant(&self, repository: &str) -> bool {
        self.non_compliant
            .iter()
            .chain(self.pipeline_non_compliant.iter())
            .any(|result| result.source_repository == repository)
    }
}

#[cfg(test)]
mod tests {
    use image_refs::NormalizedImage;

    use super::{Classification, ClassificationResult, Classifications, ResultSet};

    fn result(
        classification: Classification,
        repository: &str,
        image: &str,
        file: &str,
    ) -> ClassificationResult {
        ClassificationResult {
            classification,
            source_repository: repository.into(),
            normalized_image: NormalizedImage::parse(image).unwrap(),
            source_file_path: file.into(),
            raw_text: image.into(),
        }
    }

    #[test]
    fn test_decision_table() {
        for (compliant, pipeline, expected) in [
            (true, false, Classification::Compliant),
            (true, true, Classification::Compliant),
            (false, false, Classification::NonCompliant),
            (false, true, Classification::NonCompliantInPipeline),
        ] {
            assert_eq!(Classification::new(compliant, pipeline), expected);
        }
    }

    #[test]
    fn test_result_set_dedup() {
        let mut set = ResultSet::default();

        assert!(set.add(result(Classification::Compliant, "a", "nginx:1.21", "Dockerfile")));
        // Same image, spelled differently.
        assert!(!set.add(result(
            Classification::Compliant,
            "a",
            "docker.io/library/nginx:1.21",
            "Dockerfile"
        )));
        assert_eq!(set.len(), 1);

        // Differs by repository, file, or version.
        assert!(set.add(result(Classification::Compliant, "b", "nginx:1.21", "Dockerfile")));
        assert!(set.add(result(Classification::Compliant, "a", "nginx:1.21", "web/Dockerfile")));
        assert!(set.add(result(Classification::Compliant, "a", "nginx:1.22", "Dockerfile")));
        assert_eq!(set.len(), 4);

        let order = set
            .iter()
            .map(|r| (r.source_repository.as_str(), r.source_file_path.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            [
                ("a", "Dockerfile"),
                ("b", "Dockerfile"),
                ("a", "web/Dockerfile"),
                ("a", "Dockerfile")
            ]
        );
    }

    #[test]
    fn test_partition() {
        let mut results = Classifications::default();
        results.scanned("a", Some("main"));
        results.scanned("b", None);

        let compliant = result(Classification::Compliant, "a", "nginx:1.21", "Dockerfile");
        let plain = result(Classification::NonCompliant, "a", "redis", "Dockerfile");
        let pipeline = result(
            Classification::NonCompliantInPipeline,
            "a",
            "redis",
            ".gitlab-ci.yml",
        );

        assert!(results.add(compliant.clone()));
        assert!(results.add(plain.clone()));
        assert!(results.add(pipeline.clone()));
        assert!(!results.add(pipeline.clone()));

        assert_eq!(results.compliant.len(), 1);
        assert_eq!(results.non_compliant.len(), 1);
        assert_eq!(results.pipeline_non_compliant.len(), 1);
        assert_eq!(
            results.set(Classification::Compliant).iter().next(),
            Some(&compliant)
        );
        assert!(results.non_compliant.iter().all(|r| r.key() != pipeline.key()));

        assert_eq!(results.repositories().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(results.git_ref("a"), Some("main"));
        assert_eq!(results.git_ref("b"), None);
        assert_eq!(results.git_ref("c"), None);
        assert!(results.has_non_compliant("a"));
        assert!(!results.has_non_compliant("b"));
    }
}
