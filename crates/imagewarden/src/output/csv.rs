//! CSV reports, one per result set.

use std::io::Write;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::classify::{Classification, Classifications, ResultSet};

/// Top contributors per repository, for the non-compliant reports.
pub(crate) type Contributors = IndexMap<String, Vec<String>>;

const REPORTS: &[(Classification, &str)] = &[
    (Classification::Compliant, "compliant_images.csv"),
    (Classification::NonCompliant, "non_compliant_images.csv"),
    (Classification::NonCompliantInPipeline, "build_pipeline_images.csv"),
];

/// Writes all three reports into `dir`, creating it if needed.
/// Returns the paths written.
pub(crate) fn write_reports(
    dir: &Utf8Path,
    results: &Classifications,
    contributors: Option<&Contributors>,
) -> Result<Vec<Utf8PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("couldn't create {dir}"))?;

    let mut written = vec![];
    for (classification, name) in REPORTS {
        let path = dir.join(name);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("couldn't create report {path}"))?;

        // Compliant rows don't need anyone to act on them.
        let contributors = match classification {
            Classification::Compliant => None,
            _ => contributors,
        };

        write_report(file, results, results.set(*classification), contributors)
            .with_context(|| format!("couldn't write report {path}"))?;
        written.push(path);
    }

    Ok(written)
}

fn write_report<W: Write>(
    writer: W,
    results: &Classifications,
    set: &ResultSet,
    contributors: Option<&Contributors>,
) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = vec!["Repository", "Branch", "Image", "Version", "File"];
    if contributors.is_some() {
        header.push("Top Contributors");
    }
    writer.write_record(&header)?;

    for result in set.iter() {
        let repository = result.source_repository.as_str();
        let image = result.normalized_image.identity().to_string();
        let mut record = vec![
            repository.to_string(),
            results.git_ref(repository).unwrap_or_default().to_string(),
            image,
            result.normalized_image.version().to_string(),
            result.source_file_path.to_string(),
        ];

        if let Some(contributors) = contributors {
            record.push(
                contributors
                    .get(repository)
                    .map(|names| names.join(", "))
                    .unwrap_or_default(),
            );
        }

        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use image_refs::NormalizedImage;

    use super::{Contributors, write_report};
    use crate::classify::{Classification, ClassificationResult, Classifications};

    fn results() -> Classifications {
        let mut results = Classifications::default();
        results.scanned("acme/api", Some("main"));
        results.scanned("web", None);

        for (compliant, repository, image, file) in [
            (false, "acme/api", "nginx:1.19", "Dockerfile"),
            (false, "web", "ghcr.io/acme/base@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef", "docker/Dockerfile"),
            (true, "web", "python:3.12", "Dockerfile"),
        ] {
            results.add(ClassificationResult {
                classification: Classification::new(compliant, false),
                source_repository: repository.into(),
                normalized_image: NormalizedImage::parse(image).unwrap(),
                source_file_path: file.into(),
                raw_text: image.into(),
            });
        }

        results
    }

    fn render(contributors: Option<&Contributors>, classification: Classification) -> String {
        let results = results();
        let mut buf = vec![];
        write_report(&mut buf, &results, results.set(classification), contributors).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_report() {
        insta::assert_snapshot!(render(None, Classification::NonCompliant), @r"
        Repository,Branch,Image,Version,File
        acme/api,main,docker.io/library/nginx,1.19,Dockerfile
        web,,ghcr.io/acme/base,sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef,docker/Dockerfile
        ");
    }

    #[test]
    fn test_report_with_contributors() {
        let contributors = Contributors::from([(
            "acme/api".to_string(),
            vec!["alice".to_string(), "bob".to_string()],
        )]);

        insta::assert_snapshot!(render(Some(&contributors), Classification::NonCompliant), @r#"
        Repository,Branch,Image,Version,File,Top Contributors
        acme/api,main,docker.io/library/nginx,1.19,Dockerfile,"alice, bob"
        web,,ghcr.io/acme/base,sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef,docker/Dockerfile,
        "#);
    }

    #[test]
    fn test_empty_report() {
        let results = Classifications::default();
        let mut buf = vec![];
        write_report(&mut buf, &results, &results.pipeline_non_compliant, None).unwrap();

        assert_eq!(String::from_utf8(buf).unwrap(), "Repository,Branch,Image,Version,File\n");
    }
}
