//! End-to-end integration tests.

use anyhow::Result;

use crate::common::{OutputMode, imagewarden, input_under_test, output_dir, report};

fn repos() -> [String; 3] {
    ["alpha", "beta", "gamma"].map(|repo| input_under_test(&format!("repos/{repo}")))
}

#[test]
fn test_reports() -> Result<()> {
    let dir = output_dir("reports");
    let [alpha, beta, gamma] = repos();

    imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&dir)
        .input(alpha)
        .input(beta)
        .input(gamma)
        .run()?;

    insta::assert_snapshot!(report(&dir, "compliant_images.csv"), @r"
    Repository,Branch,Image,Version,File
    alpha,,docker.io/library/nginx,1.21,Dockerfile
    alpha,,docker.io/library/python,3.12-slim,docker/Dockerfile.worker
    beta,,docker.io/library/nginx,1.21,Dockerfile
    gamma,,ghcr.io/acme/base,2024.1,Dockerfile
    ");

    insta::assert_snapshot!(report(&dir, "non_compliant_images.csv"), @r"
    Repository,Branch,Image,Version,File
    gamma,,docker.io/library/golang,1.22,Dockerfile
    ");

    insta::assert_snapshot!(report(&dir, "build_pipeline_images.csv"), @r"
    Repository,Branch,Image,Version,File
    alpha,,docker.io/library/nginx,1.19,.github/workflows/ci.yml
    beta,,docker.io/library/postgres,15,docker-compose.yml
    ");

    Ok(())
}

#[test]
fn test_plain_summary() -> Result<()> {
    let [alpha, beta, gamma] = repos();

    insta::assert_snapshot!(
        imagewarden()
            .config(input_under_test("policy.yml"))
            .output_dir(&output_dir("plain_summary"))
            .input(alpha)
            .input(beta)
            .input(gamma)
            .run()?,
        @r"
    Scanned 3 repositories, 6 unique images
    4 compliant, 1 non-compliant, 2 non-compliant in build pipelines

    Compliant images:
      docker.io/library/nginx:1.21: 2 (50.0%)
      docker.io/library/python:3.12-slim: 1 (25.0%)
      ghcr.io/acme/base:2024.1: 1 (25.0%)

    Non-compliant images in build pipelines:
      docker.io/library/nginx:1.19: 1 (50.0%)
      docker.io/library/postgres:15: 1 (50.0%)

    Diagnostics: 1 unresolved
    "
    );

    Ok(())
}

#[test]
fn test_json_summary() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("json_summary"))
        .args(["--format", "json"])
        .input(input_under_test("repos/beta"))
        .run()?;

    let summary: serde_json::Value = serde_json::from_str(&output)?;
    assert_eq!(summary["total_repositories_scanned"], 1);
    assert_eq!(summary["total_unique_images"], 2);
    assert_eq!(summary["compliant_count"], 1);
    assert_eq!(summary["non_compliant_count"], 0);
    assert_eq!(summary["pipeline_non_compliant_count"], 1);
    assert_eq!(summary["diagnostics"]["unresolved"], 1);
    assert_eq!(
        summary["pipeline_images"][0]["image"],
        "docker.io/library/postgres:15"
    );

    Ok(())
}

/// Unresolvable references are surfaced as warnings, not dropped.
#[test]
fn test_unresolved_warning() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("unresolved_warning"))
        .input(input_under_test("repos/beta"))
        .output(OutputMode::Stderr)
        .run()?;

    assert!(
        output.contains("beta: Dockerfile:2: unresolved:$BASE_IMAGE"),
        "{output}"
    );

    Ok(())
}

/// A repository with no references still counts as scanned, and still
/// gets (header-only) reports.
#[test]
fn test_no_references() -> Result<()> {
    let dir = output_dir("no_references");

    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&dir)
        .input(input_under_test("config-scenarios/config-in-root"))
        .run()?;

    insta::assert_snapshot!(output, @r"
    Scanned 1 repository, 0 unique images
    No image references found.
    ");

    for name in [
        "compliant_images.csv",
        "non_compliant_images.csv",
        "build_pipeline_images.csv",
    ] {
        assert_eq!(report(&dir, name), "Repository,Branch,Image,Version,File\n");
    }

    Ok(())
}

/// Auditing the same repository twice doesn't duplicate any rows.
#[test]
fn test_repeat_input_is_deduplicated() -> Result<()> {
    let dir = output_dir("repeat_input");
    let gamma = input_under_test("repos/gamma");

    imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&dir)
        .input(gamma.clone())
        .input(gamma)
        .run()?;

    insta::assert_snapshot!(report(&dir, "compliant_images.csv"), @r"
    Repository,Branch,Image,Version,File
    gamma,,ghcr.io/acme/base,2024.1,Dockerfile
    ");

    Ok(())
}

#[test]
fn test_remote_input_requires_token() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("remote_requires_token"))
        .input("acme/api")
        .expects_failure(true)
        .run()?;

    assert!(
        output.contains("can't audit @@INPUT@@ without a GitHub token"),
        "{output}"
    );

    Ok(())
}

#[test]
fn test_invalid_input() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("invalid_input"))
        .input("not/a/repo")
        .expects_failure(true)
        .run()?;

    assert!(
        output.contains("@@INPUT@@ is neither a directory nor a GitHub repository"),
        "{output}"
    );

    Ok(())
}

#[test]
fn test_no_inputs() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("no_inputs"))
        .expects_failure(true)
        .run()?;

    assert!(output.contains("no inputs to audit"), "{output}");

    Ok(())
}

#[cfg_attr(not(feature = "gh-token-tests"), ignore)]
#[test]
fn test_remote_repository() -> Result<()> {
    let dir = output_dir("remote_repository");

    imagewarden()
        .config(input_under_test("policy.yml"))
        .output_dir(&dir)
        .gh_token(true)
        .args(["--top-contributors"])
        .input("docker-library/hello-world@master")
        .run()?;

    let report = report(&dir, "non_compliant_images.csv");
    assert!(report.starts_with("Repository,Branch,Image,Version,File,Top Contributors\n"));

    Ok(())
}
