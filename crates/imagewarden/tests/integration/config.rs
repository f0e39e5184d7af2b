//! Configuration discovery and loading tests.

use anyhow::Result;

use crate::common::{imagewarden, input_under_test, output_dir};

/// Ensures we discover `imagewarden.yml` in the working directory,
/// and pick up its `org`.
#[test]
fn test_discovers_config_in_root() -> Result<()> {
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/config-in-root"))
        .output_dir(&output_dir("discovers_config_in_root"))
        .expects_failure(true)
        .run()?;

    assert!(output.contains("no audit was performed"), "{output}");
    assert!(
        output.contains("can't audit organization root-org without a GitHub token"),
        "{output}"
    );

    Ok(())
}

/// Ensures we discover `.github/imagewarden.yml` in the working directory.
#[test]
fn test_discovers_config_in_dotgithub() -> Result<()> {
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/config-in-dotgithub"))
        .output_dir(&output_dir("discovers_config_in_dotgithub"))
        .expects_failure(true)
        .run()?;

    assert!(
        output.contains("can't audit organization dotgithub-org without a GitHub token"),
        "{output}"
    );

    Ok(())
}

/// Ensures `--org` takes precedence over the configured `org`.
#[test]
fn test_org_flag_overrides_config() -> Result<()> {
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/config-in-root"))
        .output_dir(&output_dir("org_flag_overrides_config"))
        .args(["--org", "flag-org"])
        .expects_failure(true)
        .run()?;

    assert!(output.contains("organization flag-org"), "{output}");
    assert!(!output.contains("root-org"), "{output}");

    Ok(())
}

/// Ensures a run without any configuration fails before auditing anything.
#[test]
fn test_missing_config() -> Result<()> {
    let dir = output_dir("missing_config");
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/no-config"))
        .output_dir(&dir)
        .input(input_under_test("config-scenarios/no-config"))
        .expects_failure(true)
        .run()?;

    assert!(output.contains("failed to load config"), "{output}");
    assert!(output.contains("no configuration file found"), "{output}");
    assert!(!dir.exists());

    Ok(())
}

/// Ensures an explicit `--config` is used instead of discovery.
#[test]
fn test_explicit_config() -> Result<()> {
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/no-config"))
        .config(input_under_test("policy.yml"))
        .output_dir(&output_dir("explicit_config"))
        .input(input_under_test("config-scenarios/no-config"))
        .run()?;

    insta::assert_snapshot!(output, @r"
    Scanned 1 repository, 1 unique image
    1 compliant, 0 non-compliant, 0 non-compliant in build pipelines

    Compliant images:
      docker.io/library/nginx:1.21: 1 (100.0%)
    ");

    Ok(())
}

/// Ensures `IMAGEWARDEN_CONFIG` works like `--config`.
#[test]
fn test_config_from_env() -> Result<()> {
    let output = imagewarden()
        .working_dir(input_under_test("config-scenarios/no-config"))
        .setenv("IMAGEWARDEN_CONFIG", &input_under_test("policy.yml"))
        .output_dir(&output_dir("config_from_env"))
        .input(input_under_test("config-scenarios/no-config"))
        .run()?;

    assert!(output.starts_with("Scanned 1 repository"), "{output}");

    Ok(())
}

/// Ensures an invalid policy is reported with its cause.
#[test]
fn test_invalid_policy() -> Result<()> {
    let output = imagewarden()
        .config(input_under_test(
            "config-scenarios/invalid-policy/imagewarden.yml",
        ))
        .output_dir(&output_dir("invalid_policy"))
        .input(input_under_test("repos/gamma"))
        .expects_failure(true)
        .run()?;

    assert!(output.contains("configuration error in @@CONFIG@@"), "{output}");
    assert!(
        output.contains("versions for `nginx` must be strings, but found a number"),
        "{output}"
    );

    Ok(())
}
