use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;
use std::{env::current_dir, sync::LazyLock};

use assert_cmd::{Command, cargo};

static TEST_PREFIX: LazyLock<Utf8PathBuf> = LazyLock::new(|| {
    let current_dir = current_dir().expect("Cannot figure out current directory");

    let file_path = current_dir
        .join("tests")
        .join("integration")
        .join("test-data");

    if !file_path.exists() {
        panic!("Cannot find test data directory: {}", file_path.display());
    }

    Utf8PathBuf::try_from(file_path).expect("Cannot create UTF-8 path from test data directory")
});

pub fn input_under_test(name: &str) -> String {
    let file_path = TEST_PREFIX.join(name);

    if !file_path.exists() {
        panic!("Cannot find input under test: {file_path}");
    }

    file_path.to_string()
}

/// A fresh, empty directory for a test's reports.
pub fn output_dir(test: &str) -> Utf8PathBuf {
    let dir = Utf8PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(test);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).expect("Cannot clear output directory");
    }
    dir
}

/// Reads a report written by a run into `dir`.
pub fn report(dir: &Utf8PathBuf, name: &str) -> String {
    std::fs::read_to_string(dir.join(name))
        .unwrap_or_else(|err| panic!("Cannot read report {name}: {err}"))
}

pub enum OutputMode {
    Stdout,
    Stderr,
    #[allow(dead_code, reason = "currently not used by any integration test")]
    Both,
}

pub struct Imagewarden {
    cmd: Command,
    gh_token: bool,
    inputs: Vec<String>,
    config: Option<String>,
    output_dir: Option<Utf8PathBuf>,
    output: OutputMode,
    expects_failure: bool,
}

impl Imagewarden {
    /// Create a new imagewarden runner.
    pub fn new() -> Self {
        let mut cmd = Command::new(cargo::cargo_bin!());

        // Start from a clean environment, so that things like `GH_TOKEN`
        // and `IMAGEWARDEN_ORG` only reach the run when a test asks.
        cmd.env_clear();

        Self {
            cmd,
            gh_token: false,
            inputs: vec![],
            config: None,
            output_dir: None,
            output: OutputMode::Stdout,
            expects_failure: false,
        }
    }

    pub fn args<'a>(mut self, args: impl IntoIterator<Item = &'a str>) -> Self {
        self.cmd.args(args);
        self
    }

    pub fn setenv(mut self, key: &str, value: &str) -> Self {
        self.cmd.env(key, value);
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn output_dir(mut self, dir: &Utf8PathBuf) -> Self {
        self.output_dir = Some(dir.clone());
        self
    }

    pub fn gh_token(mut self, flag: bool) -> Self {
        self.gh_token = flag;
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn expects_failure(mut self, flag: bool) -> Self {
        if flag {
            self = self.output(OutputMode::Stderr);
        }
        self.expects_failure = flag;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.cmd.current_dir(dir.into());
        self
    }

    pub fn run(mut self) -> Result<String> {
        if self.gh_token {
            // Pre-assert the presence of GH_TOKEN to make configuration
            // failures more obvious.
            let token =
                std::env::var("GH_TOKEN").context("online tests require GH_TOKEN to be set")?;
            self.cmd.env("GH_TOKEN", token);
        }

        if let Some(config) = &self.config {
            self.cmd.arg("--config").arg(config);
        }

        if let Some(dir) = &self.output_dir {
            self.cmd.arg("--output-dir").arg(dir);
        }

        // Progress bars need a terminal, which test runs don't have.
        self.cmd.arg("--no-progress");

        for input in &self.inputs {
            self.cmd.arg(input);
        }

        let output = self.cmd.output()?;

        let mut raw = String::from_utf8(match self.output {
            OutputMode::Stdout => output.stdout,
            OutputMode::Stderr => output.stderr,
            OutputMode::Both => [output.stderr, output.stdout].concat(),
        })?;

        if let Some(exit_code) = output.status.code() {
            // 1/2 are general errors, 101 is Rust's panic exit code.
            let is_failure = matches!(exit_code, 1 | 2 | 101);
            if is_failure != self.expects_failure {
                anyhow::bail!("imagewarden exited with unexpected code {exit_code}: {raw}");
            }
        }

        let config_placeholder = "@@CONFIG@@";
        if let Some(config) = &self.config {
            raw = raw.replace(config, config_placeholder);
        }

        if let Some(dir) = &self.output_dir {
            raw = raw.replace(dir.as_str(), "@@OUTPUT@@");
        }

        let input_placeholder = "@@INPUT@@";
        for input in &self.inputs {
            raw = raw.replace(input, input_placeholder);
        }

        // Fallback: replace any lingering absolute paths.
        raw = raw.replace(TEST_PREFIX.as_str(), "@@TEST_PREFIX@@");

        raw = raw.replace(env!("CARGO_PKG_VERSION"), "@@VERSION@@");

        Ok(raw)
    }
}

pub fn imagewarden() -> Imagewarden {
    Imagewarden::new()
}
