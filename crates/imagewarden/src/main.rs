#![warn(clippy::all, clippy::dbg_macro)]

use std::{
    io::{Write, stdout},
    process::ExitCode,
};

use annotate_snippets::{Group, Level, Renderer};
use anstream::{eprintln, println, stream::IsTerminal};
use anyhow::{Context as _, Result, anyhow};
use audit::Auditor;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::InfoLevel;
use config::Config;
use etcetera::{AppStrategy as _, AppStrategyArgs, choose_app_strategy};
use github::{Client, GitHubHost, GitHubToken};
use indicatif::ProgressStyle;
use output::csv::Contributors;
use owo_colors::OwoColorize;
use source::{RepoSlug, RepositorySource};
use tracing::{Instrument as _, Span, info_span};
use tracing_indicatif::{IndicatifLayer, span_ext::IndicatifSpanExt};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod audit;
mod classify;
mod config;
mod extract;
mod github;
mod output;
mod policy;
mod source;
mod summary;
mod utils;

/// How many commit authors to list per non-compliant repository.
const TOP_CONTRIBUTORS: usize = 5;

/// Audits the container base images used across repositories against
/// an allow-list of approved images.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// The GitHub organization whose repositories to audit.
    ///
    /// Overrides any `org` in the configuration file.
    #[arg(long, env = "IMAGEWARDEN_ORG")]
    org: Option<String>,

    /// The GitHub API token to use.
    #[arg(long, env, value_parser = GitHubToken::new)]
    gh_token: Option<GitHubToken>,

    /// The GitHub Server Hostname. Defaults to github.com
    #[arg(long, env = "GH_HOST", default_value_t)]
    gh_hostname: GitHubHost,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<InfoLevel>,

    /// Don't show progress bars, even if the terminal supports them.
    #[arg(long)]
    no_progress: bool,

    /// The summary format to emit.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,

    /// Control the use of color in output.
    #[arg(long, value_enum, value_name = "MODE")]
    color: Option<ColorMode>,

    /// The configuration file to load. By default, any config will be
    /// discovered relative to $CWD.
    #[arg(short, long, env = "IMAGEWARDEN_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// The directory to write CSV reports into.
    #[arg(short, long, default_value = ".")]
    output_dir: Utf8PathBuf,

    /// The directory to use for HTTP caching. By default, a
    /// host-appropriate user-caching directory will be used.
    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    /// Audit archived repositories when auditing an organization.
    #[arg(long)]
    include_archived: bool,

    /// List the most frequent commit authors of each remote repository
    /// with non-compliant images in the non-compliant reports.
    #[arg(long)]
    top_contributors: bool,

    /// The inputs to audit.
    ///
    /// These can be local directories or remote GitHub repositories
    /// (`owner/repo[@ref]`).
    inputs: Vec<String>,
}

#[derive(Debug, Default, Copy, Clone, ValueEnum)]
pub(crate) enum OutputFormat {
    /// A human-readable summary.
    #[default]
    Plain,
    /// The summary as JSON.
    Json,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub(crate) enum ColorMode {
    /// Use color output if the output supports it.
    Auto,
    /// Force color output, even if the output isn't a terminal.
    Always,
    /// Disable color output, even if the output is a compatible terminal.
    Never,
}

impl ColorMode {
    /// Returns a concrete (i.e. non-auto) `anstream::ColorChoice` for the given terminal.
    ///
    /// The tracing writer is type-erased, so `anstream` can't detect
    /// whether it's a terminal on its own.
    fn color_choice_for_terminal(&self, io: impl IsTerminal) -> anstream::ColorChoice {
        match self {
            ColorMode::Auto => {
                if io.is_terminal() {
                    anstream::ColorChoice::Always
                } else {
                    anstream::ColorChoice::Never
                }
            }
            ColorMode::Always => anstream::ColorChoice::Always,
            ColorMode::Never => anstream::ColorChoice::Never,
        }
    }
}

impl From<ColorMode> for anstream::ColorChoice {
    fn from(value: ColorMode) -> Self {
        match value {
            ColorMode::Auto => Self::Auto,
            ColorMode::Always => Self::Always,
            ColorMode::Never => Self::Never,
        }
    }
}

pub(crate) fn tips(err: impl AsRef<str>, tips: &[impl AsRef<str>]) -> String {
    let group = Group::with_title(Level::ERROR.primary_title(err.as_ref()))
        .elements(tips.iter().map(|tip| Level::NOTE.message(tip.as_ref())));

    let renderer = Renderer::styled();
    renderer.render(&[group])
}

fn cache_dir(app: &App) -> Result<Utf8PathBuf> {
    if let Some(cache_dir) = &app.cache_dir {
        return Ok(cache_dir.clone());
    }

    let strategy = choose_app_strategy(AppStrategyArgs {
        top_level_domain: "io.github".into(),
        author: "imagewarden".into(),
        app_name: "imagewarden".into(),
    })
    .context("couldn't determine a cache directory")?;

    Utf8PathBuf::from_path_buf(strategy.cache_dir())
        .map_err(|path| anyhow!("cache directory isn't valid UTF-8: {}", path.display()))
}

fn require_client<'a>(client: Option<&'a Client>, what: &str) -> Result<&'a Client> {
    client.ok_or_else(|| {
        anyhow!(tips(
            format!("can't audit {what} without a GitHub token"),
            &[format!(
                "pass {flag} or set {env}",
                flag = "--gh-token".yellow(),
                env = "GH_TOKEN".yellow(),
            )]
        ))
    })
}

/// Returns `true` once the REST API rate limit is exhausted.
///
/// A failed check isn't fatal; the next request will fail on its own
/// if the limit really is exhausted.
async fn rate_limited(client: &Client) -> bool {
    match client.rate_limit().await {
        Ok(limit) if limit.remaining == 0 => {
            tracing::warn!(
                "GitHub API rate limit exhausted (resets {reset}); reporting partial results",
                reset = utils::until(limit.reset),
            );
            true
        }
        Ok(limit) => {
            tracing::debug!("{remaining} API requests remaining", remaining = limit.remaining);
            false
        }
        Err(err) => {
            tracing::warn!("couldn't check the API rate limit: {err}");
            false
        }
    }
}

/// State shared across every repository in a run.
struct Run<'a> {
    auditor: Auditor<'a>,
    client: Option<Client>,
    contributors: Contributors,
    top_contributors: bool,
}

impl Run<'_> {
    fn audit_local(&mut self, dir: &Utf8Path) {
        match RepositorySource::from_dir(dir) {
            Ok(source) => self.auditor.audit_repository(&source),
            Err(err) => self
                .auditor
                .skip_repository(dir.as_str(), format!("{:#}", anyhow::Error::from(err))),
        }
        completed(dir.as_str());
    }

    async fn audit_remote(&mut self, slug: RepoSlug) -> Result<()> {
        let client = require_client(self.client.as_ref(), &slug.to_string())?;
        let name = format!("{}/{}", slug.owner, slug.repo);

        let files = match client.fetch_sources(&slug).await {
            Ok(files) => files,
            Err(err) => {
                self.auditor
                    .skip_repository(&name, format!("{:#}", anyhow::Error::from(err)));
                Span::current().pb_inc(1);
                return Ok(());
            }
        };

        self.auditor
            .audit_repository(&RepositorySource::remote(&slug, files));

        if self.top_contributors && self.auditor.results().has_non_compliant(&name) {
            match client.top_contributors(&slug, TOP_CONTRIBUTORS).await {
                Ok(names) => {
                    self.contributors.insert(name.clone(), names);
                }
                Err(err) => {
                    tracing::warn!("couldn't list contributors for {name}: {err}");
                }
            }
        }

        completed(&name);
        Ok(())
    }

    /// Audits every repository in `org`, a page at a time, stopping early
    /// if the API rate limit runs out.
    async fn audit_org(&mut self, org: &str, include_archived: bool) -> Result<()> {
        let client = require_client(self.client.as_ref(), &format!("organization {org}"))?.clone();

        let mut cursor = None;
        loop {
            let page = client
                .repository_page(org, cursor.as_deref())
                .await
                .map_err(|err| {
                    anyhow!(tips(
                        format!("couldn't list repositories for {org}: {err}"),
                        &["check that the organization exists and your token can read it"]
                    ))
                })?;

            Span::current().pb_inc_length(page.repositories.len() as u64);

            for repository in page.repositories {
                if repository.is_archived && !include_archived {
                    tracing::info!("skipping archived repository {org}/{}", repository.name);
                    Span::current().pb_inc(1);
                    continue;
                }

                let Some(branch) = repository.default_branch() else {
                    tracing::info!("skipping empty repository {org}/{}", repository.name);
                    Span::current().pb_inc(1);
                    continue;
                };

                self.audit_remote(RepoSlug::new(org, &repository.name, Some(branch)))
                    .await?;
            }

            let Some(next) = page.next else {
                break;
            };

            if rate_limited(&client).await {
                break;
            }

            cursor = Some(next);
        }

        Ok(())
    }
}

fn completed(input: &str) {
    Span::current().pb_inc(1);
    tracing::info!(
        "🌈 {completed} {input}",
        completed = "completed".green(),
    );
}

fn run() -> Result<ExitCode> {
    human_panic::setup_panic!();

    let mut app = App::parse();

    let color_mode = match app.color {
        Some(color_mode) => color_mode,
        None => {
            // If `--color` wasn't specified, we first check a handful
            // of common environment variables, and then fall
            // back to `anstream`'s auto detection.
            if std::env::var("NO_COLOR").is_ok() {
                ColorMode::Never
            } else if std::env::var("FORCE_COLOR").is_ok()
                || std::env::var("CLICOLOR_FORCE").is_ok()
            {
                ColorMode::Always
            } else {
                ColorMode::Auto
            }
        }
    };

    anstream::ColorChoice::write_global(color_mode.into());

    // `anstream` strips ANSI escapes when color is disabled, which
    // breaks the line control progress bars need.
    if matches!(color_mode, ColorMode::Never) {
        app.no_progress = true;
    }

    let indicatif_layer = IndicatifLayer::new();

    let writer = std::sync::Mutex::new(anstream::AutoStream::new(
        Box::new(indicatif_layer.get_stderr_writer()) as Box<dyn Write + Send>,
        color_mode.color_choice_for_terminal(std::io::stderr()),
    ));

    let filter = EnvFilter::builder()
        .with_default_directive(app.verbose.tracing_level_filter().into())
        .from_env()?;

    let reg = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(writer),
        )
        .with(filter);

    if app.no_progress {
        reg.init();
    } else {
        reg.with(indicatif_layer).init();
    }

    let config = Config::new(&app).map_err(|e| {
        anyhow!(tips(
            format!("failed to load config: {:#}", anyhow::Error::from(e)),
            &[
                "check your configuration file for errors",
                "pass --config to use a configuration file elsewhere",
            ]
        ))
    })?;

    tracing::info!(
        "loaded a policy with {n} approved images",
        n = config.policy.len()
    );

    let org = app.org.clone().or_else(|| config.org.clone());
    if app.inputs.is_empty() && org.is_none() {
        return Err(anyhow!(tips(
            "no inputs to audit",
            &["pass one or more directories or owner/repo slugs, or an organization with --org"]
        )));
    }

    let client = match &app.gh_token {
        Some(token) => {
            let cache_dir = cache_dir(&app)?;
            tracing::debug!("using {host} with HTTP cache in {cache_dir}", host = app.gh_hostname);
            Some(Client::new(&app.gh_hostname, token, &cache_dir)?)
        }
        None => None,
    };

    let mut run = Run {
        auditor: Auditor::new(&config),
        client,
        contributors: Contributors::new(),
        top_contributors: app.top_contributors,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let span = info_span!("audit");
    span.pb_set_length(app.inputs.len() as u64);
    span.pb_set_style(&ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:!30.cyan/blue} {msg}",
    )?);

    runtime.block_on(
        async {
            for input in &app.inputs {
                Span::current().pb_set_message(input);

                let path = Utf8Path::new(input);
                if path.is_dir() {
                    run.audit_local(path);
                } else {
                    let slug = input.parse::<RepoSlug>().with_context(|| {
                        format!("{input} is neither a directory nor a GitHub repository")
                    })?;
                    run.audit_remote(slug).await?;
                }
            }

            if let Some(org) = &org {
                Span::current().pb_set_message(org);
                run.audit_org(org, app.include_archived).await?;
            }

            anyhow::Ok(())
        }
        .instrument(span),
    )?;

    let report = run.auditor.finish();

    let contributors = app.top_contributors.then_some(&run.contributors);
    for path in output::csv::write_reports(&app.output_dir, &report.results, contributors)? {
        tracing::info!("wrote {path}");
    }

    let summary = report.summary();
    match app.format {
        OutputFormat::Plain => output::plain::render_summary(&summary),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(stdout(), &summary)?;
            println!();
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    // Returning an ExitCode here means we always exit cleanly,
    // rather than performing a hard process exit.
    match run() {
        Ok(exit) => exit,
        Err(err) => {
            eprintln!(
                "{fatal}: no audit was performed",
                fatal = "fatal".red().bold()
            );
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
