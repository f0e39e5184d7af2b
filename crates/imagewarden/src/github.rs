//! GitHub API client and related types.
//!
//! The [`Client`] uses GitHub's GraphQL API to enumerate an organization's
//! repositories, and the REST API for everything else.

use std::{collections::HashMap, fmt::Display, io::Read, ops::Deref, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use http_cache_reqwest::{
    CACacheManager, Cache, CacheMode, CacheOptions, HttpCache, HttpCacheOptions,
};
use itertools::Itertools as _;
use reqwest::{
    Response, StatusCode,
    header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue},
    retry,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Deserialize;
use tar::Archive;
use thiserror::Error;
use tracing::instrument;

use crate::{
    source::{RepoSlug, SourceFile},
    utils::{IMAGEWARDEN_AGENT, PipeSelf},
};

/// Organization repositories are listed this many at a time.
const PAGE_SIZE: u32 = 100;

const REPOSITORIES_QUERY: &str = r#"
query($org: String!, $first: Int!, $after: String) {
  organization(login: $org) {
    repositories(first: $first, after: $after, orderBy: {field: NAME, direction: ASC}) {
      pageInfo {
        hasNextPage
        endCursor
      }
      nodes {
        name
        isArchived
        defaultBranchRef {
          name
        }
      }
    }
  }
}
"#;

/// Represents different types of GitHub hosts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum GitHubHost {
    Enterprise(String),
    Standard(String),
}

impl GitHubHost {
    pub(crate) fn new(hostname: &str) -> Result<Self, String> {
        let normalized = hostname.to_lowercase();

        // NOTE: This only catches the most likely kind of user
        // confusion (supplying a URL instead of a bare domain name).
        if normalized.starts_with("https://") || normalized.starts_with("http://") {
            return Err("must be a domain name, not a URL".into());
        }

        if normalized.eq_ignore_ascii_case("github.com") || normalized.ends_with(".ghe.com") {
            Ok(Self::Standard(hostname.into()))
        } else {
            Ok(Self::Enterprise(hostname.into()))
        }
    }

    fn to_api_host(&self) -> String {
        match self {
            Self::Enterprise(host) => host.clone(),
            Self::Standard(host) => format!("api.{host}"),
        }
    }

    fn to_api_url(&self) -> String {
        match self {
            Self::Enterprise(_) => format!("https://{host}/api/v3", host = self.to_api_host()),
            Self::Standard(_) => format!("https://{host}", host = self.to_api_host()),
        }
    }

    fn to_graphql_url(&self) -> String {
        match self {
            Self::Enterprise(_) => format!("https://{host}/api/graphql", host = self.to_api_host()),
            Self::Standard(_) => format!("https://{host}/graphql", host = self.to_api_host()),
        }
    }
}

impl Default for GitHubHost {
    fn default() -> Self {
        Self::Standard("github.com".into())
    }
}

impl Display for GitHubHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enterprise(host) => write!(f, "{host}"),
            Self::Standard(host) => write!(f, "{host}"),
        }
    }
}

impl FromStr for GitHubHost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A sanitized GitHub access token.
#[derive(Clone)]
pub(crate) struct GitHubToken(String);

impl GitHubToken {
    pub(crate) fn new(token: &str) -> Result<Self, String> {
        let token = token.trim();
        if token.is_empty() {
            return Err("GitHub token cannot be empty".into());
        }
        Ok(Self(token.to_owned()))
    }

    fn to_header_value(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.0))
    }
}

/// Errors that can occur while using the GitHub API client.
#[derive(Debug, Error)]
pub(crate) enum ClientError {
    /// An error originating from the underlying HTTP client.
    #[error("request error while accessing GitHub API")]
    Request(#[from] reqwest::Error),
    /// An error originating from the HTTP client (and its middleware).
    #[error("request error while accessing GitHub API")]
    Middleware(#[from] reqwest_middleware::Error),
    /// We couldn't turn the user's token into a valid header value.
    #[error("invalid token header")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),
    /// The GraphQL API answered with errors instead of data.
    #[error("GitHub GraphQL API error: {0}")]
    GraphQl(String),
    /// The requested organization doesn't exist or isn't visible to us.
    #[error("can't access organization {0}: missing or you have no access")]
    OrganizationMissing(String),
    /// An accessed repository is missing or private.
    #[error("can't access {owner}/{repo}: missing or you have no access")]
    RepoMissingOrPrivate { owner: String, repo: String },
    /// An I/O error occurred while unpacking a repository archive.
    #[error("couldn't unpack repository archive")]
    Archive(#[from] std::io::Error),
    /// A repository archive contains a non-UTF-8 path.
    #[error("invalid (non-UTF-8) path in repository archive: {0}")]
    InvalidArchivePath(String),
}

struct CacheLoggingMiddleware;

#[async_trait::async_trait]
impl reqwest_middleware::Middleware for CacheLoggingMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        tracing::debug!("Request URL: {}", req.url());

        let res = next.run(req, extensions).await?;

        let cache = res
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("MISS");
        tracing::debug!("cache was {cache}");

        Ok(res)
    }
}

/// One page of an organization's repository listing.
#[derive(Debug)]
pub(crate) struct RepositoryPage {
    pub(crate) repositories: Vec<Repository>,
    /// The cursor for the next page, or `None` if this was the last.
    pub(crate) next: Option<String>,
}

/// A repository, as returned by the organization listing query.
///
/// This model is intentionally incomplete.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Repository {
    pub(crate) name: String,
    pub(crate) is_archived: bool,
    default_branch_ref: Option<BranchRef>,
}

impl Repository {
    /// The repository's default branch, or `None` if it's empty.
    pub(crate) fn default_branch(&self) -> Option<&str> {
        self.default_branch_ref.as_ref().map(|b| b.name.as_str())
    }
}

#[derive(Clone, Debug, Deserialize)]
struct BranchRef {
    name: String,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct OrganizationData {
    organization: Option<Organization>,
}

#[derive(Deserialize)]
struct Organization {
    repositories: RepositoryConnection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryConnection {
    page_info: PageInfo,
    nodes: Vec<Repository>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

/// The REST API's core rate limit.
#[derive(Clone, Copy, Debug, Deserialize)]
pub(crate) struct RateLimit {
    pub(crate) remaining: u64,
    /// When the limit resets, in seconds since the Unix epoch.
    pub(crate) reset: u64,
}

#[derive(Deserialize)]
struct RateLimitResponse {
    rate: RateLimit,
}

/// A single commit, as returned by GitHub's commits endpoint.
///
/// This model is intentionally incomplete.
#[derive(Deserialize)]
struct CommitListing {
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    author: Option<CommitAuthor>,
}

#[derive(Deserialize)]
struct CommitAuthor {
    name: String,
}

#[derive(Clone)]
pub(crate) struct Client {
    api_base: String,
    graphql_url: String,
    api_client: ClientWithMiddleware,
}

impl Client {
    pub(crate) fn new(
        host: &GitHubHost,
        token: &GitHubToken,
        cache_dir: &Utf8Path,
    ) -> Result<Self, ClientError> {
        let mut api_client_headers = HeaderMap::new();
        api_client_headers.insert(AUTHORIZATION, token.to_header_value()?);
        api_client_headers.insert("X-GitHub-Api-Version", "2022-11-28".parse()?);
        api_client_headers.insert(ACCEPT, "application/vnd.github+json".parse()?);

        let api_client = Self::default_middleware(
            cache_dir,
            reqwest::Client::builder()
                .user_agent(IMAGEWARDEN_AGENT)
                .default_headers(api_client_headers)
                .retry(
                    retry::for_host(host.to_api_host())
                        .max_retries_per_request(3)
                        // NOTE: No budget, since we cap at 3 retries anyway.
                        .no_budget()
                        .classify_fn(|req_rep| match req_rep.status() {
                            // NOTE: Our only non-GET request is the read-only
                            // GraphQL listing query, so everything is safe to retry.
                            // In the context of the retry classifier, "success"
                            // means "don't retry".
                            Some(status)
                                if status.is_server_error()
                                    || status == StatusCode::TOO_MANY_REQUESTS =>
                            {
                                req_rep.retryable()
                            }
                            _ => req_rep.success(),
                        }),
                )
                .build()?,
        );

        Ok(Self {
            api_base: host.to_api_url(),
            graphql_url: host.to_graphql_url(),
            api_client,
        })
    }

    fn default_middleware(cache_dir: &Utf8Path, client: reqwest::Client) -> ClientWithMiddleware {
        let http_cache_options = HttpCacheOptions {
            cache_options: Some(CacheOptions {
                // GitHub API requests made with an API token seem to
                // always have `Cache-Control: private`, so we need to
                // explicitly tell http-cache that our cache is not shared
                // in order for things to cache correctly.
                shared: false,
                ..Default::default()
            }),
            ..Default::default()
        };

        ClientBuilder::new(client)
            .with(CacheLoggingMiddleware)
            .with(Cache(HttpCache {
                mode: CacheMode::Default,
                manager: CACacheManager {
                    path: cache_dir.into(),
                    remove_opts: Default::default(),
                },
                options: http_cache_options,
            }))
            .build()
    }

    /// Fetches one page of `org`'s repositories, starting after `cursor`.
    #[instrument(skip(self))]
    pub(crate) async fn repository_page(
        &self,
        org: &str,
        cursor: Option<&str>,
    ) -> Result<RepositoryPage, ClientError> {
        let resp: GraphQlResponse<OrganizationData> = self
            .api_client
            .post(&self.graphql_url)
            .json(&serde_json::json!({
                "query": REPOSITORIES_QUERY,
                "variables": {
                    "org": org,
                    "first": PAGE_SIZE,
                    "after": cursor,
                },
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.errors.is_empty() {
            let messages = resp.errors.iter().map(|e| e.message.as_str()).join("; ");
            return Err(ClientError::GraphQl(messages));
        }

        let connection = resp
            .data
            .and_then(|data| data.organization)
            .ok_or_else(|| ClientError::OrganizationMissing(org.into()))?
            .repositories;

        Ok(RepositoryPage {
            repositories: connection.nodes,
            next: connection
                .page_info
                .end_cursor
                .filter(|_| connection.page_info.has_next_page),
        })
    }

    /// Returns the current REST API rate limit.
    #[instrument(skip(self))]
    pub(crate) async fn rate_limit(&self) -> Result<RateLimit, ClientError> {
        let url = format!("{api_base}/rate_limit", api_base = self.api_base);

        let resp: RateLimitResponse = self
            .api_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.rate)
    }

    /// Fetches every Dockerfile and pipeline definition in the given
    /// repository at the slug's ref (or `HEAD`).
    ///
    /// This retrieves the entire repository archive and decompresses it,
    /// keeping only the files we audit.
    #[instrument(skip(self), fields(slug = %slug))]
    pub(crate) async fn fetch_sources(
        &self,
        slug: &RepoSlug,
    ) -> Result<Vec<SourceFile>, ClientError> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/tarball/{git_ref}",
            api_base = self.api_base,
            owner = slug.owner,
            repo = slug.repo,
            git_ref = slug.git_ref.as_deref().unwrap_or("HEAD")
        );
        tracing::debug!("fetching repo: {url}");

        let resp = self.api_client.get(&url).send().await?;
        let resp = match resp.error_for_status() {
            Ok(resp) => resp,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => {
                return Err(ClientError::RepoMissingOrPrivate {
                    owner: slug.owner.clone(),
                    repo: slug.repo.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let contents = resp.bytes().await?;
        let tar = GzDecoder::new(contents.deref());

        let mut archive = Archive::new(tar);
        let mut files = vec![];
        for entry in archive.entries()? {
            let mut entry = entry?;

            if !entry.header().entry_type().is_file() {
                continue;
            }

            // GitHub's tarballs contain entries that are prefixed with
            // `{owner}-{repo}-{ref}`, where `{ref}` has been concretized
            // into a short hash. We strip this out to ensure that our
            // paths look like normal paths.
            let file_path: Utf8PathBuf = {
                let entry_path = entry.path()?;
                let mut components = entry_path.components();
                components.next();
                Utf8Path::from_path(components.as_path())
                    .ok_or_else(|| {
                        ClientError::InvalidArchivePath(entry_path.display().to_string())
                    })?
                    .to_owned()
            };

            let Some(mut file) = SourceFile::new(file_path, String::new()) else {
                continue;
            };

            match entry.read_to_string(&mut file.contents) {
                Ok(_) => files.push(file),
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::warn!("skipping {slug}: {path}: not valid UTF-8", path = file.path);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(files)
    }

    /// Returns the `limit` most frequent commit authors among the latest
    /// 100 commits at the slug's ref.
    #[instrument(skip(self), fields(slug = %slug))]
    pub(crate) async fn top_contributors(
        &self,
        slug: &RepoSlug,
        limit: usize,
    ) -> Result<Vec<String>, ClientError> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/commits",
            api_base = self.api_base,
            owner = slug.owner,
            repo = slug.repo,
        );

        let commits: Vec<CommitListing> = self
            .api_client
            .get(&url)
            .query(&[("per_page", "100")])
            .pipe(|req| match &slug.git_ref {
                Some(g) => req.query(&[("sha", g)]),
                None => req,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(rank_contributors(
            commits
                .iter()
                .filter_map(|c| c.commit.author.as_ref())
                .map(|a| a.name.as_str()),
            limit,
        ))
    }
}

/// Ranks authors by commit count, breaking ties by name.
fn rank_contributors<'a>(authors: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for author in authors {
        *counts.entry(author).or_default() += 1;
    }

    counts
        .into_iter()
        .sorted_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)))
        .take(limit)
        .map(|(author, _)| author.to_string())
        .collect()
}
