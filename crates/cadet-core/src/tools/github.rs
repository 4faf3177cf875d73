//! GitHub REST tools: push a file, push a folder, create a repository.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ignore::WalkBuilder;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{Provenance, ToolDefinition, ToolHandle};
use crate::config::Config;
use crate::core::startup::resolve_url;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REPORTED_ERRORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutOutcome {
    Created,
    Updated,
}

pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    /// Base for relative local paths.
    root: PathBuf,
}

impl GithubClient {
    /// # Errors
    /// Returns an error if the token is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(token: &str, api_url: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("GITHUB_TOKEN contains invalid characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("cadet"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build GitHub HTTP client")?;

        Ok(Self {
            http,
            api_url: api_url.into(),
            root: root.into(),
        })
    }

    /// Resolves the API URL from `GITHUB_API_URL`, then config, then the default.
    ///
    /// # Errors
    /// Returns an error if the URL override is invalid or the client cannot be built.
    pub fn from_config(config: &Config, token: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let api_url = resolve_url(
            "GitHub API",
            std::env::var("GITHUB_API_URL").ok(),
            config.github.api_url.as_deref(),
            DEFAULT_API_URL,
        )?;
        Self::new(token, api_url, root)
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid GitHub API URL '{}'", self.api_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("GitHub API URL cannot be a base: {}", self.api_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn contents_url(&self, owner: &str, repo: &str, path: &str) -> Result<Url> {
        self.endpoint(
            ["repos", owner, repo, "contents"]
                .into_iter()
                .chain(path.split('/').filter(|s| !s.is_empty())),
        )
    }

    fn local_path(&self, path: &str) -> PathBuf {
        let requested = Path::new(path);
        if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        }
    }

    /// Creates `repo_path` or updates it in place when it already exists on `branch`.
    async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        repo_path: &str,
        content: &[u8],
        branch: &str,
        message: &str,
    ) -> Result<PutOutcome> {
        let url = self.contents_url(owner, repo, repo_path)?;

        let mut lookup = url.clone();
        lookup.query_pairs_mut().append_pair("ref", branch);
        let response = self.http.get(lookup).send().await?;
        let sha = match response.status() {
            StatusCode::NOT_FOUND => None,
            status if status.is_success() => {
                let existing: ExistingFile = response.json().await?;
                Some(existing.sha)
            }
            status => return Err(api_error(status, response).await),
        };

        let mut body = json!({
            "message": message,
            "content": BASE64.encode(content),
            "branch": branch,
        });
        let outcome = if let Some(sha) = sha {
            body["sha"] = json!(sha);
            PutOutcome::Updated
        } else {
            PutOutcome::Created
        };

        let response = self.http.put(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(api_error(response.status(), response).await);
        }
        tracing::debug!(owner, repo, repo_path, ?outcome, "pushed file");
        Ok(outcome)
    }

    async fn quick_push_file(&self, args: Value) -> Result<String> {
        let input: PushFileInput = parse("quick_push_file", args)?;
        let local = self.local_path(&input.file_path);
        if !local.is_file() {
            bail!("File '{}' not found", input.file_path);
        }
        let content = tokio::fs::read(&local)
            .await
            .with_context(|| format!("Failed to read '{}'", local.display()))?;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("'{}' has no file name", input.file_path))?;

        let outcome = self
            .put_file(
                &input.owner,
                &input.repo,
                &file_name,
                &content,
                &input.branch,
                &input.message,
            )
            .await?;
        let verb = match outcome {
            PutOutcome::Created => "created",
            PutOutcome::Updated => "updated",
        };
        Ok(format!(
            "Successfully {verb} {file_name} in {}/{}",
            input.owner, input.repo
        ))
    }

    async fn push_folder(&self, args: Value) -> Result<String> {
        let input: PushFolderInput = parse("push_folder", args)?;
        let folder = self.local_path(&input.folder_path);
        if !folder.exists() {
            bail!("Folder '{}' not found", input.folder_path);
        }
        if !folder.is_dir() {
            bail!("'{}' is not a folder", input.folder_path);
        }

        let mut files: Vec<PathBuf> = WalkBuilder::new(&folder)
            .standard_filters(false)
            .hidden(true)
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
            .map(ignore::DirEntry::into_path)
            .collect();
        files.sort();

        let mut uploaded = 0usize;
        let mut errors = Vec::new();
        for file in files {
            let repo_path = file
                .strip_prefix(&folder)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            let result: Result<PutOutcome> = async {
                let content = tokio::fs::read(&file).await?;
                self.put_file(
                    &input.owner,
                    &input.repo,
                    &repo_path,
                    &content,
                    &input.branch,
                    &input.message,
                )
                .await
            }
            .await;
            match result {
                Ok(_) => uploaded += 1,
                Err(err) => errors.push(format!("{repo_path}: {err:#}")),
            }
        }

        let mut out = format!("Uploaded {uploaded} files to {}/{}", input.owner, input.repo);
        if !errors.is_empty() {
            let shown: Vec<&str> = errors
                .iter()
                .take(MAX_REPORTED_ERRORS)
                .map(String::as_str)
                .collect();
            let _ = write!(out, "\n{} errors: {}", errors.len(), shown.join("; "));
        }
        Ok(out)
    }

    async fn create_github_repo(&self, args: Value) -> Result<String> {
        let input: CreateRepoInput = parse("create_github_repo", args)?;
        let url = self.endpoint(["user", "repos"])?;
        let response = self
            .http
            .post(url)
            .json(&json!({
                "name": input.name,
                "private": input.private,
                "description": input.description,
                "auto_init": true,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response.status(), response).await);
        }
        let created: CreatedRepo = response.json().await?;
        Ok(format!("Created repository: {}", created.html_url))
    }
}

/// Turns a non-success response into an error carrying GitHub's message.
async fn api_error(status: StatusCode, response: reqwest::Response) -> anyhow::Error {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or(body);
    anyhow!("GitHub API error (HTTP {}): {message}", status.as_u16())
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).with_context(|| format!("Invalid input for {tool}"))
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize)]
struct ExistingFile {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CreatedRepo {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PushFileInput {
    owner: String,
    repo: String,
    file_path: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default = "PushFileInput::default_message")]
    message: String,
}

impl PushFileInput {
    fn default_message() -> String {
        "Update file".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct PushFolderInput {
    owner: String,
    repo: String,
    folder_path: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default = "PushFolderInput::default_message")]
    message: String,
}

impl PushFolderInput {
    fn default_message() -> String {
        "Upload folder".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct CreateRepoInput {
    name: String,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    description: String,
}

fn owner_repo_props() -> Value {
    json!({
        "owner": {"type": "string", "description": "GitHub username or organization"},
        "repo": {"type": "string", "description": "Repository name"},
        "branch": {"type": "string", "description": "Branch name (default: main)"}
    })
}

fn definitions() -> [ToolDefinition; 3] {
    let mut push_file_props = owner_repo_props();
    push_file_props["file_path"] =
        json!({"type": "string", "description": "Local file path to push"});
    push_file_props["message"] =
        json!({"type": "string", "description": "Commit message (default: 'Update file')"});

    let mut push_folder_props = owner_repo_props();
    push_folder_props["folder_path"] =
        json!({"type": "string", "description": "Local folder to push, hidden entries skipped"});
    push_folder_props["message"] =
        json!({"type": "string", "description": "Commit message (default: 'Upload folder')"});

    [
        ToolDefinition::new(
            "quick_push_file",
            "Push a single local file to the root of a GitHub repository, creating or updating it.",
            json!({
                "type": "object",
                "properties": push_file_props,
                "required": ["owner", "repo", "file_path"]
            }),
        ),
        ToolDefinition::new(
            "push_folder",
            "Push every file in a local folder to a GitHub repository, keeping relative paths.",
            json!({
                "type": "object",
                "properties": push_folder_props,
                "required": ["owner", "repo", "folder_path"]
            }),
        ),
        ToolDefinition::new(
            "create_github_repo",
            "Create a new GitHub repository for the authenticated user.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Repository name"},
                    "private": {"type": "boolean", "description": "Make the repository private (default: false)"},
                    "description": {"type": "string", "description": "Repository description"}
                },
                "required": ["name"]
            }),
        ),
    ]
}

/// Builds the three GitHub handles sharing one client.
pub fn handles(client: GithubClient) -> Vec<ToolHandle> {
    let client = Arc::new(client);
    let [push_file, push_folder, create_repo] = definitions();

    let c = Arc::clone(&client);
    let push_file = ToolHandle::asynchronous(push_file, Provenance::RemoteApi, move |args| {
        let c = Arc::clone(&c);
        async move { c.quick_push_file(args).await }
    });
    let c = Arc::clone(&client);
    let push_folder = ToolHandle::asynchronous(push_folder, Provenance::RemoteApi, move |args| {
        let c = Arc::clone(&c);
        async move { c.push_folder(args).await }
    });
    let c = Arc::clone(&client);
    let create_repo = ToolHandle::asynchronous(create_repo, Provenance::RemoteApi, move |args| {
        let c = Arc::clone(&c);
        async move { c.create_github_repo(args).await }
    });

    vec![push_file, push_folder, create_repo]
}
