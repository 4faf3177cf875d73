//! Filesystem and test-runner tools.
//!
//! All four are blocking functions. Relative paths resolve against the
//! session root.

use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use grep_regex::RegexMatcher;
use grep_searcher::sinks::UTF8;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Provenance, ToolDefinition, ToolHandle};

const MAX_DEPTH: usize = 8;
const MAX_LIST_ENTRIES: usize = 500;
const MAX_READ_BYTES: u64 = 256 * 1024;
const MAX_MATCHES: usize = 200;
const MAX_MATCH_LINE_CHARS: usize = 300;
/// Test output keeps its tail; failures are usually reported last.
const MAX_TEST_OUTPUT_BYTES: usize = 30 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared settings for the local tools.
#[derive(Debug, Clone)]
pub struct LocalContext {
    pub root: PathBuf,
    pub test_command: String,
    pub test_timeout: Duration,
}

impl LocalContext {
    pub fn new(root: impl Into<PathBuf>, test_command: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            test_command: test_command.into(),
            test_timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }
}

/// Builds the local tool handles bound to `ctx`.
pub fn handles(ctx: LocalContext) -> Vec<ToolHandle> {
    let ctx = Arc::new(ctx);
    let bind = |definition: ToolDefinition, run: fn(&LocalContext, &Value) -> Result<String>| {
        let ctx = Arc::clone(&ctx);
        ToolHandle::sync(definition, Provenance::Local, move |args| run(&ctx, args))
    };

    vec![
        bind(list_files_definition(), list_files),
        bind(read_file_definition(), read_file),
        bind(search_code_definition(), search_code),
        bind(run_tests_definition(), run_tests),
    ]
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, args: &Value) -> Result<T> {
    // Gemini sends no args object for zero-argument calls.
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).with_context(|| format!("Invalid input for {tool}"))
}

/// Joins `path` onto `root` unless it is absolute, then canonicalizes.
fn resolve_existing_path(root: &Path, path: &str) -> Result<PathBuf> {
    let requested = Path::new(path);
    let full = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    full.canonicalize()
        .with_context(|| format!("Path does not exist '{}'", full.display()))
}

fn display_relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// list_files

fn list_files_definition() -> ToolDefinition {
    ToolDefinition::new(
        "list_files",
        "List files and directories under a path, respecting .gitignore. \
         Directories end with '/'.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (relative to the project root, default: '.')"
                }
            }
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ListInput {
    #[serde(default)]
    path: Option<String>,
}

fn list_files(ctx: &LocalContext, args: &Value) -> Result<String> {
    let input: ListInput = parse("list_files", args)?;
    let dir = resolve_existing_path(&ctx.root, input.path.as_deref().unwrap_or("."))?;
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }

    let mut entries = Vec::new();
    let walker = WalkBuilder::new(&dir)
        .standard_filters(true)
        .max_depth(Some(MAX_DEPTH))
        .build();
    for entry in walker.flatten() {
        let rel = display_relative(&dir, entry.path());
        if rel.is_empty() {
            continue;
        }
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            entries.push(format!("{rel}/"));
        } else {
            entries.push(rel);
        }
    }

    if entries.is_empty() {
        return Ok(format!("{} is empty", dir.display()));
    }

    entries.sort();
    let total = entries.len();
    entries.truncate(MAX_LIST_ENTRIES);
    let mut out = entries.join("\n");
    if total > MAX_LIST_ENTRIES {
        let _ = write!(out, "\n... ({} more entries not shown)", total - MAX_LIST_ENTRIES);
    }
    Ok(out)
}

// read_file

fn read_file_definition() -> ToolDefinition {
    ToolDefinition::new(
        "read_file",
        "Read the contents of a text file.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (relative to the project root)"
                }
            },
            "required": ["path"]
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ReadInput {
    path: String,
}

fn read_file(ctx: &LocalContext, args: &Value) -> Result<String> {
    let input: ReadInput = parse("read_file", args)?;
    let path = resolve_existing_path(&ctx.root, &input.path)?;
    if path.is_dir() {
        bail!("'{}' is a directory; use list_files", path.display());
    }

    let size = fs::metadata(&path)
        .with_context(|| format!("Failed to read metadata for '{}'", path.display()))?
        .len();
    if size > MAX_READ_BYTES {
        bail!(
            "File '{}' is too large ({size} bytes, limit {MAX_READ_BYTES})",
            path.display()
        );
    }

    let bytes = fs::read(&path).with_context(|| format!("Failed to read file '{}'", path.display()))?;
    String::from_utf8(bytes)
        .with_context(|| format!("'{}' is not a UTF-8 text file", path.display()))
}

// search_code

fn search_code_definition() -> ToolDefinition {
    ToolDefinition::new(
        "search_code",
        "Search file contents with a regular expression. Returns matching lines as path:line: text.",
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: '.')"
                }
            },
            "required": ["pattern"]
        }),
    )
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

fn search_code(ctx: &LocalContext, args: &Value) -> Result<String> {
    let input: SearchInput = parse("search_code", args)?;
    let matcher = RegexMatcher::new(&input.pattern)
        .with_context(|| format!("Invalid pattern '{}'", input.pattern))?;
    let target = resolve_existing_path(&ctx.root, input.path.as_deref().unwrap_or("."))?;
    let base = if target.is_dir() {
        target.clone()
    } else {
        target.parent().map(Path::to_path_buf).unwrap_or_default()
    };

    let mut searcher = SearcherBuilder::new()
        .binary_detection(BinaryDetection::quit(b'\x00'))
        .line_number(true)
        .build();

    let mut hits: Vec<String> = Vec::new();
    let mut truncated = false;
    let walker = WalkBuilder::new(&target)
        .standard_filters(true)
        .max_depth(Some(MAX_DEPTH))
        .build();

    'files: for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let rel = display_relative(&base, entry.path());
        let result = searcher.search_path(
            &matcher,
            entry.path(),
            UTF8(|line_number, line| {
                let text: String = line.trim().chars().take(MAX_MATCH_LINE_CHARS).collect();
                hits.push(format!("{rel}:{line_number}: {text}"));
                Ok(hits.len() < MAX_MATCHES)
            }),
        );
        if let Err(err) = result {
            tracing::debug!(path = %entry.path().display(), "search skipped file: {err}");
        }
        if hits.len() >= MAX_MATCHES {
            truncated = true;
            break 'files;
        }
    }

    if hits.is_empty() {
        return Ok(format!("No matches for '{}'", input.pattern));
    }
    let mut out = hits.join("\n");
    if truncated {
        let _ = write!(out, "\n... (stopped after {MAX_MATCHES} matches)");
    }
    Ok(out)
}

// run_tests

fn run_tests_definition() -> ToolDefinition {
    ToolDefinition::new(
        "run_tests",
        "Run the project's test suite and report exit code and output.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Test command to run instead of the configured one"
                }
            }
        }),
    )
}

#[derive(Debug, Deserialize)]
struct RunTestsInput {
    #[serde(default)]
    command: Option<String>,
}

fn run_tests(ctx: &LocalContext, args: &Value) -> Result<String> {
    let input: RunTestsInput = parse("run_tests", args)?;
    let command = input
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(&ctx.test_command);

    let mut child = shell(command)
        .current_dir(&ctx.root)
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute command '{command}'"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + ctx.test_timeout;
    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to wait for test command")? {
            break status;
        }
        if Instant::now() >= deadline {
            kill_tree(&mut child);
            bail!(
                "'{command}' timed out after {} seconds",
                ctx.test_timeout.as_secs()
            );
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    let code = status
        .code()
        .map_or_else(|| "terminated by signal".to_string(), |c| c.to_string());

    let mut out = format!("Command: {command}\nExit code: {code}\n");
    for (label, bytes) in [("stdout", stdout), ("stderr", stderr)] {
        if !bytes.is_empty() {
            let _ = write!(out, "\n--- {label} ---\n{}", tail(&bytes, MAX_TEST_OUTPUT_BYTES));
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Kills the whole process group so grandchildren release the pipes.
#[cfg(unix)]
fn kill_tree(child: &mut std::process::Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: plain syscall on a group id we created with process_group(0).
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Last `max` bytes of `bytes`, cut on a char boundary.
fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... output truncated ...]\n{}", &text[start..])
}
