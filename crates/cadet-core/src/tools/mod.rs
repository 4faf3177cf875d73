//! Tool registry and invocation.
//!
//! Every tool is a [`ToolHandle`]: a schema the model sees plus an
//! [`Invocation`] strategy fixed at registration. Local tools are plain
//! blocking functions; GitHub and MCP tools are futures.

pub mod github;
pub mod local;
pub mod mcp;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema of a tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Where a handle came from. Ordering is the display order of `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Local,
    RemoteApi,
    Discovered,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Local => write!(f, "local"),
            Provenance::RemoteApi => write!(f, "remote-api"),
            Provenance::Discovered => write!(f, "discovered"),
        }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
pub type SyncHandler = Arc<dyn Fn(&Value) -> anyhow::Result<String> + Send + Sync>;
pub type AsyncHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Calling convention of a handle.
#[derive(Clone)]
pub enum Invocation {
    /// Blocking call, run on the blocking pool and awaited in place.
    Sync(SyncHandler),
    /// Future awaited before the next request is looked at.
    Async(AsyncHandler),
}

impl Invocation {
    pub fn is_async(&self) -> bool {
        matches!(self, Invocation::Async(_))
    }

    fn same_target(&self, other: &Invocation) -> bool {
        match (self, other) {
            (Invocation::Sync(a), Invocation::Sync(b)) => Arc::ptr_eq(a, b),
            (Invocation::Async(a), Invocation::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct ToolHandle {
    definition: ToolDefinition,
    provenance: Provenance,
    invocation: Invocation,
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.definition.name)
            .field("provenance", &self.provenance)
            .field("async", &self.invocation.is_async())
            .finish_non_exhaustive()
    }
}

impl ToolHandle {
    pub fn sync<F>(definition: ToolDefinition, provenance: Provenance, f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            definition,
            provenance,
            invocation: Invocation::Sync(Arc::new(f)),
        }
    }

    pub fn asynchronous<F, Fut>(definition: ToolDefinition, provenance: Provenance, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |args| -> ToolFuture { Box::pin(f(args)) });
        Self {
            definition,
            provenance,
            invocation: Invocation::Async(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// Same schema, same source and the same underlying function.
    pub fn is_identical(&self, other: &ToolHandle) -> bool {
        self.provenance == other.provenance
            && self.definition == other.definition
            && self.invocation.same_target(&other.invocation)
    }

    /// Runs the tool, turning failures, panics and timeouts into errors.
    ///
    /// # Errors
    /// Returns a [`ToolInvocationError`] when the tool fails in any way.
    pub async fn invoke(
        &self,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<String, ToolInvocationError> {
        let name = self.definition.name.clone();
        match &self.invocation {
            Invocation::Sync(f) => {
                let f = Arc::clone(f);
                let mut task = tokio::task::spawn_blocking(move || f(&args));
                let joined = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                        Ok(joined) => joined,
                        // A blocking task cannot be cancelled once started: the
                        // handler finishes on its pool thread and its result is
                        // dropped. Anything it writes to stderr after the guard is
                        // gone stays visible. Handlers that spawn processes must
                        // bound them on their own, as `run_tests` does.
                        Err(_) => return Err(ToolInvocationError::timed_out(name, limit)),
                    },
                    None => task.await,
                };
                match joined {
                    Ok(result) => result.map_err(|source| ToolInvocationError::failed(name, source)),
                    Err(join) => Err(ToolInvocationError::Panicked {
                        name,
                        message: panic_message(join.try_into_panic().ok()),
                    }),
                }
            }
            Invocation::Async(f) => {
                let f = Arc::clone(f);
                let fut = AssertUnwindSafe(async move { f(args).await }).catch_unwind();
                let caught = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(caught) => caught,
                        Err(_) => return Err(ToolInvocationError::timed_out(name, limit)),
                    },
                    None => fut.await,
                };
                match caught {
                    Ok(result) => result.map_err(|source| ToolInvocationError::failed(name, source)),
                    Err(payload) => Err(ToolInvocationError::Panicked {
                        name,
                        message: panic_message(Some(payload)),
                    }),
                }
            }
        }
    }
}

fn panic_message(payload: Option<Box<dyn std::any::Any + Send>>) -> String {
    let Some(payload) = payload else {
        return "task was cancelled".to_string();
    };
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A name collision between two different handles.
#[derive(Debug, thiserror::Error)]
#[error("tool '{name}' is already registered from the {existing} source (rejected {incoming} duplicate)")]
pub struct DuplicateToolError {
    pub name: String,
    pub existing: Provenance,
    pub incoming: Provenance,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Tool {name} not found")]
pub struct UnknownToolError {
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("{source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{name} panicked: {message}")]
    Panicked { name: String, message: String },
    #[error("{name} timed out after {secs} seconds")]
    TimedOut { name: String, secs: u64 },
}

impl ToolInvocationError {
    fn failed(name: String, source: anyhow::Error) -> Self {
        Self::Failed { name, source }
    }

    fn timed_out(name: String, limit: Duration) -> Self {
        Self::TimedOut {
            name,
            secs: limit.as_secs(),
        }
    }
}

/// Read-only after startup; shared by reference with the execution graph.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    handles: Vec<ToolHandle>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a batch of handles.
    ///
    /// The batch is checked before anything is inserted, so a collision
    /// leaves the registry untouched. Re-adding an identical handle is a no-op.
    ///
    /// # Errors
    /// Returns [`DuplicateToolError`] on the first non-identical name collision.
    pub fn register<I>(&mut self, handles: I) -> Result<(), DuplicateToolError>
    where
        I: IntoIterator<Item = ToolHandle>,
    {
        let mut staged: Vec<ToolHandle> = Vec::new();
        for handle in handles {
            let existing = self
                .lookup(handle.name())
                .ok()
                .or_else(|| staged.iter().find(|h| h.name() == handle.name()));
            match existing {
                Some(existing) if existing.is_identical(&handle) => {}
                Some(existing) => {
                    return Err(DuplicateToolError {
                        name: handle.name().to_string(),
                        existing: existing.provenance(),
                        incoming: handle.provenance(),
                    });
                }
                None => staged.push(handle),
            }
        }

        for handle in staged {
            self.by_name
                .insert(handle.name().to_string(), self.handles.len());
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Adds handles one by one, skipping and logging collisions.
    ///
    /// Returns how many handles were added.
    pub fn register_lenient<I>(&mut self, handles: I) -> usize
    where
        I: IntoIterator<Item = ToolHandle>,
    {
        let before = self.handles.len();
        for handle in handles {
            if let Err(err) = self.register([handle]) {
                tracing::warn!(tool = %err.name, "{err}");
            }
        }
        self.handles.len() - before
    }

    /// Exact, case-sensitive lookup.
    ///
    /// # Errors
    /// Returns [`UnknownToolError`] if no handle has that name.
    pub fn lookup(&self, name: &str) -> Result<&ToolHandle, UnknownToolError> {
        self.by_name
            .get(name)
            .map(|&i| &self.handles[i])
            .ok_or_else(|| UnknownToolError {
                name: name.to_string(),
            })
    }

    /// Handles grouped by provenance (local, remote-api, discovered), each
    /// group in registration order.
    pub fn list(&self) -> Vec<&ToolHandle> {
        let mut out: Vec<&ToolHandle> = self.handles.iter().collect();
        out.sort_by_key(|h| h.provenance());
        out
    }

    /// Schemas for the model, in `list` order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list().into_iter().map(|h| h.definition().clone()).collect()
    }

    pub fn count_by(&self, provenance: Provenance) -> usize {
        self.handles
            .iter()
            .filter(|h| h.provenance() == provenance)
            .count()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
