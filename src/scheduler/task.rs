//! Task definitions: the handler contract and registration options.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

/// A job the scheduler can fire.
///
/// Handlers take no input and report success or failure. They may be invoked
/// repeatedly, and concurrently with handlers of other tasks.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Adapter that turns an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler, e.g. `from_fn(|| async { Ok(()) })`.
pub fn from_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait::async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self) -> Result<()> {
        (self.f)().await
    }
}

/// Registration options for one task.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    pub schedule: String,
    pub handler: Arc<dyn TaskHandler>,
    /// Run on at most one node of the cluster at a time.
    pub global: bool,
    pub enabled: bool,
    /// Runs longer than this are recorded as errors. `None` means unbounded.
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            handler: Arc::new(handler),
            global: false,
            enabled: true,
            timeout: None,
        }
    }

    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("global", &self.global)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
