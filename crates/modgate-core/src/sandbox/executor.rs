//! The isolation-mechanism contract.
//!
//! An [`Executor`] runs candidate source with one input inside an
//! [`IsolatedEnvironment`] and yields a JSON output. The controller races
//! every call against the sandbox timeout and drops the future when the
//! budget runs out, so implementations must release their resources on drop.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::environment::IsolatedEnvironment;

/// Failure of one candidate execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The candidate itself failed (threw, exited non-zero, ...).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The execution mechanism could not start the candidate.
    #[error("failed to launch candidate: {0}")]
    Launch(String),

    /// The candidate produced output that is not a valid result.
    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run `code` with `input` and return its output value.
    async fn execute(
        &self,
        code: &str,
        input: &serde_json::Value,
        env: Arc<IsolatedEnvironment>,
    ) -> Result<serde_json::Value, ExecError>;
}

/// Everything an in-process candidate sees for one call.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub code: String,
    pub input: serde_json::Value,
    pub env: Arc<IsolatedEnvironment>,
}

type ExecFn =
    dyn Fn(ExecContext) -> BoxFuture<'static, Result<serde_json::Value, ExecError>> + Send + Sync;

/// Executor backed by an async closure.
///
/// Used for candidates implemented in Rust and for embedding hosts that
/// interpret the source themselves; tests inject deterministic stubs here.
pub struct FnExecutor {
    run: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ExecError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Executor for FnExecutor {
    async fn execute(
        &self,
        code: &str,
        input: &serde_json::Value,
        env: Arc<IsolatedEnvironment>,
    ) -> Result<serde_json::Value, ExecError> {
        let ctx = ExecContext {
            code: code.to_string(),
            input: input.clone(),
            env,
        };
        (self.run)(ctx).await
    }
}
