//! Execution scope
//!
//! [`ExecutionScope`] is an explicit stack of deferred disposals. Resources
//! are released in reverse acquisition order, each exactly once, when the
//! scope is disposed or dropped. Dropping covers the exits a `finally` would:
//! an early return, an unwinding panic, and a future dropped mid-await.
//!
//! Disposal failures are logged at `warn` and counted, never returned.

use stagecraft_kernel::{Disposable, DisposalError};
use std::future::Future;

/// Outcome of one [`ExecutionScope::dispose`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposalReport {
    /// Resources released cleanly
    pub released: usize,
    /// Resources whose release failed
    pub failed: usize,
}

impl DisposalReport {
    /// Whether this call disposed nothing
    #[inline]
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.released == 0 && self.failed == 0
    }
}

/// Deferred closure run on dispose
struct Deferred<F> {
    label: String,
    action: Option<F>,
}

impl<F> Disposable for Deferred<F>
where
    F: FnOnce() -> Result<(), DisposalError> + Send,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn dispose(&mut self) -> Result<(), DisposalError> {
        match self.action.take() {
            Some(action) => action(),
            None => Err(DisposalError::AlreadyReleased {
                resource: self.label.clone(),
            }),
        }
    }
}

/// Stack of resources released on exit
pub struct ExecutionScope {
    label: String,
    stack: Vec<Box<dyn Disposable>>,
    disposed: bool,
}

impl ExecutionScope {
    /// Create empty scope
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stack: Vec::new(),
            disposed: false,
        }
    }

    /// Scope label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Push a resource to release on exit
    ///
    /// Deferring into an already disposed scope releases the resource
    /// immediately.
    pub fn defer<D: Disposable + 'static>(&mut self, resource: D) {
        if self.disposed {
            let mut resource = resource;
            self.release(&mut resource);
            return;
        }
        self.stack.push(Box::new(resource));
    }

    /// Push a closure to run on exit
    pub fn defer_fn<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), DisposalError> + Send + 'static,
    {
        self.defer(Deferred {
            label: label.into(),
            action: Some(action),
        });
    }

    /// Resources still held
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Check if nothing is held
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Whether [`ExecutionScope::dispose`] has run
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release everything in reverse order
    ///
    /// Idempotent; later calls return an empty report.
    pub fn dispose(&mut self) -> DisposalReport {
        let mut report = DisposalReport::default();
        if self.disposed {
            return report;
        }
        self.disposed = true;

        while let Some(mut resource) = self.stack.pop() {
            if self.release(resource.as_mut()) {
                report.released += 1;
            } else {
                report.failed += 1;
            }
        }
        tracing::debug!(
            scope = %self.label,
            released = report.released,
            failed = report.failed,
            "execution scope disposed"
        );
        report
    }

    fn release(&self, resource: &mut dyn Disposable) -> bool {
        match resource.dispose() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    scope = %self.label,
                    resource = resource.label(),
                    error = %e,
                    "disposal failed"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("label", &self.label)
            .field(
                "held",
                &self.stack.iter().map(|r| r.label()).collect::<Vec<_>>(),
            )
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Acquire resources, run `body`, release on every exit
///
/// `acquire` defers whatever it takes into the scope and returns the handles
/// `body` needs. The scope lives inside the returned future, so dropping that
/// future releases everything too.
pub async fn with_scope<R, T, A, B, Fut>(label: &str, acquire: A, body: B) -> T
where
    A: FnOnce(&mut ExecutionScope) -> R,
    B: FnOnce(R) -> Fut,
    Fut: Future<Output = T>,
{
    let mut scope = ExecutionScope::new(label);
    let handles = acquire(&mut scope);
    let output = body(handles).await;
    scope.dispose();
    output
}
