//! Rampart reconciliation: remove previously known entries that are no longer observed.

#![forbid(unsafe_code)]

use std::future::Future;

use futures::{stream, StreamExt};
use metrics::counter;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::info;

/// Deletions in flight at once during one pass.
const DELETE_CONCURRENCY: usize = 8;

/// A freshly collected set of identifiers for one resource kind.
pub trait ObservedSource: Send {
    fn current_set(&self) -> FxHashSet<String>;

    /// Release whatever backs the source. [`perform`] calls this exactly once.
    fn close(&mut self) {}
}

impl<S: ObservedSource + ?Sized> ObservedSource for Box<S> {
    fn current_set(&self) -> FxHashSet<String> {
        (**self).current_set()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// An observed set that holds nothing but the identifiers.
#[derive(Debug, Clone, Default)]
pub struct IdSnapshot {
    ids: FxHashSet<String>,
}

impl IdSnapshot {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { ids: ids.into_iter().map(Into::into).collect() }
    }
}

impl ObservedSource for IdSnapshot {
    fn current_set(&self) -> FxHashSet<String> {
        self.ids.clone()
    }
}

/// Closes the wrapped source when dropped, unless it was closed explicitly first.
///
/// Wrapping an already guarded source is harmless: the inner source is still closed once.
pub struct CloseOnDrop<S: ObservedSource> {
    closed: bool,
    source: S,
}

impl<S: ObservedSource> CloseOnDrop<S> {
    pub fn new(source: S) -> Self {
        Self { closed: false, source }
    }
}

impl<S: ObservedSource> ObservedSource for CloseOnDrop<S> {
    fn current_set(&self) -> FxHashSet<String> {
        self.source.current_set()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }
}

impl<S: ObservedSource> Drop for CloseOnDrop<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// One or more stale entries could not be removed.
#[derive(Debug, Error)]
#[error("{} reconciliation: {} deletion(s) failed{}", .resource_type, .failures.len(), list_failures(.failures))]
pub struct ReconcileError {
    pub resource_type: String,
    /// Every failed id with its cause, sorted by id.
    pub failures: Vec<(String, anyhow::Error)>,
}

fn list_failures(failures: &[(String, anyhow::Error)]) -> String {
    failures.iter().map(|(id, err)| format!("; {}: {:#}", id, err)).collect()
}

impl ReconcileError {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(id, _)| id.as_str())
    }
}

/// Remove every id in `expected` that `observed` no longer reports.
///
/// `remove` is invoked at most once per stale id; every failure is collected rather than
/// stopping at the first. `observed` is closed exactly once on every exit path.
pub async fn perform<S, F, Fut>(
    expected: &FxHashSet<String>,
    observed: S,
    resource_type: &str,
    remove: F,
) -> Result<(), ReconcileError>
where
    S: ObservedSource,
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let source = CloseOnDrop::new(observed);
    let current = source.current_set();
    let mut stale: Vec<String> = expected.difference(&current).cloned().collect();
    if stale.is_empty() {
        return Ok(());
    }
    stale.sort_unstable();

    info!("Deleting {} {} as a part of reconciliation", stale.len(), resource_type);

    let attempted = stale.len();
    let mut failures: Vec<(String, anyhow::Error)> = stream::iter(stale)
        .map(|id| {
            let fut = remove(id.clone());
            async move { (id, fut.await) }
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .filter_map(|(id, res)| async move { res.err().map(|e| (id, e)) })
        .collect()
        .await;

    counter!("reconcile_deleted_total", (attempted - failures.len()) as u64);
    if failures.is_empty() {
        return Ok(());
    }
    counter!("reconcile_failed_total", failures.len() as u64);
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    Err(ReconcileError { resource_type: resource_type.to_string(), failures })
}
