//! Bounded fan-out over indexed units of work (nodes, clusters).

use std::fmt;
use std::future::Future;

use futures_util::StreamExt;
use futures_util::stream;
use tracing::debug;

use crate::Error;

/// Failure of one unit, with whatever output it produced before failing.
#[derive(Debug)]
pub struct UnitError {
    pub error: Error,
    pub output: Vec<u8>,
}

impl From<Error> for UnitError {
    fn from(error: Error) -> Self {
        Self {
            error,
            output: Vec::new(),
        }
    }
}

/// A failed unit of a fan-out.
#[derive(Debug)]
pub struct IndexedError {
    pub index: usize,
    pub error: Box<Error>,
    pub output: Vec<u8>,
}

/// Every failed unit of a fan-out, sorted by index.
#[derive(Debug)]
pub struct PartialFailure {
    pub description: String,
    pub total: usize,
    pub failures: Vec<IndexedError>,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} failed",
            self.description,
            self.failures.len(),
            self.total
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.index, failure.error)?;
            let out = String::from_utf8_lossy(&failure.output);
            let out = out.trim();
            if !out.is_empty() {
                write!(f, ": {out}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

impl PartialFailure {
    /// Fold the unit errors into one, dropping indexes and output. A single
    /// failure keeps its own kind.
    pub fn into_combined(self) -> Error {
        if self.failures.is_empty() {
            return Error::Partial(self);
        }
        let errors = self.failures.into_iter().map(|f| *f.error);
        Error::combine(errors).unwrap_or_else(|| Error::InvalidInput("no failures".into()))
    }
}

/// Run `f(i)` for every `i` in `0..count`, at most `concurrency` at a time
/// (`0` means no cap).
///
/// Every index runs exactly once whatever happens to the others. On success
/// the outputs are returned in index order; otherwise every failure is
/// reported. Dropping the returned future cancels all in-flight units.
pub async fn run<F, Fut>(
    description: &str,
    count: usize,
    concurrency: usize,
    f: F,
) -> Result<Vec<Vec<u8>>, PartialFailure>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<Vec<u8>, UnitError>>,
{
    let limit = match concurrency {
        0 => count.max(1),
        n => n,
    };
    debug!(description, count, limit, "fanning out");

    let mut results: Vec<(usize, Result<Vec<u8>, UnitError>)> = stream::iter(0..count)
        .map(|i| {
            let unit = f(i);
            async move { (i, unit.await) }
        })
        .buffer_unordered(limit)
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut outputs = Vec::with_capacity(count);
    let mut failures = Vec::new();
    for (index, result) in results {
        match result {
            Ok(out) => outputs.push(out),
            Err(UnitError { error, output }) => failures.push(IndexedError {
                index,
                error: Box::new(error),
                output,
            }),
        }
    }

    if failures.is_empty() {
        Ok(outputs)
    } else {
        Err(PartialFailure {
            description: description.to_string(),
            total: count,
            failures,
        })
    }
}
