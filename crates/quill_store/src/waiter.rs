//! Run a batch of independent operations to completion.
//!
//! [`wait_all`] never short-circuits: every operation runs, and each slot of
//! the positional result holds either its value or its captured error. A
//! single failure is raised as [`WaitError::Single`] with the original error
//! as its source; several failures are composed into an [`AggregateError`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;

/// Positional outcome of one operation.
pub type Slot<T, E> = Result<T, Arc<E>>;

/// Composition of several failures from one batch.
#[derive(Debug)]
pub struct AggregateError<T, E> {
    /// Individual errors in operation order.
    pub errors: Vec<Arc<E>>,
    /// Outcome of every operation, in submission order.
    pub results: Vec<Slot<T, E>>,
}

impl<T, E: fmt::Display> fmt::Display for AggregateError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.errors.len(),
            self.results.len()
        )?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug, E: std::error::Error + 'static> std::error::Error for AggregateError<T, E> {}

/// Failure of a batch run by [`wait_all`].
#[derive(Debug, Error)]
pub enum WaitError<T: fmt::Debug, E: std::error::Error + 'static> {
    /// Exactly one operation failed.
    #[error("operation #{index} failed: {source}")]
    Single {
        index: usize,
        #[source]
        source: Arc<E>,
        results: Vec<Slot<T, E>>,
    },

    /// More than one operation failed.
    #[error(transparent)]
    Aggregate(AggregateError<T, E>),
}

impl<T: fmt::Debug, E: std::error::Error + 'static> WaitError<T, E> {
    /// Outcome of every operation, in submission order.
    pub fn results(&self) -> &[Slot<T, E>] {
        match self {
            WaitError::Single { results, .. } => results,
            WaitError::Aggregate(aggregate) => &aggregate.results,
        }
    }

    /// Individual errors in operation order.
    pub fn errors(&self) -> Vec<Arc<E>> {
        match self {
            WaitError::Single { source, .. } => vec![source.clone()],
            WaitError::Aggregate(aggregate) => aggregate.errors.clone(),
        }
    }

    /// Maps the success values while keeping positions and errors.
    pub fn map_results<U: fmt::Debug>(self, mut f: impl FnMut(T) -> U) -> WaitError<U, E> {
        let mut map = |results: Vec<Slot<T, E>>| -> Vec<Slot<U, E>> {
            results.into_iter().map(|slot| slot.map(&mut f)).collect()
        };
        match self {
            WaitError::Single {
                index,
                source,
                results,
            } => WaitError::Single {
                index,
                source,
                results: map(results),
            },
            WaitError::Aggregate(aggregate) => WaitError::Aggregate(AggregateError {
                errors: aggregate.errors,
                results: map(aggregate.results),
            }),
        }
    }
}

/// Runs every operation to completion and collects their outcomes.
///
/// Operations are polled concurrently. On success the values are returned in
/// submission order.
pub async fn wait_all<T, E, F, I>(operations: I) -> Result<Vec<T>, WaitError<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
    T: fmt::Debug,
    E: std::error::Error + 'static,
{
    let outcomes = join_all(operations).await;
    collect(outcomes)
}

/// Composes already finished outcomes the same way [`wait_all`] does.
pub fn collect<T, E>(outcomes: Vec<Result<T, E>>) -> Result<Vec<T>, WaitError<T, E>>
where
    T: fmt::Debug,
    E: std::error::Error + 'static,
{
    let mut errors = Vec::new();
    let mut first_failed = None;
    let results: Vec<Slot<T, E>> = outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.map_err(|error| {
                let error = Arc::new(error);
                first_failed.get_or_insert(index);
                errors.push(error.clone());
                error
            })
        })
        .collect();

    match (errors.len(), first_failed) {
        (0, _) => Ok(results.into_iter().filter_map(Result::ok).collect()),
        (1, Some(index)) => Err(WaitError::Single {
            index,
            source: errors.remove(0),
            results,
        }),
        _ => Err(WaitError::Aggregate(AggregateError { errors, results })),
    }
}
