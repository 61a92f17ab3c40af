//! Predicates deciding which buried jobs go back to their main queue.

use crate::job::Job;
use std::fmt;
use std::sync::Arc;

/// A composable predicate over buried jobs.
///
/// `Queue::republish_buried` republishes a job when any of the supplied
/// conditions holds; use `RepublishCondition::all` to require several.
#[derive(Clone)]
pub struct RepublishCondition(Arc<dyn Fn(&Job) -> bool + Send + Sync>);

impl RepublishCondition {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Job) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn always() -> Self {
        Self::new(|_| true)
    }

    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Jobs that were retried more than `n` times.
    pub fn retries_exceeded(n: i32) -> Self {
        Self::new(move |job| job.retries > n)
    }

    /// Jobs that were retried at most `n` times.
    pub fn retries_at_most(n: i32) -> Self {
        Self::new(move |job| job.retries <= n)
    }

    /// Jobs whose last failure was classified as `error_type`.
    pub fn error_type(error_type: impl Into<String>) -> Self {
        let error_type = error_type.into();
        Self::new(move |job| job.error_type == error_type)
    }

    pub fn and(self, other: RepublishCondition) -> Self {
        Self::new(move |job| self.complies(job) && other.complies(job))
    }

    pub fn or(self, other: RepublishCondition) -> Self {
        Self::new(move |job| self.complies(job) || other.complies(job))
    }

    pub fn not(self) -> Self {
        Self::new(move |job| !self.complies(job))
    }

    /// Holds when every condition holds; true for none.
    pub fn all(conditions: impl IntoIterator<Item = RepublishCondition>) -> Self {
        let conditions: Vec<_> = conditions.into_iter().collect();
        Self::new(move |job| conditions.iter().all(|c| c.complies(job)))
    }

    /// Holds when some condition holds; true for none, like `comply`.
    pub fn any(conditions: impl IntoIterator<Item = RepublishCondition>) -> Self {
        let conditions: Vec<_> = conditions.into_iter().collect();
        Self::new(move |job| comply(&conditions, job))
    }

    pub fn complies(&self, job: &Job) -> bool {
        (self.0)(job)
    }
}

impl fmt::Debug for RepublishCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RepublishCondition(..)")
    }
}

/// Whether `job` satisfies any of `conditions`. An empty list accepts every job.
pub fn comply(conditions: &[RepublishCondition], job: &Job) -> bool {
    conditions.is_empty() || conditions.iter().any(|c| c.complies(job))
}
