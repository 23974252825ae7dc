//! Retry policy contract.

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;

/// A policy that re-runs a fallible async operation.
///
/// `op` is invoked at least once; implementations decide how many further
/// attempts to make, how long to wait between them, and which errors are
/// worth retrying at all.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send;
}
