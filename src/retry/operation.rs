//! The unit of work the retry orchestrator re-invokes.

use std::future::{Future, Ready, ready};

/// A repeatable fallible operation.
///
/// Every async closure `FnMut() -> impl Future<Output = Result<T, E>>`
/// implements this. Synchronous closures go through [`blocking`].
pub trait Operation {
    type Output;
    type Error;
    type Future: Future<Output = Result<Self::Output, Self::Error>>;

    /// Starts one attempt.
    fn invoke(&mut self) -> Self::Future;
}

impl<F, Fut, T, E> Operation for F
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Output = T;
    type Error = E;
    type Future = Fut;

    fn invoke(&mut self) -> Self::Future {
        self()
    }
}

/// Adapts a synchronous closure so it can be retried like an async one.
///
/// The closure runs inline on the calling task; it should not block for long.
pub fn blocking<F, T, E>(mut f: F) -> impl FnMut() -> Ready<Result<T, E>>
where
    F: FnMut() -> Result<T, E>,
{
    move || ready(f())
}
