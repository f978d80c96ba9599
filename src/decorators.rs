//! Caller-side recovery for decorated operations.
//!
//! Engines never swallow errors. To turn a failure into a value, wrap the decorated future
//! with [`recover`] (every error) or [`recover_when`] (errors accepted by a predicate).
//!
//! ```rust
//! use lifeguard::decorators::recover;
//! use lifeguard::ResilienceError;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let call = async { Err::<u32, ResilienceError<std::io::Error>>(ResilienceError::Inner(
//!     std::io::Error::new(std::io::ErrorKind::Other, "down"),
//! )) };
//! let value = recover(call, |_err| Ok(0)).await;
//! assert_eq!(value.unwrap(), 0);
//! # });
//! ```

use std::future::Future;

use crate::ResilienceError;

/// Await `operation`; on error, hand the error to `fallback` and return its result instead.
pub async fn recover<T, E, Fut, F>(operation: Fut, fallback: F) -> Result<T, ResilienceError<E>>
where
    Fut: Future<Output = Result<T, ResilienceError<E>>>,
    F: FnOnce(ResilienceError<E>) -> Result<T, ResilienceError<E>>,
{
    match operation.await {
        Ok(value) => Ok(value),
        Err(err) => fallback(err),
    }
}

/// Like [`recover`], but only errors accepted by `predicate` reach `fallback`. Others are
/// returned unchanged.
pub async fn recover_when<T, E, Fut, P, F>(
    operation: Fut,
    predicate: P,
    fallback: F,
) -> Result<T, ResilienceError<E>>
where
    Fut: Future<Output = Result<T, ResilienceError<E>>>,
    P: FnOnce(&ResilienceError<E>) -> bool,
    F: FnOnce(ResilienceError<E>) -> Result<T, ResilienceError<E>>,
{
    match operation.await {
        Ok(value) => Ok(value),
        Err(err) if predicate(&err) => fallback(err),
        Err(err) => Err(err),
    }
}
