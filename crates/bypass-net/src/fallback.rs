//! Ordered Fallback
//!
//! "First success in priority order" over a fixed candidate list. Used for
//! DoH providers, proxy candidates and the resolved addresses of a host.
//!
//! Candidates are attempted strictly one after another: no racing, no
//! reordering, no delay between attempts.

use std::future::Future;

/// Every candidate was attempted and none succeeded
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Number of candidates attempted
    pub attempts: usize,
    /// Error of the last attempted candidate (None if the list was empty)
    pub last_error: Option<E>,
}

impl<E> Exhausted<E> {
    /// True when there was nothing to try
    pub fn is_empty(&self) -> bool {
        self.attempts == 0
    }
}

/// Return the index and value of the first candidate whose attempt succeeds.
pub fn first_success<C, T, E, F>(candidates: &[C], mut attempt: F) -> Result<(usize, T), Exhausted<E>>
where
    F: FnMut(&C) -> Result<T, E>,
{
    let mut last_error = None;

    for (index, candidate) in candidates.iter().enumerate() {
        match attempt(candidate) {
            Ok(value) => return Ok((index, value)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(Exhausted {
        attempts: candidates.len(),
        last_error,
    })
}

/// Async variant of [`first_success`]. Each attempt fully completes before
/// the next one starts.
pub async fn first_success_async<C, T, E, F, Fut>(
    candidates: &[C],
    mut attempt: F,
) -> Result<(usize, T), Exhausted<E>>
where
    F: FnMut(&C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;

    for (index, candidate) in candidates.iter().enumerate() {
        match attempt(candidate).await {
            Ok(value) => return Ok((index, value)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(Exhausted {
        attempts: candidates.len(),
        last_error,
    })
}
