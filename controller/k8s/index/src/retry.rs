use maesh_controller_k8s_api as k8s;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time;

pub(crate) fn is_conflict(error: &k8s::Error) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == 409)
}

pub(crate) fn is_not_found(error: &k8s::Error) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == 404)
}

/// Retries an optimistic-concurrency write while the cluster reports a
/// conflict, up to five attempts with a short jittered delay between them.
/// All other errors, and the final conflict, propagate to the caller.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, k8s::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, k8s::Error>>,
{
    const STEPS: u32 = 5;
    const BASE: Duration = Duration::from_millis(10);

    let mut attempt = 0;
    loop {
        match op().await {
            Err(error) if is_conflict(&error) && attempt + 1 < STEPS => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(1.0..1.1);
                time::sleep(BASE.mul_f64(jitter)).await;
            }
            result => return result,
        }
    }
}

/// Exponential backoff bounded by a total elapsed budget rather than an
/// attempt count.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    elapsed: Duration,
    max_elapsed: Duration,
}

// === impl Backoff ===

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(500);
    const MULTIPLIER: f64 = 1.5;
    const RANDOMIZATION: f64 = 0.5;

    pub(crate) fn new(max_elapsed: Duration) -> Self {
        Self {
            next: Self::INITIAL,
            elapsed: Duration::ZERO,
            max_elapsed,
        }
    }

    /// Returns the next delay to sleep before retrying, or `None` once the
    /// elapsed budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        let jitter = rand::thread_rng()
            .gen_range(1.0 - Self::RANDOMIZATION..1.0 + Self::RANDOMIZATION);
        let delay = self.next.mul_f64(jitter);

        if self.elapsed + delay > self.max_elapsed {
            return None;
        }

        self.elapsed += delay;
        self.next = self.next.mul_f64(Self::MULTIPLIER);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maesh_controller_k8s_api::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> k8s::Error {
        k8s::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_conflicts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;

        assert!(is_conflict(&result.unwrap_err()));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(conflict())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn backoff_respects_elapsed_budget() {
        let mut backoff = Backoff::new(Duration::from_secs(15));
        let mut total = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            total += delay;
        }
        assert!(total <= Duration::from_secs(15));
    }
}
