//! Call de-duplication with a short result cache
//!
//! [`SingleDo`] collapses overlapping calls into one execution: a caller that
//! arrives while a call is in flight awaits that same call, and a caller that
//! arrives within `wait` of the last completion receives the cached result
//! without running anything.

use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

struct State<T> {
    call: Option<(u64, Shared<BoxFuture<'static, T>>)>,
    result: Option<(Instant, T)>,
    next_id: u64,
}

/// De-duplicates concurrent and closely spaced calls
pub struct SingleDo<T: Clone> {
    wait: Duration,
    state: Mutex<State<T>>,
}

impl<T> SingleDo<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a de-duplicator that reuses results for `wait`
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            state: Mutex::new(State {
                call: None,
                result: None,
                next_id: 0,
            }),
        }
    }

    /// Run `f` unless a call is in flight or finished within `wait`
    ///
    /// Returns the value and whether it was shared with another caller.
    pub async fn run<F, Fut>(&self, f: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (call, id, shared) = {
            let mut state = self.state.lock();
            if let Some((at, value)) = &state.result {
                if at.elapsed() < self.wait {
                    return (value.clone(), true);
                }
            }
            if let Some((id, call)) = &state.call {
                (call.clone(), *id, true)
            } else {
                let id = state.next_id;
                state.next_id += 1;
                let call = f().boxed().shared();
                state.call = Some((id, call.clone()));
                (call, id, false)
            }
        };

        let value = call.await;

        let mut state = self.state.lock();
        if matches!(&state.call, Some((current, _)) if *current == id) {
            state.call = None;
            state.result = Some((Instant::now(), value.clone()));
        }
        (value, shared)
    }

    /// Forget the cached result
    pub fn reset(&self) {
        self.state.lock().result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_execution() {
        let single = Arc::new(SingleDo::new(Duration::from_secs(1)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let single = Arc::clone(&single);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                single
                    .run(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        7u32
                    })
                    .await
            }));
        }

        let mut shared = 0;
        for handle in handles {
            let (value, was_shared) = handle.await.unwrap();
            assert_eq!(value, 7);
            if was_shared {
                shared += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cached_within_wait() {
        let single = SingleDo::new(Duration::from_secs(1));
        let (v, shared) = single.run(|| async { 1u32 }).await;
        assert_eq!((v, shared), (1, false));

        let (v, shared) = single.run(|| async { 2u32 }).await;
        assert_eq!((v, shared), (1, true));

        tokio::time::advance(Duration::from_millis(1100)).await;
        let (v, shared) = single.run(|| async { 3u32 }).await;
        assert_eq!((v, shared), (3, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_result() {
        let single = SingleDo::new(Duration::from_secs(10));
        single.run(|| async { 1u32 }).await;
        single.reset();
        let (v, shared) = single.run(|| async { 2u32 }).await;
        assert_eq!((v, shared), (2, false));
    }
}
