use std::future::Future;
use std::time::{Duration, Instant};

/// Poll `action` until `predicate` accepts its result or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Poll a synchronous condition until it holds or `timeout` passes.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let condition = &condition;
    wait_for_result(move || async move { condition() }, |ok| *ok, timeout)
        .await
        .is_some()
}
