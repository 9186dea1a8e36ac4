/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why [`poll_until`] stopped without the condition holding.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError {
    Timeout,
    Cancelled,
}

/// Evaluates `condition` immediately and then every `interval` until it returns
/// `true`, `timeout` elapses or `cancel` fires. A poll that is already running when
/// the deadline passes is allowed to finish.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if condition().await {
            return Ok(());
        }
        let next = Instant::now() + interval;
        if next > deadline {
            return Err(PollError::Timeout);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_matching_poll() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(5),
            &CancellationToken::new(),
            || async move { counter.fetch_add(1, Ordering::SeqCst) == 2 },
        )
        .await;
        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(2),
            &CancellationToken::new(),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            },
        )
        .await;
        assert_eq!(result, Err(PollError::Timeout));
        // t = 0, 0.5, 1.0, 1.5, 2.0
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poll_until(
            Duration::from_millis(500),
            Duration::from_secs(2),
            &cancel,
            || async { true },
        )
        .await;
        assert_eq!(result, Err(PollError::Cancelled));
    }
}
