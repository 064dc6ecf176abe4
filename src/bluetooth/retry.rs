// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded retry with linear backoff.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{BluetoothError, Result};

/// How many times to retry and how long to wait between attempts.
///
/// The wait after attempt `n` (1-indexed) is
/// `base_delay + backoff_step * (n - 1)`: linear growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after a failed attempt. Attempt 0 is treated as attempt 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        self.base_delay
            .saturating_add(self.backoff_step.saturating_mul(steps))
    }

    /// Every delay of one full cycle, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(move |n| self.delay_for(n))
    }
}

/// Run `attempt` until it succeeds, the policy is exhausted or a fatal
/// error comes back.
///
/// Each failed attempt is followed by its backoff delay, the last one
/// included, before the cycle reports [`BluetoothError::RetryExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for n in 1..=policy.max_attempts {
        info!("Attempt {}/{}", n, policy.max_attempts);
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() => {
                warn!("Attempt {} aborted the cycle: {}", n, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(n);
                warn!("Attempt {} failed: {}. Waiting {:?}", n, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(BluetoothError::RetryExhausted {
        attempts: policy.max_attempts,
    })
}
