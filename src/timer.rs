/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};

/// Owner of a single timer handle.
///
/// Arming an armed slot replaces the previous deadline, so a slot can never
/// hold two timers. A slot fires at most once per `arm`.
#[derive(Default)]
pub(crate) struct TimerSlot {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl TimerSlot {
    pub fn arm(&mut self, after: Duration) {
        self.cancel();
        self.deadline = Some(Box::pin(sleep(after)));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline elapses and disarms the slot.
    /// Pends forever while disarmed, so it is safe to use as a `select!` branch.
    pub async fn fired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.deadline = None;
            }
            None => pending().await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::time::{timeout, Instant};

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let mut slot = TimerSlot::default();
        let start = Instant::now();
        slot.arm(Duration::from_secs(5));
        slot.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));
        assert!(!slot.is_armed());
        assert!(timeout(Duration::from_secs(60), slot.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_deadline() {
        let mut slot = TimerSlot::default();
        let start = Instant::now();
        slot.arm(Duration::from_secs(5));
        slot.arm(Duration::from_secs(2));
        slot.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(timeout(Duration::from_secs(10), slot.fired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let mut slot = TimerSlot::default();
        slot.arm(Duration::from_secs(1));
        slot.cancel();
        slot.cancel();
        assert!(!slot.is_armed());
        assert!(timeout(Duration::from_secs(10), slot.fired()).await.is_err());
    }
}
