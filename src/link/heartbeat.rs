/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::HeartbeatConfig;
use crate::timer::TimerSlot;
use bytes::Bytes;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Stopped,
    /// Probing, no reply seen yet.
    Awaiting,
    /// At least one reply seen since start.
    Alive,
    /// Liveness window expired. Stays here until restarted.
    Lost,
}

/// Firmware liveness probing for real-time mode.
///
/// The probe timer repeats every interval. The liveness timer is a dead-man's
/// switch re-armed by every observed reply.
pub(crate) struct Heartbeat {
    config: Option<HeartbeatConfig>,
    phase: Phase,
    pub probe_timer: TimerSlot,
    pub liveness_timer: TimerSlot,
}

impl Heartbeat {
    pub fn new(config: Option<HeartbeatConfig>) -> Self {
        let config = config.map(|mut config| {
            if config.timeout <= config.interval {
                let timeout = config.interval * 2;
                warn!(
                    "Heartbeat timeout {:?} is not longer than the interval {:?}, using {:?}",
                    config.timeout, config.interval, timeout
                );
                config.timeout = timeout;
            }
            config
        });
        Self {
            config,
            phase: Phase::Stopped,
            probe_timer: TimerSlot::default(),
            liveness_timer: TimerSlot::default(),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// (Re)start probing. Returns false when probing is disabled.
    pub fn start(&mut self) -> bool {
        let config = match &self.config {
            Some(config) => config,
            None => return false,
        };
        debug!("Heartbeat start");
        self.probe_timer.arm(config.interval);
        self.liveness_timer.arm(config.timeout);
        self.phase = Phase::Awaiting;
        true
    }

    pub fn stop(&mut self) {
        if self.phase != Phase::Stopped {
            debug!("Heartbeat stop");
        }
        self.probe_timer.cancel();
        self.liveness_timer.cancel();
        self.phase = Phase::Stopped;
    }

    fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Awaiting | Phase::Alive)
    }

    /// Probe timer elapsed. Returns the probe to send and re-arms the timer.
    pub fn on_probe_due(&mut self) -> Option<Bytes> {
        if !self.is_running() {
            return None;
        }
        let config = self.config.as_ref()?;
        self.probe_timer.arm(config.interval);
        Some(config.probe.clone())
    }

    /// A probe reply was observed. Returns true on the first reply after start.
    pub fn on_reply(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        if let Some(config) = &self.config {
            self.liveness_timer.arm(config.timeout);
        }
        let first = self.phase == Phase::Awaiting;
        self.phase = Phase::Alive;
        first
    }

    /// Liveness window elapsed. Returns true if this is a fresh loss.
    pub fn on_liveness_expired(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.probe_timer.cancel();
        self.liveness_timer.cancel();
        self.phase = Phase::Lost;
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(Some(HeartbeatConfig::new(vec![0xF9])))
    }

    #[test]
    fn disabled_heartbeat_never_starts() {
        let mut hb = Heartbeat::new(None);
        assert!(!hb.start());
        assert_eq!(hb.phase(), Phase::Stopped);
        assert!(hb.on_probe_due().is_none());
        assert!(!hb.on_reply());
    }

    #[tokio::test(start_paused = true)]
    async fn first_reply_is_reported_once() {
        let mut hb = heartbeat();
        assert!(hb.start());
        assert!(hb.probe_timer.is_armed());
        assert!(hb.liveness_timer.is_armed());

        assert!(hb.on_reply());
        assert!(!hb.on_reply());
        assert_eq!(hb.phase(), Phase::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_is_terminal_until_restart() {
        let mut hb = heartbeat();
        hb.start();
        hb.liveness_timer.fired().await;

        assert!(hb.on_liveness_expired());
        assert!(!hb.on_liveness_expired());
        assert_eq!(hb.phase(), Phase::Lost);
        assert!(!hb.probe_timer.is_armed());

        // A late reply does not revive the link.
        assert!(!hb.on_reply());
        assert!(hb.on_probe_due().is_none());

        assert!(hb.start());
        assert!(hb.on_reply());
    }

    #[tokio::test(start_paused = true)]
    async fn short_timeout_still_allows_first_probe() {
        let mut config = HeartbeatConfig::new(vec![0xF9]);
        config.interval = Duration::from_secs(2);
        config.timeout = Duration::from_secs(1);
        let mut hb = Heartbeat::new(Some(config));

        let start = tokio::time::Instant::now();
        hb.start();
        hb.probe_timer.fired().await;
        assert!(hb.on_probe_due().is_some());
        hb.liveness_timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(hb.on_liveness_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_rearms_itself() {
        let mut hb = heartbeat();
        hb.start();
        hb.probe_timer.fired().await;
        assert_eq!(hb.on_probe_due().as_deref(), Some(&[0xF9][..]));
        assert!(hb.probe_timer.is_armed());

        hb.stop();
        assert!(!hb.probe_timer.is_armed());
        assert!(!hb.liveness_timer.is_armed());
        assert!(tokio::time::timeout(Duration::from_secs(30), hb.probe_timer.fired())
            .await
            .is_err());
    }
}
