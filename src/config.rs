/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::consts::{
    BUSY_TIMEOUT, DISCOVERY_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, REPORT_VERSION_PROBE,
};
use crate::link::{LinkMode, PeripheralFilter};
use bytes::Bytes;
use std::time::Duration;

/// Real-time link health probing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Pre-framed request the firmware is expected to answer.
    pub probe: Bytes,
    pub interval: Duration,
    /// Raised to twice `interval` when not longer than it.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(probe: impl Into<Bytes>) -> Self {
        Self {
            probe: probe.into(),
            interval: HEARTBEAT_INTERVAL,
            timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

impl Default for HeartbeatConfig {
    /// Firmata report-version request.
    fn default() -> Self {
        Self::new(Bytes::from_static(&REPORT_VERSION_PROBE))
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Used by `scan` when the caller gives no filter.
    pub filter: PeripheralFilter,
    pub discovery_timeout: Duration,
    pub busy_timeout: Duration,
    /// Mode the link starts in.
    pub mode: LinkMode,
    /// None disables link health probing.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Events buffered per subscriber before slow subscribers start lagging.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            filter: PeripheralFilter::default_boards(),
            discovery_timeout: DISCOVERY_TIMEOUT,
            busy_timeout: BUSY_TIMEOUT,
            mode: LinkMode::RealTime,
            heartbeat: Some(HeartbeatConfig::default()),
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    pub fn with_filter(mut self, filter: PeripheralFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}
