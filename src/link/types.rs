/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::consts::{DEFAULT_BAUD_RATE, DEFAULT_PNP_IDS};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A peripheral reported by the link daemon.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralInfo {
    pub peripheral_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "pnpid", skip_serializing_if = "Option::is_none")]
    pub pnp_id: Option<String>,
    /// Whatever else the daemon reported (address, rssi, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Discovery filter sent with `discover`.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct PeripheralFilter {
    pub pnpid: Vec<String>,
}

impl PeripheralFilter {
    pub fn pnp_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pnpid: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// USB-serial bridges of the common boards.
    pub fn default_boards() -> Self {
        Self {
            pnpid: DEFAULT_PNP_IDS.clone(),
        }
    }
}

/// Serial line parameters sent with `connect`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtscts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtr: Option<bool>,
}

impl SerialConfig {
    /// 8N1 at the given speed, no flow control.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            rtscts: None,
            dtr: None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Live byte-level session with the firmware. Inbound data goes to the read handler.
    RealTime,
    /// Program upload mode. Inbound data is published as `PeripheralDataReceived`.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Discovering,
    Connected,
}

/// Notifications published to the device adapter and UI.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Full current peripheral map, keyed by peripheral id.
    PeripheralListUpdate(HashMap<String, PeripheralInfo>),
    PeripheralConnected,
    PeripheralDisconnected,
    PeripheralConnectionLost,
    PeripheralRequestError(String),
    PeripheralScanTimeout,
    PeripheralDataReceived(Bytes),
    UploadStdout(String),
    UploadError(String),
    UploadSuccess,
    RealtimeConnectionLost(String),
    RealtimeConnectSuccess,
}
