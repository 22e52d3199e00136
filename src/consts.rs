/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::time::Duration;

/// Default link daemon endpoint for serial peripherals.
pub const DEFAULT_LINK_URL: &str = "ws://127.0.0.1:20111/openblock/serialport";

/// Reported when nothing was discovered within this window.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
/// Busy flag is force-released after this long without a write acknowledgement.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between heartbeat probes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Real-time link is considered lost when no probe reply arrives within this window.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Firmata report-version request, the default heartbeat probe.
pub const REPORT_VERSION_PROBE: [u8; 1] = [0xF9];

/// Literal answer to an inbound `ping` call.
pub const PING_RESPONSE: i64 = 42;

/// Encoding label attached to every binary payload on the wire.
pub const PAYLOAD_ENCODING: &str = "base64";

/// Default serial line speed for Firmata firmware.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

lazy_static! {
    /// PnP ids of the USB-serial bridges found on common boards.
    pub static ref DEFAULT_PNP_IDS: Vec<String> = [
        // Arduino Uno / Mega (ATmega16U2)
        "USB\\VID_2341&PID_0043",
        "USB\\VID_2341&PID_0042",
        "USB\\VID_2341&PID_0001",
        // CH340
        "USB\\VID_1A86&PID_7523",
        // FT232R
        "USB\\VID_0403&PID_6001",
        // CP210x
        "USB\\VID_10C4&PID_EA60",
    ]
    .iter()
    .map(|id| id.to_string())
    .collect();
}
