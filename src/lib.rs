/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Client side of a peripheral link daemon.
//!
//! A [`PeripheralLink`] talks JSON-RPC to the daemon over a message socket:
//! it discovers serial peripherals, connects to one, streams bytes to and from
//! it with single-flight writes, and watches the firmware with a heartbeat
//! while in real-time mode.

#[macro_use]
extern crate lazy_static;

pub mod codec;
pub mod config;
pub mod consts;
pub mod error;
pub mod link;
pub mod rpc;
mod timer;
pub mod transport;

pub use config::{HeartbeatConfig, LinkConfig};
pub use error::LinkError;
pub use link::{
    LinkEvent, LinkMode, LinkState, PeripheralFilter, PeripheralInfo, PeripheralLink, SerialConfig,
};
