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
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Failed to open socket: {0}")]
    SocketOpen(String),
    #[error("Socket closed by remote.")]
    SocketClosed,
    #[error("Failed to do I/O: {0}")]
    IOFailure(String),
    #[error("RPC session closed.")]
    SessionClosed,
    #[error("Malformed message: {0}")]
    Protocol(String),
    #[error("Remote returned error: {0}")]
    Remote(String),
    #[error("Failed to decode payload: {0}")]
    Decode(String),
    #[error("Peripheral is not connected.")]
    NotConnected,
    #[error("No open session. Scan first.")]
    NoSession,
    #[error("Peripheral disconnected.")]
    Disconnected,
    #[error("Write was not acknowledged within {0:?}")]
    WriteTimeout(Duration),
    #[error("Link task stopped.")]
    LinkStopped,
    #[error("Peripheral {0} not found.")]
    PeripheralNotFound(String),
}
