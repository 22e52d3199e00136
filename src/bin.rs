/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use peripheral_link::consts::{DEFAULT_BAUD_RATE, DEFAULT_LINK_URL, DISCOVERY_TIMEOUT};
use peripheral_link::transport::websocket::WebSocketConnector;
use peripheral_link::{
    LinkConfig, LinkError, LinkEvent, LinkMode, PeripheralFilter, PeripheralLink, SerialConfig,
};
use pretty_hex::*;
use tokio::sync::broadcast::Receiver;
use tokio::time;

use clap::Parser;

#[macro_use]
extern crate lazy_static;

#[derive(clap::Parser)]
#[clap(about, version, author)]
struct Args {
    #[clap(long, short = 'u', value_name = "URL", default_value = DEFAULT_LINK_URL)]
    url: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List serial peripherals known to the link daemon
    Scan {
        /// PnP id to look for. Defaults to common board bridges.
        #[clap(long = "pnpid", value_name = "PNPID")]
        pnp_ids: Vec<String>,
    },
    /// Connect to a peripheral and dump everything it sends
    Monitor {
        peripheral_id: String,
        #[clap(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
    },
    /// Flash firmware onto a peripheral
    UploadFirmware {
        peripheral_id: String,
        /// Device build configuration, as JSON
        #[clap(long)]
        config: String,
        #[clap(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
    },
}

lazy_static! {
    static ref ARGS: Args = Args::parse();
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let result = match &ARGS.command {
        Command::Scan { pnp_ids } => scan(pnp_ids).await,
        Command::Monitor {
            peripheral_id,
            baud,
        } => monitor(peripheral_id, *baud).await,
        Command::UploadFirmware {
            peripheral_id,
            config,
            baud,
        } => upload_firmware(peripheral_id, config, *baud).await,
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn open_link(mode: LinkMode) -> PeripheralLink {
    let config = LinkConfig::default()
        .with_mode(mode)
        .with_heartbeat(None);
    PeripheralLink::new(WebSocketConnector::new(&ARGS.url), config)
}

async fn scan(pnp_ids: &[String]) -> Result<(), LinkError> {
    let link = open_link(LinkMode::Upload);
    let mut events = link.subscribe();
    let filter = if pnp_ids.is_empty() {
        None
    } else {
        Some(PeripheralFilter::pnp_ids(pnp_ids.iter().cloned()))
    };
    link.scan(filter).await?;

    let deadline = time::sleep(DISCOVERY_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(LinkEvent::PeripheralListUpdate(peripherals)) => {
                    for info in peripherals.values() {
                        println!(
                            "{}\t{}\t{}",
                            info.peripheral_id,
                            info.name.as_deref().unwrap_or("-"),
                            info.pnp_id.as_deref().unwrap_or("-"),
                        );
                    }
                    println!();
                }
                Ok(LinkEvent::PeripheralScanTimeout) => {
                    println!("No peripheral found.");
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    link.disconnect().await;
    Ok(())
}

/// Scan until `peripheral_id` shows up, then connect to it.
async fn find_and_connect(
    link: &PeripheralLink,
    events: &mut Receiver<LinkEvent>,
    peripheral_id: &str,
    baud: u32,
) -> Result<(), LinkError> {
    link.scan(None).await?;
    loop {
        match events.recv().await {
            Ok(LinkEvent::PeripheralListUpdate(peripherals))
                if peripherals.contains_key(peripheral_id) =>
            {
                break
            }
            Ok(LinkEvent::PeripheralScanTimeout) => {
                return Err(LinkError::PeripheralNotFound(peripheral_id.to_string()))
            }
            Ok(_) => {}
            Err(_) => return Err(LinkError::LinkStopped),
        }
    }
    link.connect(peripheral_id, SerialConfig::new(baud)).await
}

async fn monitor(peripheral_id: &str, baud: u32) -> Result<(), LinkError> {
    let link = open_link(LinkMode::Upload);
    let mut events = link.subscribe();
    find_and_connect(&link, &mut events, peripheral_id, baud).await?;
    link.read(|_| {}).await?;
    println!("Connected to {}. Ctrl-C to quit.", peripheral_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::PeripheralDataReceived(data)) => println!("{}\n", data.hex_dump()),
                Ok(LinkEvent::PeripheralConnectionLost) => {
                    println!("Connection lost.");
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    link.disconnect().await;
    Ok(())
}

async fn upload_firmware(peripheral_id: &str, config: &str, baud: u32) -> Result<(), LinkError> {
    let config = serde_json::from_str(config).map_err(|e| LinkError::Protocol(e.to_string()))?;
    let link = open_link(LinkMode::Upload);
    let mut events = link.subscribe();
    find_and_connect(&link, &mut events, peripheral_id, baud).await?;

    let flashing = link.upload_firmware(config);
    tokio::pin!(flashing);
    let mut replied = false;
    let outcome = loop {
        tokio::select! {
            result = &mut flashing, if !replied => {
                replied = true;
                if let Err(e) = result {
                    break Err(e);
                }
            }
            event = events.recv() => match event {
                Ok(LinkEvent::UploadStdout(line)) => print!("{}", line),
                Ok(LinkEvent::UploadSuccess) => break Ok(()),
                Ok(LinkEvent::UploadError(message)) => break Err(LinkError::Remote(message)),
                Ok(LinkEvent::PeripheralConnectionLost) => break Err(LinkError::Disconnected),
                Ok(_) => {}
                Err(_) => break Err(LinkError::LinkStopped),
            },
        }
    };

    link.disconnect().await;
    outcome
}
