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

//! RFCOMM link command line tool.
//!
//! Usage: rfcomm-link [listen|scan|connect <address>]

use anyhow::{bail, Result};
use futures::StreamExt;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use rfcomm_link::bluetooth::bluez::BluezPlatform;
use rfcomm_link::bluetooth::{ConnectionResults, Ports};
use rfcomm_link::config::Config;
use rfcomm_link::{logging, ConnectionResult, ConnectionSupervisor, Device, Message, SupervisorEvent};

const SCAN_DURATION: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init(&config.logging)?;

    info!("Starting RFCOMM link v{}...", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("listen");

    let platform = Arc::new(BluezPlatform::new().await?);
    let supervisor =
        ConnectionSupervisor::new(Ports::from_platform(platform), config.supervisor_options());
    supervisor.initialize().await?;

    let mut events = supervisor.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SupervisorEvent::StateChanged(state) = &event {
                println!("[{}]", state.as_str());
            } else if let Some(msg) = event.message() {
                println!("{}", msg);
            }
        }
    });

    match mode {
        "scan" => scan(&supervisor).await?,
        "listen" => {
            let results = supervisor.listen();
            run_session(&supervisor, results).await;
        }
        "connect" => {
            let Some(address) = args.get(2) else {
                bail!("usage: rfcomm-link connect <address>");
            };
            let results = supervisor.connect(&Device::new(address.as_str(), None));
            run_session(&supervisor, results).await;
        }
        other => bail!("unknown mode '{}'; expected listen, scan or connect", other),
    }

    supervisor.release().await;
    info!("RFCOMM link stopped");
    Ok(())
}

async fn scan(supervisor: &Arc<ConnectionSupervisor>) -> Result<()> {
    supervisor.start_discovery().await?;
    println!("Scanning for {} seconds...", SCAN_DURATION.as_secs());
    tokio::time::sleep(SCAN_DURATION).await;
    supervisor.stop_discovery().await;

    for device in supervisor.bonded_devices().iter() {
        println!("bonded  {}  {}", device.address(), device.display_name());
    }
    for device in supervisor.discovered_devices().iter() {
        println!("found   {}  {}", device.address(), device.display_name());
    }
    Ok(())
}

/// Print incoming messages and send each stdin line until either side
/// stops.
async fn run_session(supervisor: &Arc<ConnectionSupervisor>, mut results: ConnectionResults) {
    let sender_id = env::var("HOSTNAME").unwrap_or_else(|_| "rfcomm-link".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            result = results.next() => match result {
                Some(ConnectionResult::Established) => info!("Session established"),
                Some(ConnectionResult::MessageReceived(message)) => {
                    println!("{}> {}", message.sender_id, message.payload_text());
                }
                Some(ConnectionResult::Failed(reason)) => error!("Session failed: {}", reason),
                None => {
                    info!("Session ended");
                    break;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !supervisor.send(&Message::new(sender_id.as_str(), line.into_bytes())).await {
                        error!("Send failed");
                    }
                }
                Ok(None) | Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
}
