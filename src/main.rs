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

//! Bluetooth serial shell.
//!
//! Reads `<action> [json-args]` lines from stdin and prints one JSON result
//! per line.

use anyhow::Result;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluetooth_serial::bluetooth::BluezPlatform;
use bluetooth_serial::bridge::{self, error_json, Action, Outcome};
use bluetooth_serial::{Config, SerialError, SerialManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.filter.parse()?),
        )
        .init();

    info!(
        "Starting Bluetooth serial v{}...",
        env!("CARGO_PKG_VERSION")
    );

    let platform = Arc::new(BluezPlatform::new(&config).await?);
    let manager = SerialManager::spawn(platform, &config);

    if config.bluetooth.accept_incoming {
        if let Err(e) = manager.listen().await {
            warn!("Could not start listening: {}", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Ready for commands");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&manager, line.trim()).await,
                None => break,
            },
        }
    }

    info!("Shutting down...");
    if let Err(e) = manager.stop().await {
        error!("Failed to stop: {}", e);
    }
    Ok(())
}

/// Runs one command line.
///
/// Actions are awaited in input order. Connect and pair wait on the remote
/// device, so they run in the background, as does draining a stream once its
/// request has been accepted.
async fn handle_line(manager: &SerialManager, line: &str) {
    if line.is_empty() {
        return;
    }
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let name = name.to_string();

    let args: Vec<Value> = if rest.trim().is_empty() {
        Vec::new()
    } else {
        match serde_json::from_str(rest) {
            Ok(args) => args,
            Err(e) => {
                let e = SerialError::InvalidArgument(e.to_string());
                print_reply(&name, json!({"error": error_json(&e)}));
                return;
            }
        }
    };

    let action = match Action::parse(&name, &args) {
        Ok(action) => action,
        Err(e) => {
            print_reply(&name, json!({"error": error_json(&e)}));
            return;
        }
    };

    if matches!(action, Action::Connect { .. } | Action::Pair(_)) {
        let manager = manager.clone();
        tokio::spawn(async move {
            let outcome = bridge::dispatch(&manager, action).await;
            print_outcome(name, outcome).await;
        });
        return;
    }

    match bridge::dispatch(manager, action).await {
        Ok(Outcome::Stream(deliveries)) => {
            tokio::spawn(print_deliveries(name, deliveries));
        }
        outcome => print_outcome(name, outcome).await,
    }
}

async fn print_outcome(name: String, outcome: Result<Outcome, SerialError>) {
    match outcome {
        Ok(Outcome::Done(value)) => print_reply(&name, json!({"ok": value})),
        Ok(Outcome::Stream(deliveries)) => print_deliveries(name, deliveries).await,
        Err(e) => print_reply(&name, json!({"error": error_json(&e)})),
    }
}

async fn print_deliveries(name: String, mut deliveries: BoxStream<'static, Result<Value, SerialError>>) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(value) => print_reply(&name, json!({"ok": value})),
            Err(e) => print_reply(&name, json!({"error": error_json(&e)})),
        }
    }
}

fn print_reply(action: &str, mut reply: Value) {
    if let Some(object) = reply.as_object_mut() {
        object.insert("action".to_string(), Value::String(action.to_string()));
    }
    println!("{}", reply);
}
