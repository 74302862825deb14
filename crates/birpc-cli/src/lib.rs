// Copyright 2025 birpc Authors
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

//! # birpc CLI
//!
//! Command-line front end for birpc peers talking over WebSockets.
//!
//! ## Key Commands
//!
//! - `birpc serve`: Expose the demo `Calc` and `Echo` components
//! - `birpc call`: Call one method on a peer (outputs raw JSON for scripting)
//! - `birpc list`: Print the methods a peer advertises
//!
//! The subcommands are thin wrappers around the functions of this crate, so
//! they can be driven from tests without spawning the binary.

pub mod demo;

use anyhow::{anyhow, Context, Result};
use birpc_client::Remote;
use birpc_common::transport::{websocket, WsServer};
use birpc_common::Params;
use birpc_manager::{ConnectionManager, FanOut, ManagerConfig, PeerEvent};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Validates that a URL string starts with ws:// or wss://
pub fn validate_ws_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid peer address: '{}' must start with ws:// or wss://",
            url
        ))
    }
}

/// Builds the manager configuration from command-line values.
pub fn manager_config(timeout_ms: u64, resync_ms: u64) -> ManagerConfig {
    ManagerConfig::default()
        .with_call_timeout(Duration::from_millis(timeout_ms))
        .with_resync_interval(Duration::from_millis(resync_ms))
}

/// Parses the optional JSON argument of `birpc call`.
///
/// A JSON array supplies the positional arguments; any other value is the
/// single argument. No argument means an empty list.
pub fn parse_call_args(args: Option<&str>) -> Result<Params> {
    let Some(text) = args else {
        return Ok(Params::empty());
    };
    let value: Value =
        serde_json::from_str(text).map_err(|e| anyhow!("Invalid JSON in args: {}", e))?;
    Ok(match value {
        Value::Array(args) => Params::new(args),
        single => Params::new(vec![single]),
    })
}

/// Renders fan-out outcomes as one JSON object keyed by remote id.
///
/// Failures appear as `{"error": {"code": ..., "message": ...}}`.
pub fn fanout_to_json(outcomes: &FanOut) -> Value {
    let mut rendered = Map::new();
    for (remote, outcome) in outcomes {
        let entry = match outcome {
            Ok(value) => value.clone(),
            Err(e) => json!({ "error": { "code": e.code(), "message": e.to_string() } }),
        };
        rendered.insert(remote.to_string(), entry);
    }
    Value::Object(rendered)
}

/// A manager exposing the demo components.
pub fn demo_manager(config: ManagerConfig) -> ConnectionManager {
    let manager = ConnectionManager::new(config);
    manager.register(&demo::calc(), None);
    manager.register(&demo::echo(), None);
    manager
}

/// Serves every connection accepted by `server` through `manager`.
///
/// Runs until the listener fails.
pub async fn serve(server: WsServer, manager: ConnectionManager) -> Result<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PeerEvent::RemoteUp(id) => info!("Peer {} connected", id),
                PeerEvent::SetupDone { remote, methods } => {
                    info!("Peer {} advertises {} methods", remote, methods.len())
                }
                PeerEvent::RemoteDisconnected(id) => info!("Peer {} disconnected", id),
            }
        }
    });

    info!("Serving {:?}", manager.registry().list());
    server
        .run(move |channel, addr| {
            let manager = manager.clone();
            async move {
                info!("Accepted connection from {}", addr);
                manager.serve(channel);
            }
        })
        .await?;
    Ok(())
}

/// Connects to a peer and waits for discovery to finish.
pub async fn connect(url: &str, config: ManagerConfig) -> Result<(ConnectionManager, Arc<Remote>)> {
    validate_ws_url(url)?;
    let wait = config.call_timeout;
    let manager = ConnectionManager::new(config);

    let channel = websocket::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let remote = manager.serve(channel);

    tokio::time::timeout(wait, remote.wait_ready())
        .await
        .map_err(|_| anyhow!("Peer {} did not finish discovery within {:?}", url, wait))??;
    Ok((manager, remote))
}

/// Calls `method` on the peer at `url`.
///
/// # Returns
/// The method's result, or with `all` an object of per-remote outcomes
pub async fn call(
    url: &str,
    method: &str,
    params: Params,
    all: bool,
    config: ManagerConfig,
) -> Result<Value> {
    let (manager, remote) = connect(url, config).await?;

    let outcome = if all {
        manager
            .call_all(method, params)
            .await
            .map(|outcomes| fanout_to_json(&outcomes))
    } else {
        manager.call(method, params).await
    };

    manager.remove_remote(remote.id());
    outcome.with_context(|| format!("{} failed", method))
}

/// Methods advertised by the peer at `url`, sorted.
pub async fn list(url: &str, config: ManagerConfig) -> Result<Vec<String>> {
    let (manager, remote) = connect(url, config).await?;
    let methods = remote.methods().into_iter().collect();
    if !manager.remove_remote(remote.id()) {
        warn!("Peer {} was already gone", remote.id());
    }
    Ok(methods)
}
