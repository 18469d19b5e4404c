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

//! Command bridge.
//!
//! Maps named actions with JSON arguments onto the manager and renders the
//! results as JSON values.

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::bluetooth::Device;
use crate::discovery::DiscoveryEvent;
use crate::error::SerialError;
use crate::manager::SerialManager;

/// A parsed bridge command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    List,
    Connect { address: String, secure: bool },
    Disconnect,
    Write(Vec<u8>),
    Available,
    Read,
    ReadUntil(Vec<u8>),
    Subscribe(Vec<u8>),
    Unsubscribe,
    IsEnabled,
    IsConnected,
    Clear,
    IsDiscovering,
    StartDiscovery,
    StopDiscovery,
    IsPaired(String),
    Pair(String),
}

impl Action {
    /// Parse `name` with its positional arguments.
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, SerialError> {
        let action = match name {
            "list" => Action::List,
            "connect" => Action::Connect {
                address: string_arg(args, 0)?,
                secure: true,
            },
            "connectInsecure" => Action::Connect {
                address: string_arg(args, 0)?,
                secure: false,
            },
            "disconnect" => Action::Disconnect,
            "write" => Action::Write(bytes_arg(args, 0)?),
            "available" => Action::Available,
            "read" => Action::Read,
            "readUntil" => Action::ReadUntil(string_arg(args, 0)?.into_bytes()),
            "subscribe" => Action::Subscribe(string_arg(args, 0)?.into_bytes()),
            "unsubscribe" => Action::Unsubscribe,
            "isEnabled" => Action::IsEnabled,
            "isConnected" => Action::IsConnected,
            "clear" => Action::Clear,
            "isDiscovering" => Action::IsDiscovering,
            "startDiscovery" => Action::StartDiscovery,
            "stopDiscovery" => Action::StopDiscovery,
            "isPaired" => Action::IsPaired(string_arg(args, 0)?),
            "pair" => Action::Pair(string_arg(args, 0)?),
            other => return Err(SerialError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<String, SerialError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(SerialError::InvalidArgument(format!(
            "argument {} must be a string, got {}",
            index, other
        ))),
        None => Err(SerialError::InvalidArgument(format!(
            "missing argument {}",
            index
        ))),
    }
}

/// Strings are sent as UTF-8; arrays are taken as raw bytes.
fn bytes_arg(args: &[Value], index: usize) -> Result<Vec<u8>, SerialError> {
    match args.get(index) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| {
                        SerialError::InvalidArgument(format!("{} is not a byte", item))
                    })
            })
            .collect(),
        _ => string_arg(args, index).map(String::into_bytes),
    }
}

/// Device as reported to the bridge.
#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub address: String,
    pub id: String,
    #[serde(rename = "class", skip_serializing_if = "Option::is_none")]
    pub device_class: Option<u32>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        let address = device.address.to_string();
        Self {
            name: device.name.clone(),
            id: address.clone(),
            address,
            device_class: device.device_class,
        }
    }
}

/// Error as reported to the bridge.
#[derive(Debug, Serialize)]
pub struct ErrorReply {
    pub message: String,
    pub code: i32,
}

impl From<&SerialError> for ErrorReply {
    fn from(err: &SerialError) -> Self {
        Self {
            message: err.to_string(),
            code: err.code(),
        }
    }
}

pub fn device_json(device: &Device) -> Value {
    serde_json::to_value(DeviceInfo::from(device)).unwrap_or(Value::Null)
}

pub fn error_json(err: &SerialError) -> Value {
    serde_json::to_value(ErrorReply::from(err)).unwrap_or(Value::Null)
}

fn text(bytes: Vec<u8>) -> Value {
    Value::String(String::from_utf8_lossy(&bytes).into_owned())
}

/// Result of a dispatched action.
pub enum Outcome {
    /// A single result.
    Done(Value),
    /// Repeated deliveries until the stream ends.
    Stream(BoxStream<'static, Result<Value, SerialError>>),
}

/// Run `action` against `manager`.
pub async fn dispatch(manager: &SerialManager, action: Action) -> Result<Outcome, SerialError> {
    let value = match action {
        Action::List => {
            let devices = manager.list().await?;
            Value::Array(devices.iter().map(device_json).collect())
        }
        Action::Connect { address, secure } => {
            manager.connect(&address, secure).await?;
            Value::Null
        }
        Action::Disconnect => {
            manager.stop().await?;
            Value::Null
        }
        Action::Write(data) => {
            manager.write(data).await?;
            Value::Null
        }
        Action::Available => Value::from(manager.available().await?),
        Action::Read => text(manager.read().await?),
        Action::ReadUntil(delimiter) => text(manager.read_until(delimiter).await?),
        Action::Subscribe(delimiter) => {
            let frames = manager
                .subscribe(delimiter)
                .await?
                .into_stream()
                .map(|frame| frame.map(text));
            return Ok(Outcome::Stream(frames.boxed()));
        }
        Action::Unsubscribe => {
            manager.unsubscribe().await?;
            Value::Null
        }
        Action::IsEnabled => {
            if !manager.is_enabled().await? {
                return Err(SerialError::Disabled);
            }
            Value::Null
        }
        Action::IsConnected => {
            if !manager.is_connected().await? {
                return Err(SerialError::NotConnected);
            }
            Value::Null
        }
        Action::Clear => {
            manager.clear().await?;
            Value::Null
        }
        Action::IsDiscovering => Value::Bool(manager.is_discovering().await?),
        Action::StartDiscovery => {
            let devices = manager
                .start_discovery()
                .await?
                .into_stream()
                .map(|event| match event {
                    DiscoveryEvent::DeviceFound(device) => Ok(device_json(&device)),
                    DiscoveryEvent::Finished => Ok(Value::Bool(false)),
                    DiscoveryEvent::Stopped(err) => Err(err),
                });
            return Ok(Outcome::Stream(devices.boxed()));
        }
        Action::StopDiscovery => {
            manager.stop_discovery().await?;
            Value::Null
        }
        Action::IsPaired(address) => Value::Bool(manager.is_paired(&address).await?),
        Action::Pair(address) => device_json(&manager.pair(&address).await?),
    };
    Ok(Outcome::Done(value))
}
