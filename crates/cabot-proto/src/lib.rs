//! Shared protocol definitions for dashboard ↔ robot agent ↔ observer communication.
//! Kept in a dedicated crate so the agent runtime can depend on the wire types
//! without pulling in the server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod frames;

pub use frames::*;

/// Opaque agent identifier; the primary key for every per-robot collection.
pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// Service status the agent reports on every poll (the `systemctl is-active` vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum SystemStatus {
    Active,
    Inactive,
    Failed,
    Deactivating,
    #[default]
    Unknown,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Active => "active",
            SystemStatus::Inactive => "inactive",
            SystemStatus::Failed => "failed",
            SystemStatus::Deactivating => "deactivating",
            SystemStatus::Unknown => "unknown",
        }
    }
}

impl From<String> for SystemStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => SystemStatus::Active,
            "inactive" => SystemStatus::Inactive,
            "failed" => SystemStatus::Failed,
            "deactivating" => SystemStatus::Deactivating,
            _ => SystemStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum MessageLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl From<String> for MessageLevel {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => MessageLevel::Success,
            "warning" | "warn" => MessageLevel::Warning,
            "error" => MessageLevel::Error,
            _ => MessageLevel::Info,
        }
    }
}

/// A command queued for one agent. The server never interprets `kind` or `options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedCommand {
    #[error("command must be a JSON object")]
    NotAnObject,
    #[error("command type is required")]
    MissingType,
    #[error("command options must be an object")]
    InvalidOptions,
}

impl Command {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Parses an operator-submitted command. Accepts both the `{type, options}` shape and the
    /// dashboard's `{command, commandOption}` shape.
    pub fn from_value(value: &Value) -> Result<Self, MalformedCommand> {
        let object = value.as_object().ok_or(MalformedCommand::NotAnObject)?;
        let kind = object
            .get("type")
            .or_else(|| object.get("command"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let options = object.get("options").or_else(|| object.get("commandOption"));
        Self::from_parts(kind, options)
    }

    pub fn from_parts(kind: &str, options: Option<&Value>) -> Result<Self, MalformedCommand> {
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(MalformedCommand::MissingType);
        }
        let options = match options {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(MalformedCommand::InvalidOptions),
        };
        Ok(Self {
            kind: kind.to_string(),
            options,
        })
    }
}

/// Body of `GET poll/{client_id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRequest {
    #[serde(rename = "systemStatus", alias = "system_status", default)]
    pub system_status: SystemStatus,
}

/// Body of `POST send/{client_id}`. `type` carries the level of `message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "type", default)]
    pub level: MessageLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SystemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl StatusReport {
    pub fn message(level: MessageLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            message: Some(text.into()),
            ..Self::default()
        }
    }
}
