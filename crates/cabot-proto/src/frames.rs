//! Frames exchanged with observer (dashboard) WebSocket connections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClientId, ConnectionStatus, MessageLevel, SystemStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: MessageLevel,
}

/// One entry of the log shared by every robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_id: ClientId,
    pub message: String,
    pub level: MessageLevel,
}

/// Observer-facing projection of one robot. `connected` is derived from liveness and may
/// disagree with the stored `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSummary {
    pub id: ClientId,
    pub status: ConnectionStatus,
    pub connected: bool,
    pub system_status: SystemStatus,
    pub last_poll: Option<DateTime<Utc>>,
    pub images: BTreeMap<String, String>,
    pub messages: Vec<RobotMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotStateFrame {
    pub cabots: Vec<RobotSummary>,
    pub messages: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Release listing for a site repository, keyed the way agents consume it as env vars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteReleases {
    #[serde(rename = "CABOT_SITE_REPO")]
    pub repository: String,
    #[serde(rename = "CABOT_SITE_VERSION")]
    pub versions: Vec<String>,
    #[serde(rename = "CABOT_SITE")]
    pub site: String,
}

/// Observer → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverRequest {
    Refresh,
    Command {
        #[serde(rename = "cabotId")]
        cabot_id: ClientId,
        command: String,
        #[serde(rename = "commandOption", default)]
        command_option: Option<Value>,
    },
    RefreshTags {
        image_id: String,
    },
    UpdateImageName {
        image_id: String,
        image_name: String,
    },
    RefreshSite {
        repository: String,
    },
}

impl ObserverRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ObserverRequest::Refresh => "refresh",
            ObserverRequest::Command { .. } => "command",
            ObserverRequest::RefreshTags { .. } => "refresh_tags",
            ObserverRequest::UpdateImageName { .. } => "update_image_name",
            ObserverRequest::RefreshSite { .. } => "refresh_site",
        }
    }
}

/// Server → observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverFrame {
    RobotState(RobotStateFrame),
    CommandResponse {
        #[serde(rename = "cabotId")]
        cabot_id: ClientId,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RefreshTagsResponse {
        image_id: String,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UpdateImageNameResponse {
        image_id: String,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RefreshSiteResponse {
        repository: String,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        releases: Option<SiteReleases>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ObserverFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn robot_state_frame_is_flat_with_type_tag() {
        let frame = ObserverFrame::RobotState(RobotStateFrame::default());
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "robot_state", "cabots": [], "messages": [] }));
    }

    #[test]
    fn parses_dashboard_command_request() {
        let request: ObserverRequest = serde_json::from_value(json!({
            "type": "command",
            "cabotId": "cabot_1",
            "command": "ros-start",
            "commandOption": {}
        }))
        .unwrap();
        assert_eq!(request.kind(), "command");
        match request {
            ObserverRequest::Command {
                cabot_id, command, ..
            } => {
                assert_eq!(cabot_id, "cabot_1");
                assert_eq!(command, "ros-start");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn site_releases_use_env_names() {
        let releases = SiteReleases {
            repository: "cmu-cabot/cabot_sites_cmu".into(),
            versions: vec!["v1.0.0".into()],
            site: "cabot_site_cmu_3d".into(),
        };
        let value = serde_json::to_value(&releases).unwrap();
        assert_eq!(value["CABOT_SITE_REPO"], "cmu-cabot/cabot_sites_cmu");
        assert_eq!(value["CABOT_SITE_VERSION"][0], "v1.0.0");
        assert_eq!(value["CABOT_SITE"], "cabot_site_cmu_3d");
    }
}
