//! Cabot Agent: robot-side runtime for the dashboard long-poll protocol.
//!
//! Responsibilities:
//! - registering the robot with the dashboard (`connect`)
//! - long-polling for commands and handing them to a [`CommandHandler`]
//! - reporting progress, system status and image tags back (`send`)
//!
//! Executing commands (systemctl, docker pulls, reboots) is left to the handler.

mod client;
mod runtime;

use std::time::Duration;

pub use cabot_proto::{Command, MessageLevel, StatusReport, SystemStatus};
pub use client::{AgentClient, PollOutcome};
pub use runtime::{Agent, CommandHandler};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server url {0}")]
    InvalidUrl(String),
    #[error("server does not know client {0}")]
    UnknownClient(String),
    #[error("unexpected status {0} from server")]
    UnexpectedStatus(u16),
    #[error("gave up connecting after {0} attempts")]
    ConnectFailed(u32),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the dashboard, e.g. `http://dashboard:8000`.
    pub server_url: String,
    pub client_id: String,
    /// Pause after a failed request before retrying.
    pub retry_delay: Duration,
    /// Pause before the next poll after a command or a superseded poll.
    pub poll_interval: Duration,
    /// `None` retries forever.
    pub max_connect_retries: Option<u32>,
    /// Must outlast the server's poll timeout.
    pub request_timeout: Duration,
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_id: client_id.into(),
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_connect_retries: None,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Command types the stock robot agent understands. The server forwards any type verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    RosStart,
    RosStop,
    SystemReboot,
    SystemPoweroff,
    SoftwareUpdate,
    SiteUpdate,
    EnvUpdate,
}

impl CommandType {
    pub const ALL: [CommandType; 7] = [
        CommandType::RosStart,
        CommandType::RosStop,
        CommandType::SystemReboot,
        CommandType::SystemPoweroff,
        CommandType::SoftwareUpdate,
        CommandType::SiteUpdate,
        CommandType::EnvUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::RosStart => "ros-start",
            CommandType::RosStop => "ros-stop",
            CommandType::SystemReboot => "system-reboot",
            CommandType::SystemPoweroff => "system-poweroff",
            CommandType::SoftwareUpdate => "software_update",
            CommandType::SiteUpdate => "site_update",
            CommandType::EnvUpdate => "env_update",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_types_round_trip_names() {
        for kind in CommandType::ALL {
            assert_eq!(CommandType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandType::parse("debug"), None);
    }
}
