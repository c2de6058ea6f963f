use std::time::Duration;

use serde::Deserialize;

use crate::store::StoreSettings;

pub const ENV_PREFIX: &str = "CABOT_DASHBOARD";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_liveness_grace_secs")]
    pub liveness_grace_secs: u64,
    #[serde(default = "default_message_capacity")]
    pub robot_message_capacity: usize,
    #[serde(default = "default_message_capacity")]
    pub global_message_capacity: usize,
    #[serde(default = "default_message_window_secs")]
    pub message_window_secs: u64,
    #[serde(default = "default_message_display_count")]
    pub message_display_count: usize,
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
    #[serde(default = "default_image_ids")]
    pub image_ids: String,
    #[serde(default = "default_docker_hub_url")]
    pub docker_hub_url: String,
    #[serde(default = "default_docker_org")]
    pub docker_org: String,
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
    #[serde(default = "default_github_org")]
    pub github_org: String,
    #[serde(default)]
    pub github_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
            log_path: None,
            poll_timeout_secs: default_poll_timeout_secs(),
            liveness_grace_secs: default_liveness_grace_secs(),
            robot_message_capacity: default_message_capacity(),
            global_message_capacity: default_message_capacity(),
            message_window_secs: default_message_window_secs(),
            message_display_count: default_message_display_count(),
            observer_buffer: default_observer_buffer(),
            image_ids: default_image_ids(),
            docker_hub_url: default_docker_hub_url(),
            docker_org: default_docker_org(),
            github_api_url: default_github_api_url(),
            github_org: default_github_org(),
            github_token: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|err| {
                // tracing is not installed yet
                eprintln!("[cabot-dashboard] invalid {ENV_PREFIX}_* configuration ({err}); using defaults");
                AppConfig::default().normalize()
            })
    }

    fn normalize(mut self) -> Self {
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.github_token = Self::normalize_opt(self.github_token.take());
        self.docker_hub_url = self.docker_hub_url.trim().trim_end_matches('/').to_string();
        self.github_api_url = self.github_api_url.trim().trim_end_matches('/').to_string();
        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
        self.observer_buffer = self.observer_buffer.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// A robot parked in a full-length poll must still count as live.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs + self.liveness_grace_secs)
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.image_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            liveness_timeout: self.liveness_timeout(),
            robot_message_capacity: self.robot_message_capacity,
            global_message_capacity: self.global_message_capacity,
            message_window: Duration::from_secs(self.message_window_secs),
            message_display_count: self.message_display_count,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".into()
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_poll_timeout_secs() -> u64 {
    240
}

fn default_liveness_grace_secs() -> u64 {
    10
}

fn default_message_capacity() -> usize {
    100
}

fn default_message_window_secs() -> u64 {
    300
}

fn default_message_display_count() -> usize {
    10
}

fn default_observer_buffer() -> usize {
    64
}

fn default_image_ids() -> String {
    "image1,image2,image3".into()
}

fn default_docker_hub_url() -> String {
    "https://hub.docker.com/v2".into()
}

fn default_docker_org() -> String {
    "cmucal".into()
}

fn default_github_api_url() -> String {
    "https://api.github.com".into()
}

fn default_github_org() -> String {
    "cmu-cabot".into()
}
