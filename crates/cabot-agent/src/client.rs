use cabot_proto::{Command, PollRequest, StatusReport, SystemStatus};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::{AgentConfig, AgentError, AgentResult};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Command(Command),
    /// The poll timed out without a command; poll again.
    Idle,
    /// The server has no record of this client; reconnect first.
    Unknown,
    /// A newer poll from this client replaced this one.
    Superseded,
}

/// Thin HTTP client for the three agent endpoints.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base: Url,
    config: AgentConfig,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        let base = Url::parse(&config.server_url)
            .map_err(|err| AgentError::InvalidUrl(format!("{}: {err}", config.server_url)))?;
        if base.cannot_be_a_base() {
            return Err(AgentError::InvalidUrl(config.server_url.clone()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// `{base}/api/client/{action}/{client_id}`, with the id escaped as a single segment.
    fn endpoint(&self, action: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "client", action, self.config.client_id.as_str()]);
        }
        url
    }

    pub async fn connect(&self) -> AgentResult<()> {
        self.http
            .post(self.endpoint("connect"))
            .send()
            .await?
            .error_for_status()?;
        debug!(client_id = %self.config.client_id, "connected to dashboard");
        Ok(())
    }

    pub async fn poll(&self, system_status: SystemStatus) -> AgentResult<PollOutcome> {
        let response = self
            .http
            .get(self.endpoint("poll"))
            .json(&PollRequest { system_status })
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(PollOutcome::Command(response.json::<Command>().await?)),
            StatusCode::NO_CONTENT => Ok(PollOutcome::Idle),
            StatusCode::NOT_FOUND => Ok(PollOutcome::Unknown),
            StatusCode::CONFLICT => Ok(PollOutcome::Superseded),
            other => Err(AgentError::UnexpectedStatus(other.as_u16())),
        }
    }

    pub async fn send(&self, report: &StatusReport) -> AgentResult<()> {
        let response = self
            .http
            .post(self.endpoint("send"))
            .json(report)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AgentError::UnknownClient(self.config.client_id.clone()));
        }
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::Path,
        http::StatusCode as HttpStatus,
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use cabot_proto::MessageLevel;

    use super::*;

    async fn poll_stub(Path(client_id): Path<String>) -> Response {
        match client_id.as_str() {
            "busy" => Json(Command::new("ros-start")).into_response(),
            "idle" => HttpStatus::NO_CONTENT.into_response(),
            "stale" => HttpStatus::CONFLICT.into_response(),
            "broken" => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
            "lab/cabot?2#a" => Json(Command::new("ros-stop")).into_response(),
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn send_stub(Path(client_id): Path<String>) -> HttpStatus {
        if client_id == "ghost" {
            HttpStatus::NOT_FOUND
        } else {
            HttpStatus::OK
        }
    }

    async fn stub_server() -> String {
        let router = Router::new()
            .route("/api/client/poll/:client_id", get(poll_stub))
            .route("/api/client/send/:client_id", post(send_stub))
            .route("/api/client/connect/:client_id", post(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}/")
    }

    fn client(base: &str, id: &str) -> AgentClient {
        AgentClient::new(AgentConfig::new(base, id)).unwrap()
    }

    #[tokio::test]
    async fn maps_poll_statuses() {
        let base = stub_server().await;
        let cases = [
            ("busy", PollOutcome::Command(Command::new("ros-start"))),
            ("idle", PollOutcome::Idle),
            ("stale", PollOutcome::Superseded),
            ("ghost", PollOutcome::Unknown),
        ];
        for (id, expected) in cases {
            let outcome = client(&base, id).poll(SystemStatus::Active).await.unwrap();
            assert_eq!(outcome, expected, "client {id}");
        }
        assert!(matches!(
            client(&base, "broken").poll(SystemStatus::Active).await,
            Err(AgentError::UnexpectedStatus(500))
        ));
    }

    #[tokio::test]
    async fn client_id_is_sent_as_one_path_segment() {
        let base = stub_server().await;
        let robot = client(&base, "lab/cabot?2#a");
        assert_eq!(
            robot.endpoint("poll").path(),
            "/api/client/poll/lab%2Fcabot%3F2%23a"
        );
        let outcome = robot.poll(SystemStatus::Active).await.unwrap();
        assert_eq!(outcome, PollOutcome::Command(Command::new("ros-stop")));
    }

    #[test]
    fn rejects_unusable_server_urls() {
        for url in ["not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                AgentClient::new(AgentConfig::new(url, "cabot_1")),
                Err(AgentError::InvalidUrl(_))
            ));
        }
    }

    #[tokio::test]
    async fn connect_and_send() {
        let base = stub_server().await;
        let robot = client(&base, "cabot_1");
        robot.connect().await.unwrap();
        robot
            .send(&StatusReport::message(MessageLevel::Info, "hello"))
            .await
            .unwrap();

        let err = client(&base, "ghost")
            .send(&StatusReport::message(MessageLevel::Info, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownClient(id) if id == "ghost"));
    }
}
