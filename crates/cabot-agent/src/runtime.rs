use std::{collections::BTreeMap, future::Future};

use async_trait::async_trait;
use cabot_proto::{Command, MessageLevel, StatusReport, SystemStatus};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{AgentClient, AgentConfig, AgentError, AgentResult, PollOutcome};

/// Executes delivered commands on the robot.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Runs `command`; the error text is reported to the dashboard verbatim.
    async fn handle(&self, command: &Command) -> Result<(), String>;

    /// Sent with every poll.
    async fn system_status(&self) -> SystemStatus {
        SystemStatus::Unknown
    }

    async fn image_tags(&self) -> Option<BTreeMap<String, String>> {
        None
    }
}

pub struct Agent<H> {
    client: AgentClient,
    handler: H,
}

impl<H: CommandHandler> Agent<H> {
    pub fn new(config: AgentConfig, handler: H) -> AgentResult<Self> {
        Ok(Self {
            client: AgentClient::new(config)?,
            handler,
        })
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Connects, then polls and executes commands until `shutdown` resolves. Returns an error
    /// only when connecting exhausts `max_connect_retries`.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> AgentResult<()> {
        tokio::select! {
            biased;
            _ = shutdown => {
                info!(client_id = %self.config().client_id, "agent shutting down");
                Ok(())
            }
            result = self.run_loop() => result,
        }
    }

    fn config(&self) -> &AgentConfig {
        self.client.config()
    }

    async fn run_loop(&self) -> AgentResult<()> {
        self.connect_with_retries().await?;
        loop {
            let status = self.handler.system_status().await;
            match self.client.poll(status).await {
                Ok(PollOutcome::Command(command)) => {
                    self.execute(&command).await;
                    sleep(self.config().poll_interval).await;
                }
                Ok(PollOutcome::Idle) => {}
                Ok(PollOutcome::Superseded) => {
                    debug!(client_id = %self.config().client_id, "poll superseded");
                    sleep(self.config().poll_interval).await;
                }
                Ok(PollOutcome::Unknown) => {
                    warn!(client_id = %self.config().client_id, "dashboard lost this client; reconnecting");
                    self.connect_with_retries().await?;
                }
                Err(err) => {
                    warn!(client_id = %self.config().client_id, error = %err, "poll failed");
                    sleep(self.config().retry_delay).await;
                }
            }
        }
    }

    async fn connect_with_retries(&self) -> AgentResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.client.connect().await {
                Ok(()) => {
                    info!(client_id = %self.config().client_id, attempts, "connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(client_id = %self.config().client_id, attempts, error = %err, "connect failed");
                    if self
                        .config()
                        .max_connect_retries
                        .is_some_and(|max| attempts >= max)
                    {
                        return Err(AgentError::ConnectFailed(attempts));
                    }
                    sleep(self.config().retry_delay).await;
                }
            }
        }
    }

    async fn execute(&self, command: &Command) {
        let kind = &command.kind;
        info!(client_id = %self.config().client_id, command = %kind, "executing command");
        self.report(MessageLevel::Info, format!("Executing {kind}..."))
            .await;
        match self.handler.handle(command).await {
            Ok(()) => {
                self.report(
                    MessageLevel::Success,
                    format!("{kind} completed successfully"),
                )
                .await
            }
            Err(err) => {
                warn!(client_id = %self.config().client_id, command = %kind, error = %err, "command failed");
                self.report(MessageLevel::Error, format!("Error {kind}: {err}"))
                    .await
            }
        }
    }

    async fn report(&self, level: MessageLevel, message: String) {
        let report = StatusReport {
            level,
            status: Some(self.handler.system_status().await),
            message: Some(message),
            tags: self.handler.image_tags().await,
        };
        if let Err(err) = self.client.send(&report).await {
            warn!(client_id = %self.config().client_id, error = %err, "failed to send status report");
        }
    }
}
