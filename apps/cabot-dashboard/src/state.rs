use std::{sync::Arc, time::Duration};

use cabot_proto::{
    Command, MalformedCommand, ObserverFrame, ObserverRequest, ResponseStatus, StatusReport,
    SystemStatus,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    hub::BroadcastHub,
    log_throttle::{LogKind, LogThrottle},
    metrics,
    queue::{CommandQueue, EnqueueOutcome, QueueError},
    services::{DockerHubTags, GithubReleases, ReleaseSource, TagSource},
    store::{PollTicket, RobotStateStore, StoreError},
};

/// Shared handles injected into every route. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    queue: Arc<CommandQueue>,
    store: Arc<RobotStateStore>,
    hub: Arc<BroadcastHub>,
    throttle: Arc<LogThrottle>,
    poll_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("malformed command: {0}")]
    Malformed(#[from] MalformedCommand),
    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl AppState {
    pub fn new(config: &AppConfig) -> Result<Self, StateError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(StateError::HttpClient)?;
        let tags = Arc::new(DockerHubTags::new(
            http.clone(),
            &config.docker_hub_url,
            &config.docker_org,
            config.image_ids(),
        ));
        let releases = Arc::new(GithubReleases::new(
            http,
            &config.github_api_url,
            &config.github_org,
            config.github_token.clone(),
        ));
        Ok(Self::with_collaborators(config, tags, releases))
    }

    pub fn with_collaborators(
        config: &AppConfig,
        tags: Arc<dyn TagSource>,
        releases: Arc<dyn ReleaseSource>,
    ) -> Self {
        let throttle = Arc::new(LogThrottle::new());
        let store = Arc::new(RobotStateStore::new(config.store_settings()));
        let hub = Arc::new(BroadcastHub::new(
            store.clone(),
            config.observer_buffer,
            tags,
            releases,
            throttle.clone(),
        ));
        Self {
            queue: Arc::new(CommandQueue::new()),
            store,
            hub,
            throttle,
            poll_timeout: config.poll_timeout(),
        }
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn store(&self) -> &RobotStateStore {
        &self.store
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn connect(&self, client_id: &str) {
        self.store.connect(client_id);
        self.queue.initialize(client_id);
        info!(client_id = %client_id, "robot connected");
        self.hub.notify_on_change();
    }

    /// One long-poll cycle. Resolves with the next command, or `Timeout` / `Superseded` /
    /// `ClientRemoved`. Unless a command was delivered, the robot is marked disconnected when
    /// the poll ends, including when the caller drops this future.
    pub async fn poll(
        &self,
        client_id: &str,
        system_status: SystemStatus,
    ) -> Result<Command, StateError> {
        let ticket = match self.store.record_poll(client_id, system_status) {
            Ok(ticket) => ticket,
            Err(err) => {
                if self.throttle.should_log(LogKind::UnknownClientPoll, client_id) {
                    warn!(client_id = %client_id, "poll from unknown client");
                }
                return Err(err.into());
            }
        };
        debug!(client_id = %client_id, system_status = system_status.as_str(), "poll started");
        self.hub.notify_on_change();

        let mut lease = PollLease {
            state: self,
            client_id,
            ticket,
            settled: false,
        };
        let result = self.queue.await_command(client_id, self.poll_timeout).await;
        let outcome = match &result {
            Ok(command) => {
                lease.settled = true;
                metrics::COMMANDS_DELIVERED
                    .with_label_values(&[client_id])
                    .inc();
                info!(client_id = %client_id, command = %command.kind, "command delivered");
                "command"
            }
            Err(QueueError::Timeout) => "timeout",
            Err(QueueError::Superseded) => {
                debug!(client_id = %client_id, "poll superseded by a newer poll");
                "superseded"
            }
            Err(QueueError::ClientRemoved) => "removed",
        };
        metrics::POLLS.with_label_values(&[client_id, outcome]).inc();
        result.map_err(StateError::from)
    }

    pub fn report(&self, client_id: &str, report: StatusReport) -> Result<(), StateError> {
        if !self.store.contains(client_id) {
            if self
                .throttle
                .should_log(LogKind::UnknownClientReport, client_id)
            {
                warn!(client_id = %client_id, "status report from unknown client");
            }
            return Err(StoreError::ClientNotFound(client_id.to_string()).into());
        }
        metrics::STATUS_REPORTS.with_label_values(&[client_id]).inc();
        if let Some(status) = report.status {
            self.store.record_system_status(client_id, status)?;
        }
        if let Some(tags) = report.tags {
            self.store.record_image_tags(client_id, tags)?;
        }
        if let Some(message) = report.message {
            debug!(client_id = %client_id, level = ?report.level, message = %message, "status report");
            self.store.record_message(client_id, message, report.level)?;
        }
        self.hub.notify_on_change();
        Ok(())
    }

    /// Queues `command` for a robot that has been seen within the liveness timeout.
    pub fn dispatch(&self, client_id: &str, command: Command) -> Result<EnqueueOutcome, StateError> {
        self.store.ensure_live(client_id)?;
        let kind = command.kind.clone();
        let outcome = self.queue.enqueue(client_id, command);
        metrics::COMMANDS_ENQUEUED
            .with_label_values(&[client_id])
            .inc();
        info!(client_id = %client_id, command = %kind, ?outcome, "command dispatched");
        Ok(outcome)
    }

    pub fn remove(&self, client_id: &str) -> Result<(), StateError> {
        let known = self.store.remove(client_id);
        let queued = self.queue.remove_client(client_id);
        if !known && !queued {
            return Err(StoreError::ClientNotFound(client_id.to_string()).into());
        }
        info!(client_id = %client_id, "robot removed");
        self.hub.notify_on_change();
        Ok(())
    }

    /// Produces the frame sent back to the observer that issued `request`.
    pub async fn handle_observer_request(&self, request: &ObserverRequest) -> ObserverFrame {
        if let ObserverRequest::Command {
            cabot_id,
            command,
            command_option,
        } = request
        {
            let result = Command::from_parts(command, command_option.as_ref())
                .map_err(StateError::from)
                .and_then(|command| self.dispatch(cabot_id, command));
            return match result {
                Ok(_) => ObserverFrame::CommandResponse {
                    cabot_id: cabot_id.clone(),
                    status: ResponseStatus::Success,
                    message: None,
                },
                Err(err) => {
                    warn!(client_id = %cabot_id, error = %err, "observer command rejected");
                    ObserverFrame::CommandResponse {
                        cabot_id: cabot_id.clone(),
                        status: ResponseStatus::Error,
                        message: Some(err.to_string()),
                    }
                }
            };
        }
        match self.hub.handle_request(request).await {
            Some(frame) => frame,
            None => ObserverFrame::Error {
                message: format!("unsupported request: {}", request.kind()),
            },
        }
    }
}

/// Runs the poll-ended transition unless the poll handed out a command.
struct PollLease<'a> {
    state: &'a AppState,
    client_id: &'a str,
    ticket: PollTicket,
    settled: bool,
}

impl Drop for PollLease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.state.store.finish_poll(self.client_id, self.ticket) {
            debug!(client_id = %self.client_id, "poll ended");
            self.state.hub.notify_on_change();
        }
    }
}
