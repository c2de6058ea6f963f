//! Observer fan-out.
//!
//! Each observer owns a bounded channel drained by its websocket writer task. Publishing never
//! waits on an observer: a closed or full channel counts as a failed send and drops that
//! observer without affecting the rest.
//!
//! Snapshots are taken and fanned out under one publish lock, so the last frame every observer
//! holds always matches the latest state.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use cabot_proto::{ObserverFrame, ObserverRequest, ResponseStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{
    log_throttle::{LogKind, LogThrottle},
    metrics,
    services::{CollaboratorError, ReleaseSource, TagSource},
    store::RobotStateStore,
};

pub type ObserverId = u64;

/// Send failures share one throttle slot; observer ids are never reused.
const OBSERVER_FAILURE_KEY: &str = "observer";

/// Serialized frame shared by every observer it is sent to.
pub type FrameText = Arc<str>;

pub struct BroadcastHub {
    store: Arc<RobotStateStore>,
    observers: RwLock<HashMap<ObserverId, mpsc::Sender<FrameText>>>,
    /// Orders snapshot-then-send across concurrent publishers.
    publish_lock: Mutex<()>,
    next_id: AtomicU64,
    buffer: usize,
    tags: Arc<dyn TagSource>,
    releases: Arc<dyn ReleaseSource>,
    throttle: Arc<LogThrottle>,
}

impl BroadcastHub {
    pub fn new(
        store: Arc<RobotStateStore>,
        buffer: usize,
        tags: Arc<dyn TagSource>,
        releases: Arc<dyn ReleaseSource>,
        throttle: Arc<LogThrottle>,
    ) -> Self {
        Self {
            store,
            observers: RwLock::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            tags,
            releases,
            throttle,
        }
    }

    /// Tracks a new observer and queues the current state as its first frame.
    pub fn register(&self) -> (ObserverId, mpsc::Receiver<FrameText>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        {
            let _order = self.publish_lock.lock();
            if let Some(text) = encode(&self.state_frame()) {
                let _ = tx.try_send(text);
            }
            self.observers.write().insert(id, tx);
        }
        metrics::OBSERVERS_CONNECTED.inc();
        debug!(observer_id = id, "observer registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().remove(&id).is_some();
        if removed {
            metrics::OBSERVERS_CONNECTED.dec();
            debug!(observer_id = id, "observer unregistered");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Sends `frame` to every observer registered at call time. Returns how many accepted it.
    pub fn publish(&self, frame: &ObserverFrame) -> usize {
        let _order = self.publish_lock.lock();
        self.fan_out(frame)
    }

    fn fan_out(&self, frame: &ObserverFrame) -> usize {
        let Some(text) = encode(frame) else {
            return 0;
        };
        let targets: Vec<(ObserverId, mpsc::Sender<FrameText>)> = self
            .observers
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.record_failure(id, &err);
                    failed.push(id);
                }
            }
        }
        for id in failed {
            self.unregister(id);
        }
        delivered
    }

    /// Sends `frame` to one observer only.
    pub fn reply(&self, id: ObserverId, frame: &ObserverFrame) -> bool {
        let Some(text) = encode(frame) else {
            return false;
        };
        let Some(tx) = self.observers.read().get(&id).cloned() else {
            return false;
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(err) => {
                self.record_failure(id, &err);
                self.unregister(id);
                false
            }
        }
    }

    /// Pushes a fresh state frame to everyone. Never blocks the caller.
    pub fn notify_on_change(&self) {
        let _order = self.publish_lock.lock();
        if self.observers.read().is_empty() {
            return;
        }
        self.fan_out(&self.state_frame());
    }

    pub fn state_frame(&self) -> ObserverFrame {
        ObserverFrame::RobotState(self.store.snapshot())
    }

    /// Answers the request/response frames that do not touch robot state. `command` frames
    /// need the dispatch path and yield `None`.
    pub async fn handle_request(&self, request: &ObserverRequest) -> Option<ObserverFrame> {
        let frame = match request {
            ObserverRequest::Refresh => self.state_frame(),
            ObserverRequest::RefreshTags { image_id } => {
                match self.tags.fetch_tags(image_id).await {
                    Ok(tags) => ObserverFrame::RefreshTagsResponse {
                        image_id: image_id.clone(),
                        status: ResponseStatus::Success,
                        tags: Some(tags),
                        message: None,
                    },
                    Err(err) => {
                        error!(image_id = %image_id, error = %err, "failed to fetch tags");
                        ObserverFrame::RefreshTagsResponse {
                            image_id: image_id.clone(),
                            status: ResponseStatus::Error,
                            tags: None,
                            message: Some(format!("Failed to fetch tags: {err}")),
                        }
                    }
                }
            }
            ObserverRequest::UpdateImageName {
                image_id,
                image_name,
            } => self.update_image_name(image_id, image_name).await,
            ObserverRequest::RefreshSite { repository } => {
                match self.releases.fetch_site_releases(repository).await {
                    Ok(releases) => ObserverFrame::RefreshSiteResponse {
                        repository: repository.clone(),
                        status: ResponseStatus::Success,
                        releases: Some(releases),
                        message: None,
                    },
                    Err(err) => {
                        error!(repository = %repository, error = %err, "failed to fetch site releases");
                        ObserverFrame::RefreshSiteResponse {
                            repository: repository.clone(),
                            status: ResponseStatus::Error,
                            releases: None,
                            message: Some(format!("Failed to fetch site releases: {err}")),
                        }
                    }
                }
            }
            ObserverRequest::Command { .. } => return None,
        };
        Some(frame)
    }

    async fn update_image_name(&self, image_id: &str, image_name: &str) -> ObserverFrame {
        let failure = |message: String| ObserverFrame::UpdateImageNameResponse {
            image_id: image_id.to_string(),
            status: ResponseStatus::Error,
            image_name: None,
            message: Some(message),
        };
        if let Err(err) = self.tags.update_image_name(image_id, image_name).await {
            return match err {
                CollaboratorError::UnknownImage(_) => failure("Repository not found".into()),
                other => failure(format!("Failed to update image name: {other}")),
            };
        }
        if let Err(err) = self.tags.fetch_tags(image_id).await {
            error!(image_id = %image_id, error = %err, "failed to refresh tags after rename");
            return failure(format!("Failed to update image name: {err}"));
        }
        ObserverFrame::UpdateImageNameResponse {
            image_id: image_id.to_string(),
            status: ResponseStatus::Success,
            image_name: Some(image_name.to_string()),
            message: None,
        }
    }

    fn record_failure<T>(&self, id: ObserverId, err: &mpsc::error::TrySendError<T>) {
        metrics::BROADCAST_FAILURES.inc();
        let reason = match err {
            mpsc::error::TrySendError::Full(_) => "buffer full",
            mpsc::error::TrySendError::Closed(_) => "connection closed",
        };
        if self
            .throttle
            .should_log(LogKind::ObserverSendFailure, OBSERVER_FAILURE_KEY)
        {
            warn!(observer_id = id, reason, "dropping observer after failed send");
        }
    }
}

fn encode(frame: &ObserverFrame) -> Option<FrameText> {
    match frame.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            error!(error = %err, "failed to serialize observer frame");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use cabot_proto::{MessageLevel, SiteReleases};
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;
    use crate::store::StoreSettings;

    /// In-memory stand-ins for the Docker Hub and GitHub collaborators.
    #[derive(Default)]
    pub(crate) struct FakeCollaborators {
        pub names: Mutex<BTreeMap<String, String>>,
    }

    #[async_trait]
    impl TagSource for FakeCollaborators {
        async fn fetch_tags(&self, image_id: &str) -> Result<Vec<String>, CollaboratorError> {
            match image_id {
                "image1" | "image2" => {
                    let name = self
                        .names
                        .lock()
                        .get(image_id)
                        .cloned()
                        .unwrap_or_else(|| image_id.to_string());
                    Ok(vec![format!("{name}:latest")])
                }
                "broken" => Err(CollaboratorError::Decode("upstream down".into())),
                other => Err(CollaboratorError::UnknownImage(other.to_string())),
            }
        }

        async fn update_image_name(
            &self,
            image_id: &str,
            name: &str,
        ) -> Result<(), CollaboratorError> {
            if image_id != "image1" && image_id != "image2" {
                return Err(CollaboratorError::UnknownImage(image_id.to_string()));
            }
            self.names
                .lock()
                .insert(image_id.to_string(), name.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeCollaborators {
        async fn fetch_site_releases(
            &self,
            repository: &str,
        ) -> Result<SiteReleases, CollaboratorError> {
            Ok(SiteReleases {
                repository: format!("cmu-cabot/{repository}"),
                versions: vec!["v1.0.0".into()],
                site: crate::services::site_name(repository),
            })
        }
    }

    fn hub_with_buffer(buffer: usize) -> (Arc<RobotStateStore>, BroadcastHub) {
        let store = Arc::new(RobotStateStore::new(StoreSettings::default()));
        let fakes = Arc::new(FakeCollaborators::default());
        let hub = BroadcastHub::new(
            store.clone(),
            buffer,
            fakes.clone(),
            fakes,
            Arc::new(LogThrottle::new()),
        );
        (store, hub)
    }

    fn frame_type(text: &str) -> String {
        let value: Value = serde_json::from_str(text).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn registration_sends_initial_state() {
        let (store, hub) = hub_with_buffer(8);
        store.connect("r1");
        let (_id, mut rx) = hub.register();
        let first = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["type"], "robot_state");
        assert_eq!(value["cabots"][0]["id"], "r1");
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_every_observer_with_identical_frames() {
        let (store, hub) = hub_with_buffer(8);
        let (_a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        store.connect("r1");
        store
            .record_message("r1", "hello", MessageLevel::Info)
            .unwrap();
        hub.notify_on_change();

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("hello"));
    }

    #[tokio::test]
    async fn failed_observer_is_dropped_without_affecting_others() {
        let (_store, hub) = hub_with_buffer(8);
        let (_gone, rx_gone) = hub.register();
        let (_live, mut rx_live) = hub.register();
        drop(rx_gone);
        rx_live.recv().await.unwrap();

        let delivered = hub.publish(&hub.state_frame());
        assert_eq!(delivered, 1);
        assert_eq!(hub.observer_count(), 1);
        assert_eq!(frame_type(&rx_live.recv().await.unwrap()), "robot_state");
    }

    #[tokio::test]
    async fn observer_failures_share_one_throttle_slot() {
        let store = Arc::new(RobotStateStore::new(StoreSettings::default()));
        let fakes = Arc::new(FakeCollaborators::default());
        let throttle = Arc::new(LogThrottle::new());
        let hub = BroadcastHub::new(store, 8, fakes.clone(), fakes, throttle.clone());
        let (_a, rx_a) = hub.register();
        let (_b, rx_b) = hub.register();
        drop(rx_a);
        drop(rx_b);

        assert_eq!(hub.publish(&hub.state_frame()), 0);
        assert_eq!(hub.observer_count(), 0);
        // the first failure already took the slot for this interval
        assert!(!throttle.should_log(LogKind::ObserverSendFailure, OBSERVER_FAILURE_KEY));
    }

    #[tokio::test]
    async fn slow_observer_counts_as_failed() {
        let (_store, hub) = hub_with_buffer(1);
        // initial frame fills the buffer and is never drained
        let (slow, _rx_slow) = hub.register();
        let (_fast, mut rx_fast) = hub.register();
        rx_fast.recv().await.unwrap();

        assert_eq!(hub.publish(&hub.state_frame()), 1);
        assert!(!hub.unregister(slow));
    }

    #[tokio::test]
    async fn reply_goes_to_requester_only() {
        let (_store, hub) = hub_with_buffer(8);
        let (a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        let request = ObserverRequest::RefreshTags {
            image_id: "image1".into(),
        };
        let response = hub.handle_request(&request).await.unwrap();
        assert!(hub.reply(a, &response));

        let text = rx_a.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "refresh_tags_response");
        assert_eq!(value["status"], "success");
        assert_eq!(value["tags"][0], "image1:latest");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn collaborator_failures_become_error_envelopes() {
        let (_store, hub) = hub_with_buffer(8);
        let response = hub
            .handle_request(&ObserverRequest::RefreshTags {
                image_id: "broken".into(),
            })
            .await
            .unwrap();
        match response {
            ObserverFrame::RefreshTagsResponse {
                status, message, ..
            } => {
                assert_eq!(status, ResponseStatus::Error);
                assert!(message.unwrap().starts_with("Failed to fetch tags"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let response = hub
            .handle_request(&ObserverRequest::UpdateImageName {
                image_id: "image9".into(),
                image_name: "x".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            ObserverFrame::UpdateImageNameResponse { status: ResponseStatus::Error, message: Some(ref m), .. }
                if m == "Repository not found"
        ));
    }

    #[tokio::test]
    async fn rename_then_refresh_site() {
        let (_store, hub) = hub_with_buffer(8);
        let response = hub
            .handle_request(&ObserverRequest::UpdateImageName {
                image_id: "image2".into(),
                image_name: "cabot-ros".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            ObserverFrame::UpdateImageNameResponse {
                image_id: "image2".into(),
                status: ResponseStatus::Success,
                image_name: Some("cabot-ros".into()),
                message: None,
            }
        );

        let response = hub
            .handle_request(&ObserverRequest::RefreshSite {
                repository: "cabot_sites_cmu".into(),
            })
            .await
            .unwrap();
        match response {
            ObserverFrame::RefreshSiteResponse {
                status, releases, ..
            } => {
                assert_eq!(status, ResponseStatus::Success);
                assert_eq!(releases.unwrap().site, "cabot_site_cmu_3d");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert!(hub
            .handle_request(&ObserverRequest::Command {
                cabot_id: "r1".into(),
                command: "ros-start".into(),
                command_option: None,
            })
            .await
            .is_none());
    }
}
