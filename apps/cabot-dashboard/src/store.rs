use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};

use cabot_proto::{
    ClientId, ConnectionStatus, LogEntry, MessageLevel, RobotMessage, RobotStateFrame,
    RobotSummary, SystemStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub liveness_timeout: Duration,
    pub robot_message_capacity: usize,
    pub global_message_capacity: usize,
    /// Only messages younger than this reach observers.
    pub message_window: Duration,
    pub message_display_count: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(250),
            robot_message_capacity: 100,
            global_message_capacity: 100,
            message_window: Duration::from_secs(300),
            message_display_count: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("client not found: {0}")]
    ClientNotFound(ClientId),
    #[error("client {0} has not polled within the liveness timeout")]
    NotConnected(ClientId),
}

/// Identifies one poll cycle so a finished poll cannot clobber state written by a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket(u64);

struct RobotRecord {
    connection_status: ConnectionStatus,
    system_status: SystemStatus,
    last_poll_at: Option<DateTime<Utc>>,
    last_seen: Instant,
    poll_epoch: u64,
    image_tags: BTreeMap<String, String>,
    messages: VecDeque<(Instant, RobotMessage)>,
}

impl RobotRecord {
    fn new(now: Instant) -> Self {
        Self {
            connection_status: ConnectionStatus::Unknown,
            system_status: SystemStatus::Unknown,
            last_poll_at: None,
            last_seen: now,
            poll_epoch: 0,
            image_tags: BTreeMap::new(),
            messages: VecDeque::new(),
        }
    }

    fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) < timeout
    }

    fn mark_seen(&mut self, now: Instant) {
        self.connection_status = ConnectionStatus::Connected;
        self.last_poll_at = Some(Utc::now());
        self.last_seen = now;
        self.poll_epoch += 1;
    }
}

#[derive(Default)]
struct StoreInner {
    robots: HashMap<ClientId, RobotRecord>,
    log: VecDeque<LogEntry>,
}

/// Authoritative client → robot state map. Liveness is derived from elapsed time on every
/// read, never stored.
pub struct RobotStateStore {
    settings: StoreSettings,
    inner: RwLock<StoreInner>,
}

impl RobotStateStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            settings,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Creates the record or revives an existing one, keeping its messages and image tags.
    pub fn connect(&self, client_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let record = inner
            .robots
            .entry(client_id.to_string())
            .or_insert_with(|| RobotRecord::new(now));
        record.mark_seen(now);
        record.system_status = SystemStatus::Unknown;
    }

    pub fn record_poll(
        &self,
        client_id: &str,
        system_status: SystemStatus,
    ) -> Result<PollTicket, StoreError> {
        let now = Instant::now();
        self.with_record(client_id, |record| {
            record.mark_seen(now);
            record.system_status = system_status;
            PollTicket(record.poll_epoch)
        })
    }

    /// Marks the robot disconnected with unknown status, unless a newer poll or connect has
    /// happened since `ticket` was issued. Returns whether anything changed.
    pub fn finish_poll(&self, client_id: &str, ticket: PollTicket) -> bool {
        let mut inner = self.inner.write();
        match inner.robots.get_mut(client_id) {
            Some(record) if record.poll_epoch == ticket.0 => {
                record.connection_status = ConnectionStatus::Disconnected;
                record.system_status = SystemStatus::Unknown;
                true
            }
            _ => false,
        }
    }

    pub fn record_message(
        &self,
        client_id: &str,
        message: impl Into<String>,
        level: MessageLevel,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let entry = RobotMessage {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        };
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let record = inner
            .robots
            .get_mut(client_id)
            .ok_or_else(|| StoreError::ClientNotFound(client_id.to_string()))?;
        push_bounded(
            &mut record.messages,
            (now, entry.clone()),
            self.settings.robot_message_capacity,
        );
        push_bounded(
            &mut inner.log,
            LogEntry {
                timestamp: entry.timestamp,
                client_id: client_id.to_string(),
                message: entry.message,
                level,
            },
            self.settings.global_message_capacity,
        );
        Ok(())
    }

    /// Replaces the tag map wholesale.
    pub fn record_image_tags(
        &self,
        client_id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.with_record(client_id, |record| record.image_tags = tags)
    }

    pub fn record_system_status(
        &self,
        client_id: &str,
        status: SystemStatus,
    ) -> Result<(), StoreError> {
        self.with_record(client_id, |record| record.system_status = status)
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.inner.write().robots.remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.read().robots.contains_key(client_id)
    }

    /// Commands are accepted for known robots seen within the liveness timeout, including
    /// between two polls.
    pub fn ensure_live(&self, client_id: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let inner = self.inner.read();
        let record = inner
            .robots
            .get(client_id)
            .ok_or_else(|| StoreError::ClientNotFound(client_id.to_string()))?;
        if record.is_live(now, self.settings.liveness_timeout) {
            Ok(())
        } else {
            Err(StoreError::NotConnected(client_id.to_string()))
        }
    }

    /// Observer projection: robots sorted by id, recent messages newest-first within the
    /// freshness window, and the global log newest-first.
    pub fn snapshot(&self) -> RobotStateFrame {
        let now = Instant::now();
        let inner = self.inner.read();
        let mut cabots: Vec<RobotSummary> = inner
            .robots
            .iter()
            .map(|(id, record)| self.summarize(id, record, now))
            .collect();
        cabots.sort_by(|a, b| a.id.cmp(&b.id));
        RobotStateFrame {
            cabots,
            messages: inner.log.iter().rev().cloned().collect(),
        }
    }

    pub fn messages(&self, limit: usize) -> Vec<LogEntry> {
        self.inner
            .read()
            .log
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Full retained history for one robot, newest-first, ignoring the freshness window.
    pub fn robot_messages(&self, client_id: &str) -> Result<Vec<RobotMessage>, StoreError> {
        let inner = self.inner.read();
        let record = inner
            .robots
            .get(client_id)
            .ok_or_else(|| StoreError::ClientNotFound(client_id.to_string()))?;
        Ok(record
            .messages
            .iter()
            .rev()
            .map(|(_, message)| message.clone())
            .collect())
    }

    fn summarize(&self, id: &str, record: &RobotRecord, now: Instant) -> RobotSummary {
        let live = record.is_live(now, self.settings.liveness_timeout);
        let (status, system_status) = if live {
            (record.connection_status, record.system_status)
        } else {
            (ConnectionStatus::Disconnected, SystemStatus::Unknown)
        };
        let messages = record
            .messages
            .iter()
            .rev()
            .take_while(|(at, _)| now.duration_since(*at) <= self.settings.message_window)
            .take(self.settings.message_display_count)
            .map(|(_, message)| message.clone())
            .collect();
        RobotSummary {
            id: id.to_string(),
            status,
            connected: status == ConnectionStatus::Connected,
            system_status,
            last_poll: record.last_poll_at,
            images: record.image_tags.clone(),
            messages,
        }
    }

    fn with_record<T>(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut RobotRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.write();
        let record = inner
            .robots
            .get_mut(client_id)
            .ok_or_else(|| StoreError::ClientNotFound(client_id.to_string()))?;
        Ok(f(record))
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RobotStateStore {
        RobotStateStore::new(StoreSettings {
            liveness_timeout: Duration::from_secs(30),
            robot_message_capacity: 5,
            global_message_capacity: 8,
            message_window: Duration::from_secs(60),
            message_display_count: 3,
        })
    }

    fn robot<'a>(frame: &'a RobotStateFrame, id: &str) -> &'a RobotSummary {
        frame.cabots.iter().find(|r| r.id == id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_is_derived_from_elapsed_time() {
        let store = store();
        store.connect("r1");
        store.record_poll("r1", SystemStatus::Active).unwrap();

        let frame = store.snapshot();
        assert!(robot(&frame, "r1").connected);
        assert_eq!(robot(&frame, "r1").system_status, SystemStatus::Active);

        tokio::time::advance(Duration::from_secs(31)).await;
        let first = store.snapshot();
        let second = store.snapshot();
        assert_eq!(first, second);
        let r1 = robot(&first, "r1");
        assert!(!r1.connected);
        assert_eq!(r1.status, ConnectionStatus::Disconnected);
        assert_eq!(r1.system_status, SystemStatus::Unknown);
        assert_eq!(
            store.ensure_live("r1"),
            Err(StoreError::NotConnected("r1".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_poll_only_applies_to_latest_cycle() {
        let store = store();
        store.connect("r1");
        let stale = store.record_poll("r1", SystemStatus::Active).unwrap();
        let current = store.record_poll("r1", SystemStatus::Active).unwrap();

        assert!(!store.finish_poll("r1", stale));
        assert!(robot(&store.snapshot(), "r1").connected);

        assert!(store.finish_poll("r1", current));
        let r1 = robot(&store.snapshot(), "r1").clone();
        assert!(!r1.connected);
        assert_eq!(r1.status, ConnectionStatus::Disconnected);
        assert_eq!(r1.system_status, SystemStatus::Unknown);
        // still within liveness, so dispatch remains possible between polls
        assert!(store.ensure_live("r1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn message_ring_keeps_most_recent() {
        let store = store();
        store.connect("r1");
        for i in 0..7 {
            store
                .record_message("r1", format!("m{i}"), MessageLevel::Info)
                .unwrap();
        }
        let history: Vec<String> = store
            .robot_messages("r1")
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(history, vec!["m6", "m5", "m4", "m3", "m2"]);

        let frame = store.snapshot();
        let shown: Vec<&str> = robot(&frame, "r1")
            .messages
            .iter()
            .map(|m| m.message.as_str())
            .collect();
        assert_eq!(shown, vec!["m6", "m5", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn global_log_is_bounded_and_newest_first() {
        let store = store();
        store.connect("r1");
        store.connect("r2");
        for i in 0..10 {
            let id = if i % 2 == 0 { "r1" } else { "r2" };
            store
                .record_message(id, format!("m{i}"), MessageLevel::Success)
                .unwrap();
        }
        let log = store.messages(100);
        assert_eq!(log.len(), 8);
        assert_eq!(log[0].message, "m9");
        assert_eq!(log[0].client_id, "r2");
        assert_eq!(log[7].message, "m2");
        assert_eq!(store.messages(2).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_messages_leave_snapshot_but_stay_in_history() {
        let store = store();
        store.connect("r1");
        store
            .record_message("r1", "old", MessageLevel::Warning)
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        store.record_poll("r1", SystemStatus::Active).unwrap();
        store.record_message("r1", "new", MessageLevel::Info).unwrap();

        let frame = store.snapshot();
        let shown: Vec<&str> = robot(&frame, "r1")
            .messages
            .iter()
            .map(|m| m.message.as_str())
            .collect();
        assert_eq!(shown, vec!["new"]);
        assert_eq!(store.robot_messages("r1").unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn image_tags_are_replaced() {
        let store = store();
        store.connect("r1");
        store
            .record_image_tags("r1", BTreeMap::from([("a".to_string(), "1".to_string())]))
            .unwrap();
        store
            .record_image_tags("r1", BTreeMap::from([("b".to_string(), "2".to_string())]))
            .unwrap();
        let frame = store.snapshot();
        assert_eq!(
            robot(&frame, "r1").images,
            BTreeMap::from([("b".to_string(), "2".to_string())])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_preserves_history() {
        let store = store();
        store.connect("r1");
        store
            .record_message("r1", "hello", MessageLevel::Info)
            .unwrap();
        store
            .record_image_tags("r1", BTreeMap::from([("cabot".to_string(), "v1".to_string())]))
            .unwrap();
        store.record_poll("r1", SystemStatus::Failed).unwrap();

        store.connect("r1");
        let frame = store.snapshot();
        let r1 = robot(&frame, "r1");
        assert_eq!(r1.system_status, SystemStatus::Unknown);
        assert_eq!(r1.messages.len(), 1);
        assert_eq!(r1.images["cabot"], "v1");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_clients_are_rejected() {
        let store = store();
        let missing = StoreError::ClientNotFound("ghost".into());
        assert_eq!(
            store.record_message("ghost", "hi", MessageLevel::Info),
            Err(missing.clone())
        );
        assert_eq!(
            store.record_image_tags("ghost", BTreeMap::new()),
            Err(missing.clone())
        );
        assert_eq!(
            store.record_poll("ghost", SystemStatus::Active),
            Err(missing.clone())
        );
        assert_eq!(store.ensure_live("ghost"), Err(missing.clone()));
        assert_eq!(store.robot_messages("ghost"), Err(missing));
        assert!(store.snapshot().cabots.is_empty());
        assert!(store.messages(10).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_sorted_by_id() {
        let store = store();
        for id in ["r3", "r1", "r2"] {
            store.connect(id);
        }
        let ids: Vec<String> = store.snapshot().cabots.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert!(store.remove("r2"));
        assert!(!store.contains("r2"));
        assert_eq!(store.snapshot().cabots.len(), 2);
    }
}
