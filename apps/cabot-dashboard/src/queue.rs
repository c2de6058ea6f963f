//! Per-client command FIFO with a single-waiter rendezvous.
//!
//! Every `await_command` call bumps the client's generation. Only the waiter holding the
//! current generation can receive a command; an older waiter is woken with `Superseded`
//! and never sees a command meant for the newer poll.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use cabot_proto::{ClientId, Command};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("no command arrived before the poll timeout")]
    Timeout,
    #[error("poll superseded by a newer poll for the same client")]
    Superseded,
    #[error("client removed while polling")]
    ClientRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed straight to a blocked poll.
    Delivered,
    /// Parked until the next poll.
    Queued,
}

enum Wake {
    Command(Command),
    Superseded,
}

impl Wake {
    fn into_result(wake: Option<Wake>) -> Result<Command, QueueError> {
        match wake {
            Some(Wake::Command(command)) => Ok(command),
            Some(Wake::Superseded) => Err(QueueError::Superseded),
            None => Err(QueueError::ClientRemoved),
        }
    }
}

struct Waiter {
    generation: u64,
    tx: oneshot::Sender<Wake>,
}

#[derive(Default)]
struct ClientQueue {
    pending: VecDeque<Command>,
    generation: u64,
    waiter: Option<Waiter>,
}

impl ClientQueue {
    /// Gives `command` to the blocked poll, if any. Hands the command back when nobody is
    /// waiting or the waiter has already gone away.
    fn hand_to_waiter(&mut self, command: Command) -> Result<u64, Command> {
        let Some(waiter) = self.waiter.take() else {
            return Err(command);
        };
        match waiter.tx.send(Wake::Command(command)) {
            Ok(()) => Ok(waiter.generation),
            Err(Wake::Command(command)) => Err(command),
            Err(Wake::Superseded) => unreachable!("only commands are handed to waiters"),
        }
    }
}

#[derive(Default)]
pub struct CommandQueue {
    clients: Mutex<HashMap<ClientId, ClientQueue>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Existing FIFO and waiter are left alone.
    pub fn initialize(&self, client_id: &str) {
        self.clients.lock().entry(client_id.to_string()).or_default();
    }

    pub fn enqueue(&self, client_id: &str, command: Command) -> EnqueueOutcome {
        let mut clients = self.clients.lock();
        let queue = clients.entry(client_id.to_string()).or_default();
        match queue.hand_to_waiter(command) {
            Ok(generation) => {
                debug!(client_id = %client_id, generation, "command handed to waiting poll");
                EnqueueOutcome::Delivered
            }
            Err(command) => {
                queue.pending.push_back(command);
                EnqueueOutcome::Queued
            }
        }
    }

    /// Returns the oldest queued command, or blocks until one arrives, `timeout` elapses,
    /// or a newer `await_command` for the same client supersedes this one.
    ///
    /// Dropping the returned future before it resolves releases the wait; a command that
    /// raced with the cancellation goes back to the front of the FIFO.
    pub async fn await_command(
        &self,
        client_id: &str,
        timeout: Duration,
    ) -> Result<Command, QueueError> {
        let (generation, rx) = {
            let mut clients = self.clients.lock();
            let queue = clients.entry(client_id.to_string()).or_default();
            queue.generation += 1;
            let generation = queue.generation;
            if let Some(previous) = queue.waiter.take() {
                debug!(
                    client_id = %client_id,
                    superseded = previous.generation,
                    generation,
                    "superseding pending poll"
                );
                let _ = previous.tx.send(Wake::Superseded);
            }
            if let Some(command) = queue.pending.pop_front() {
                return Ok(command);
            }
            let (tx, rx) = oneshot::channel();
            queue.waiter = Some(Waiter { generation, tx });
            (generation, rx)
        };

        let mut poll = PendingPoll {
            queue: self,
            client_id,
            generation,
            rx: Some(rx),
        };
        poll.wait(timeout).await
    }

    /// Drops the FIFO and wakes any blocked poll with `ClientRemoved`.
    pub fn remove_client(&self, client_id: &str) -> bool {
        self.clients.lock().remove(client_id).is_some()
    }

    pub fn pending_len(&self, client_id: &str) -> usize {
        self.clients
            .lock()
            .get(client_id)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    pub fn is_waiting(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .get(client_id)
            .is_some_and(|queue| queue.waiter.is_some())
    }

    fn release_waiter(&self, client_id: &str, generation: u64) -> bool {
        let mut clients = self.clients.lock();
        match clients.get_mut(client_id) {
            Some(queue) if queue.waiter.as_ref().is_some_and(|w| w.generation == generation) => {
                queue.waiter = None;
                true
            }
            _ => false,
        }
    }
}

struct PendingPoll<'a> {
    queue: &'a CommandQueue,
    client_id: &'a str,
    generation: u64,
    rx: Option<oneshot::Receiver<Wake>>,
}

impl PendingPoll<'_> {
    async fn wait(&mut self, timeout: Duration) -> Result<Command, QueueError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(QueueError::ClientRemoved);
        };
        let outcome = match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(received) => Wake::into_result(received.ok()),
            Err(_) if self.queue.release_waiter(self.client_id, self.generation) => {
                Err(QueueError::Timeout)
            }
            // someone took the waiter between the deadline and the release
            Err(_) => Wake::into_result(rx.try_recv().ok()),
        };
        self.rx = None;
        outcome
    }
}

impl Drop for PendingPoll<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut clients = self.queue.clients.lock();
        let Some(queue) = clients.get_mut(self.client_id) else {
            return;
        };
        if queue
            .waiter
            .as_ref()
            .is_some_and(|w| w.generation == self.generation)
        {
            queue.waiter = None;
            return;
        }
        // a command raced with the cancellation: the newer poll gets it, else it goes back first
        if let Ok(Wake::Command(command)) = rx.try_recv() {
            match queue.hand_to_waiter(command) {
                Ok(generation) => {
                    debug!(client_id = %self.client_id, generation, "command from cancelled poll handed to newer poll");
                }
                Err(command) => {
                    debug!(client_id = %self.client_id, "requeueing command from cancelled poll");
                    queue.pending.push_front(command);
                }
            }
        }
    }
}
