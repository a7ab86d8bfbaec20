//! Sync session: one task that owns the queue, the cursor, the connection
//! state machine and the document store.
//!
//! ```text
//!   SyncHandle ──Command──┐
//!                         ▼
//!   link task ──LinkEvent──► SyncSession loop ──► UpdateSink (publish)
//!                         ▲        │
//!   reconnect / deferred ─┘        └──► SyncEvent channel (application)
//!   disconnect timers
//! ```
//!
//! The loop handles one input at a time and runs each to completion,
//! reconcile and flush included, before it polls for the next. Nothing
//! else touches the queue or the cursor, so no locking is needed and an
//! `acknowledged` batch can never interleave with another message.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::change::{Change, ChangeId, ServerChange};
use crate::config::SyncConfig;
use crate::connection::{ConnAction, ConnEvent, ConnectionManager, ConnectionStatus};
use crate::error::SyncError;
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::queue::OutgoingQueue;
use crate::reconcile::Reconciler;
use crate::store::{DocumentStore, UpdateSink};
use crate::transport::{spawn_link, LinkEvent, LinkHandle};

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Link open; a pull has been sent.
    Connected,
    /// Link torn down; a reconnect is scheduled.
    Disconnected { reason: String },
    /// Ephemeral changes relayed from other peers.
    Relayed(Vec<Change>),
    /// The server refused these identities. Pending ones were dropped from
    /// the outgoing queue and are returned in `discarded`.
    Rejected {
        ids: Vec<ChangeId>,
        message: String,
        discarded: Vec<Change>,
    },
    /// An acknowledged batch was merged and published.
    Reconciled {
        version: u64,
        applied: Vec<ChangeId>,
        confirmed: Vec<ChangeId>,
    },
    /// An acknowledged batch was discarded; a fresh pull from `version` is out.
    Resync { version: u64, reason: String },
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub status: ConnectionStatus,
    pub version: u64,
    pub queued: usize,
    pub oldest_queued: Option<Duration>,
    pub epoch: Option<u64>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), SyncError>>),
    Disconnect(String),
    Commit(Change, oneshot::Sender<Result<(), SyncError>>),
    PushEphemeral(Vec<Change>),
    Relay(Vec<u8>),
    Stats(oneshot::Sender<SessionStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Application-side handle to a running session.
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    async fn command(&self, cmd: Command) -> Result<(), SyncError> {
        self.commands.send(cmd).await.map_err(|_| SyncError::SessionClosed)
    }

    /// Connect, resolving once the attempt opens or fails. Returns at once
    /// when already connected; joins the attempt in flight when connecting.
    pub async fn connect(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Drop the link and schedule a reconnect.
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<(), SyncError> {
        self.command(Command::Disconnect(reason.into())).await
    }

    /// Apply a durable edit locally, queue it, and push it when connected.
    pub async fn commit(&self, change: Change) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Commit(change, tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Fire-and-forget changes; dropped when offline.
    pub async fn push_ephemeral(&self, changes: Vec<Change>) -> Result<(), SyncError> {
        self.command(Command::PushEphemeral(changes)).await
    }

    /// Forward opaque bytes to the room; dropped when offline.
    pub async fn relay(&self, buffer: Vec<u8>) -> Result<(), SyncError> {
        self.command(Command::Relay(buffer)).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stats(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Tear the session down and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?;
        let _ = self.task.await;
        Ok(())
    }
}

/// The session loop state.
pub struct SyncSession<S, U> {
    config: SyncConfig,
    store: S,
    sink: U,
    queue: OutgoingQueue,
    reconciler: Reconciler,
    connection: ConnectionManager,
    link: Option<LinkHandle>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<S, U> SyncSession<S, U>
where
    S: DocumentStore + Send + 'static,
    U: UpdateSink<S::State> + Send + 'static,
{
    /// Start a session task. It stays disconnected until `connect()`.
    pub fn spawn(config: SyncConfig, store: S, sink: U) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (link_tx, link_rx) = mpsc::channel(config.outgoing_capacity);

        let session = Self {
            connection: ConnectionManager::new(config.rate_limit_interval),
            config,
            store,
            sink,
            queue: OutgoingQueue::new(),
            reconciler: Reconciler::new(),
            link: None,
            link_tx,
            link_rx,
            event_tx,
        };
        let task = tokio::spawn(session.run(command_rx));

        SyncHandle {
            commands: command_tx,
            event_rx: Some(event_rx),
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        log::debug!("Sync session started for {}", self.config.server_url);
        loop {
            let deadline = self.connection.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.link_rx.recv() => self.handle_link_event(event),
                _ = sleep_until(deadline) => self.drive(ConnEvent::TimerFired),
            }
        }
        log::debug!("Sync session stopped");
    }

    fn shutdown(&mut self) {
        self.drive(ConnEvent::Shutdown);
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    /// Returns false once the session should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(reply) => self.drive(ConnEvent::Connect { waiter: Some(reply) }),
            Command::Disconnect(reason) => self.drive(ConnEvent::Disconnect { reason }),
            Command::Commit(change, reply) => {
                let _ = reply.send(self.commit(change));
            }
            Command::PushEphemeral(changes) => {
                self.send(ClientMessage::push_ephemeral(changes));
            }
            Command::Relay(buffer) => {
                self.send(ClientMessage::relay(buffer));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            status: self.connection.status(),
            version: self.reconciler.version(),
            queued: self.queue.len(),
            oldest_queued: self.queue.oldest_age(),
            epoch: self.connection.current_epoch(),
        }
    }

    /// Optimistic local edit.
    fn commit(&mut self, change: Change) -> Result<(), SyncError> {
        let current = self.store.current();
        let next = self.store.apply(&change, &current, &current)?;
        self.sink.publish(next);
        self.queue.enqueue(change.clone());
        if self.connection.is_connected() {
            self.send(ClientMessage::push_durable(vec![change]));
        }
        Ok(())
    }

    fn drive(&mut self, event: ConnEvent) {
        let actions = self.connection.transition(event, Instant::now());
        for action in actions {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: ConnAction) {
        match action {
            ConnAction::Open { epoch } => {
                if let Some(old) = self.link.take() {
                    old.close();
                }
                self.link = Some(spawn_link(
                    self.config.server_url.clone(),
                    epoch,
                    self.config.connect_timeout,
                    self.config.outgoing_capacity,
                    self.link_tx.clone(),
                ));
            }
            ConnAction::Close { epoch } => {
                // Deregister first, then close
                match self.link.take() {
                    Some(link) if link.epoch() == epoch => link.close(),
                    other => self.link = other,
                }
            }
            ConnAction::SendPull => {
                let version = self.reconciler.version();
                self.send(ClientMessage::pull(version));
            }
            ConnAction::Connected => self.emit(SyncEvent::Connected),
            ConnAction::Disconnected { reason } => self.emit(SyncEvent::Disconnected { reason }),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if self.connection.current_epoch() != Some(event.epoch()) {
            log::debug!("Ignoring event from abandoned link {}", event.epoch());
            return;
        }
        match event {
            LinkEvent::Opened { epoch } => self.drive(ConnEvent::Opened { epoch }),
            LinkEvent::Closed { epoch, error } => self.drive(ConnEvent::Failed { epoch, error }),
            LinkEvent::Message { text, .. } => {
                if let Some(msg) = protocol::dispatch(&text) {
                    self.handle_message(msg);
                }
            }
        }
    }

    fn handle_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Relayed { changes } => self.emit(SyncEvent::Relayed(changes)),
            ServerMessage::Acknowledged { changes } => self.handle_acknowledged(&changes),
            ServerMessage::Rejected { ids, message } => {
                let discarded = self.queue.discard(&ids);
                log::warn!(
                    "Server rejected {} change(s) ({} pending dropped): {message}",
                    ids.len(),
                    discarded.len()
                );
                self.emit(SyncEvent::Rejected {
                    ids,
                    message,
                    discarded,
                });
            }
        }
    }

    fn handle_acknowledged(&mut self, batch: &[ServerChange]) {
        match self.reconciler.reconcile(batch, &self.store, &mut self.queue) {
            Ok(reconciled) => {
                self.sink.publish(reconciled.state);
                self.emit(SyncEvent::Reconciled {
                    version: reconciled.version,
                    applied: reconciled.applied,
                    confirmed: reconciled.confirmed,
                });
                self.flush();
            }
            Err(e) => {
                let version = self.reconciler.version();
                log::warn!("Discarding acknowledged batch, re-pulling from {version}: {e}");
                self.emit(SyncEvent::Resync {
                    version,
                    reason: e.to_string(),
                });
                self.send(ClientMessage::pull(version));
            }
        }
    }

    /// Push every pending durable change.
    fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let pending = self.queue.drain_all();
        log::debug!("Flushing {} pending change(s)", pending.len());
        self.send(ClientMessage::push_durable(pending));
    }

    fn send(&self, msg: ClientMessage) {
        let link = match (&self.link, self.connection.is_connected()) {
            (Some(link), true) => link,
            _ => {
                log::warn!("Not connected; dropping outbound {} message", msg.tag());
                return;
            }
        };
        let result = msg.encode().map_err(SyncError::from).and_then(|text| link.send(text));
        if let Err(e) = result {
            log::warn!("Failed to send {} message: {e}", msg.tag());
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::warn!("Event channel full; dropping {event:?}");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
