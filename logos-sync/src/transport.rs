//! WebSocket link for one connection attempt.
//!
//! ```text
//!  session ──LinkHandle::send──► out_rx ──► ws writer ──► server
//!  session ◄── LinkEvent{epoch} ◄── ws reader ◄────────── server
//! ```
//!
//! A link task owns the socket for exactly one epoch. It reports
//! `Opened`, each text frame, and finally one `Closed` if the socket dies
//! on its own. When the session closes the link (or drops the handle) the
//! task sends a close frame and exits without reporting anything, so the
//! session never hears about a connection it already gave up on.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;

/// Something that happened on the link of `epoch`.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened { epoch: u64 },
    Message { epoch: u64, text: String },
    /// Socket error, timeout, or a close the session did not ask for.
    Closed { epoch: u64, error: SyncError },
}

impl LinkEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Opened { epoch } | Self::Message { epoch, .. } | Self::Closed { epoch, .. } => *epoch,
        }
    }
}

/// Session-side handle of a running link task.
#[derive(Debug)]
pub struct LinkHandle {
    epoch: u64,
    outgoing: mpsc::Sender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queue a text frame for the writer without blocking the session.
    pub fn send(&self, text: String) -> Result<(), SyncError> {
        self.outgoing.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::Transport("outgoing buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::ConnectionClosed("link task exited".to_string())
            }
        })
    }

    /// Stop the link quietly: no further events are produced for this epoch.
    pub fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the link task for `epoch`.
pub fn spawn_link(
    url: String,
    epoch: u64,
    connect_timeout: Duration,
    outgoing_capacity: usize,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle {
    let (out_tx, out_rx) = mpsc::channel::<String>(outgoing_capacity);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_link(url, epoch, connect_timeout, out_rx, shutdown_rx, events));
    LinkHandle {
        epoch,
        outgoing: out_tx,
        shutdown: Some(shutdown_tx),
        task,
    }
}

async fn run_link(
    url: String,
    epoch: u64,
    connect_timeout: Duration,
    mut out_rx: mpsc::Receiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<LinkEvent>,
) {
    let connect = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()));

    let ws_stream = tokio::select! {
        biased;
        _ = &mut shutdown_rx => return,
        result = connect => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                let _ = events
                    .send(LinkEvent::Closed { epoch, error: SyncError::Transport(e.to_string()) })
                    .await;
                return;
            }
            Err(_) => {
                let _ = events.send(LinkEvent::Closed { epoch, error: SyncError::Timeout }).await;
                return;
            }
        }
    };

    log::debug!("WebSocket open to {url} (attempt {epoch})");
    if events.send(LinkEvent::Opened { epoch }).await.is_err() {
        return;
    }

    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let error = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                let _ = ws_writer.send(Message::Close(None)).await;
                log::debug!("Closed link for attempt {epoch}");
                return;
            }

            frame = out_rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                        break SyncError::Transport(e.to_string());
                    }
                }
                None => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    return;
                }
            },

            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    if events.send(LinkEvent::Message { epoch, text }).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events.send(LinkEvent::Message { epoch, text }).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => log::warn!("Dropping non-UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("server closed ({}): {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "server closed".to_string());
                    break SyncError::ConnectionClosed(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SyncError::Transport(e.to_string()),
                None => break SyncError::ConnectionClosed("stream ended".to_string()),
            }
        }
    };

    let _ = events.send(LinkEvent::Closed { epoch, error }).await;
}
