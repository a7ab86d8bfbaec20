//! Connection lifecycle as an explicit state machine.
//!
//! ```text
//!                 Connect (limiter open)
//!  Disconnected ─────────────────────────► Connecting{epoch, waiters}
//!       ▲                                      │            │
//!       │ Disconnect / Failed(epoch)           │ Opened     │ Failed(epoch)
//!       │   close link, arm reconnect          ▼            │   reject waiters,
//!       └──────────────────────────────── Connected{epoch} ◄┘   then Disconnect
//! ```
//!
//! Every attempt gets a fresh epoch. Link events carry the epoch they were
//! produced under; anything from an epoch that is no longer current is
//! ignored, which is what keeps an abandoned socket's close event from
//! triggering another reconnect.
//!
//! Connect and disconnect each pass through a [`RateLimiter`] with leading
//! semantics. A connect that hits a closed window arms one reconnect timer
//! for the end of the window. A disconnect that hits a closed window while
//! a link is live arms one deferred disconnect bound to that link's epoch.
//! There is no retry cap.
//!
//! [`ConnectionManager`] performs no I/O. It returns [`ConnAction`]s for the
//! session to carry out and exposes the next timer deadline.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SyncError;

/// Completion handle of a `connect()` caller.
pub type Waiter = oneshot::Sender<Result<(), SyncError>>;

/// Public, copyable view of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state with the data each phase owns.
#[derive(Debug)]
pub enum ConnectionState {
    Disconnected,
    Connecting {
        epoch: u64,
        started_at: Instant,
        waiters: Vec<Waiter>,
    },
    Connected {
        epoch: u64,
        since: Instant,
    },
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting { .. } => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
        }
    }

    /// Epoch of the live link, if any.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { epoch, .. } | Self::Connected { epoch, .. } => Some(*epoch),
        }
    }
}

/// Leading-edge rate limiter: the first call in a window fires, the rest
/// are refused until `interval` has passed since the last fire.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    /// Whether a call at `now` would fire.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Fire if the window is open; records `now` as the last fire.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.is_open(now) {
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }

    /// Earliest instant at or after `now` when a call would fire.
    pub fn next_allowed(&self, now: Instant) -> Instant {
        match self.last_fired {
            Some(last) if !self.is_open(now) => last + self.interval,
            _ => now,
        }
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum ConnEvent {
    /// Caller asked to connect; `waiter` is resolved when the attempt settles.
    Connect { waiter: Option<Waiter> },
    /// Caller (or a fault) asked to drop the link.
    Disconnect { reason: String },
    /// Link of `epoch` finished its handshake.
    Opened { epoch: u64 },
    /// Link of `epoch` errored, closed abnormally, or timed out.
    Failed { epoch: u64, error: SyncError },
    /// A timer deadline returned by [`ConnectionManager::next_deadline`] passed.
    TimerFired,
    /// Session teardown.
    Shutdown,
}

/// Side effects the session must carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAction {
    /// Spawn a link for `epoch`.
    Open { epoch: u64 },
    /// Deregister and close the link of `epoch`.
    Close { epoch: u64 },
    /// Send a pull over the freshly opened link.
    SendPull,
    Connected,
    Disconnected { reason: String },
}

#[derive(Debug)]
struct DeferredDisconnect {
    at: Instant,
    epoch: u64,
    reason: String,
}

/// Connection supervisor.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    next_epoch: u64,
    connect_limiter: RateLimiter,
    disconnect_limiter: RateLimiter,
    /// Waiters that arrived while the connect window was closed
    pending_waiters: Vec<Waiter>,
    reconnect_at: Option<Instant>,
    deferred: Option<DeferredDisconnect>,
    shut_down: bool,
}

impl ConnectionManager {
    pub fn new(rate_limit_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            next_epoch: 1,
            connect_limiter: RateLimiter::new(rate_limit_interval),
            disconnect_limiter: RateLimiter::new(rate_limit_interval),
            pending_waiters: Vec::new(),
            reconnect_at: None,
            deferred: None,
            shut_down: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Epoch of the live link, if any.
    pub fn current_epoch(&self) -> Option<u64> {
        self.state.epoch()
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.deferred.as_ref().map(|d| d.at)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The single state-transition function.
    pub fn transition(&mut self, event: ConnEvent, now: Instant) -> Vec<ConnAction> {
        if self.shut_down {
            if let ConnEvent::Connect { waiter: Some(w) } = event {
                let _ = w.send(Err(SyncError::SessionClosed));
            }
            return Vec::new();
        }

        match event {
            ConnEvent::Connect { waiter } => self.connect(waiter, now),
            ConnEvent::Disconnect { reason } => self.disconnect(reason, now),
            ConnEvent::Opened { epoch } => self.opened(epoch, now),
            ConnEvent::Failed { epoch, error } => self.failed(epoch, error, now),
            ConnEvent::TimerFired => self.timer_fired(now),
            ConnEvent::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self, waiter: Option<Waiter>, now: Instant) -> Vec<ConnAction> {
        match &mut self.state {
            ConnectionState::Connected { .. } => {
                if let Some(w) = waiter {
                    let _ = w.send(Ok(()));
                }
                Vec::new()
            }
            ConnectionState::Connecting { waiters, .. } => {
                // Join the attempt in flight rather than starting another
                waiters.extend(waiter);
                Vec::new()
            }
            ConnectionState::Disconnected => {
                self.pending_waiters.extend(waiter);
                if self.connect_limiter.try_fire(now) {
                    self.start_attempt(now)
                } else {
                    let at = self.connect_limiter.next_allowed(now);
                    if self.reconnect_at.is_none() {
                        log::debug!("Connect rate-limited; retrying in {:?}", at - now);
                        self.reconnect_at = Some(at);
                    }
                    Vec::new()
                }
            }
        }
    }

    fn start_attempt(&mut self, now: Instant) -> Vec<ConnAction> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.reconnect_at = None;
        self.state = ConnectionState::Connecting {
            epoch,
            started_at: now,
            waiters: std::mem::take(&mut self.pending_waiters),
        };
        log::info!("Connecting (attempt {epoch})");
        vec![ConnAction::Open { epoch }]
    }

    fn disconnect(&mut self, reason: String, now: Instant) -> Vec<ConnAction> {
        let Some(epoch) = self.state.epoch() else {
            // Already down: make sure a reconnect is on the way
            if self.reconnect_at.is_none() {
                self.reconnect_at = Some(self.connect_limiter.next_allowed(now));
            }
            return Vec::new();
        };

        if !self.disconnect_limiter.try_fire(now) {
            if self.deferred.is_none() {
                let at = self.disconnect_limiter.next_allowed(now);
                log::debug!("Disconnect rate-limited; deferring to {:?} from now", at - now);
                self.deferred = Some(DeferredDisconnect { at, epoch, reason });
            }
            return Vec::new();
        }

        self.teardown(epoch, reason, now)
    }

    /// Leave the live or connecting state at once and arm the reconnect.
    fn teardown(&mut self, epoch: u64, reason: String, now: Instant) -> Vec<ConnAction> {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        if let ConnectionState::Connecting { waiters, .. } = previous {
            for w in waiters {
                let _ = w.send(Err(SyncError::ConnectionClosed(reason.clone())));
            }
        }
        self.deferred = None;
        let at = self.connect_limiter.next_allowed(now);
        self.reconnect_at = Some(at);
        log::info!("Disconnected ({reason}); reconnecting in {:?}", at - now);

        vec![ConnAction::Close { epoch }, ConnAction::Disconnected { reason }]
    }

    fn opened(&mut self, epoch: u64, now: Instant) -> Vec<ConnAction> {
        match &mut self.state {
            ConnectionState::Connecting { epoch: current, waiters, .. } if *current == epoch => {
                for w in waiters.drain(..) {
                    let _ = w.send(Ok(()));
                }
                self.state = ConnectionState::Connected { epoch, since: now };
                log::info!("Connected (attempt {epoch})");
                vec![ConnAction::Connected, ConnAction::SendPull]
            }
            _ => {
                log::debug!("Ignoring open from stale attempt {epoch}");
                Vec::new()
            }
        }
    }

    fn failed(&mut self, epoch: u64, error: SyncError, now: Instant) -> Vec<ConnAction> {
        if self.state.epoch() != Some(epoch) {
            log::debug!("Ignoring failure from stale attempt {epoch}: {error}");
            return Vec::new();
        }
        log::warn!("Connection attempt {epoch} failed: {error}");
        if let ConnectionState::Connecting { waiters, .. } = &mut self.state {
            for w in waiters.drain(..) {
                let _ = w.send(Err(error.clone()));
            }
        }
        // The link is already gone; only caller-initiated disconnects are rate-limited
        self.teardown(epoch, error.to_string(), now)
    }

    fn timer_fired(&mut self, now: Instant) -> Vec<ConnAction> {
        let mut actions = Vec::new();

        if self.deferred.as_ref().is_some_and(|d| d.at <= now) {
            if let Some(deferred) = self.deferred.take() {
                if self.state.epoch() == Some(deferred.epoch) {
                    actions.extend(self.disconnect(deferred.reason, now));
                }
            }
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            actions.extend(self.connect(None, now));
        }

        actions
    }

    fn shutdown(&mut self) -> Vec<ConnAction> {
        self.shut_down = true;
        self.reconnect_at = None;
        self.deferred = None;
        for w in self.pending_waiters.drain(..) {
            let _ = w.send(Err(SyncError::SessionClosed));
        }

        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        let epoch = previous.epoch();
        if let ConnectionState::Connecting { waiters, .. } = previous {
            for w in waiters {
                let _ = w.send(Err(SyncError::SessionClosed));
            }
        }

        match epoch {
            Some(epoch) => vec![
                ConnAction::Close { epoch },
                ConnAction::Disconnected {
                    reason: "shutdown".to_string(),
                },
            ],
            None => Vec::new(),
        }
    }
}
