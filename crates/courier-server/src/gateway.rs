//! Per-connection protocol state machine.
//!
//! A connection moves `Connecting -> Authenticated -> Active -> Closed`.
//! Authentication happens after the upgrade so a refused token can be
//! answered with a close code the client can see. Each active connection
//! runs a writer task fed by one bounded queue; the reader loop below owns
//! everything else about the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use courier_coord::{LockCoordinator, PresenceTracker, Roster};
use courier_core::{Audience, ConnectionId, Identity, InboundFrame, OfferId, OutboundFrame, Role};
use courier_telemetry::DispatchMetrics;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::IdentityResolver;
use crate::fanout::Fanout;
use crate::registry::{offer, ConnectionRegistry, Outbound, SendOutcome};

/// How long a closing connection's writer gets to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Everything a connection needs, shared by all connections.
pub struct Gateway {
    pub registry: Arc<ConnectionRegistry>,
    pub locks: Arc<LockCoordinator>,
    pub presence: Arc<PresenceTracker>,
    pub roster: Arc<Roster>,
    pub fanout: Arc<Fanout>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub metrics: Arc<DispatchMetrics>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub settings: GatewaySettings,
}

/// State of one active connection, owned by its reader loop.
struct Session {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Outbound>,
    state: ConnectionState,
}

impl Session {
    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!(
            connection_id = %self.id,
            identity_id = %self.identity.id,
            from = ?self.state,
            to = ?next,
            "Connection state"
        );
        self.state = next;
    }

    fn send(&self, frame: &OutboundFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(frame_type = frame.frame_type(), error = %e, "Failed to encode frame");
                return;
            }
        };
        if offer(&self.tx, Outbound::Frame(Arc::from(text))) == SendOutcome::Dropped {
            tracing::warn!(
                connection_id = %self.id,
                frame_type = frame.frame_type(),
                "Send queue full, dropping frame"
            );
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = offer(
            &self.tx,
            Outbound::Close {
                code,
                reason: reason.to_owned(),
            },
        );
    }
}

impl Gateway {
    /// Run one upgraded socket to completion.
    pub async fn serve(self: Arc<Self>, mut socket: WebSocket, role: Role, token: String) {
        let identity = match self.resolver.resolve(role, &token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.metrics.auth_failed();
                tracing::warn!(role = %role, error = %e, "Rejected connection");
                let reason = match role {
                    Role::Fulfiller => "Invalid driver token",
                    Role::Requester => "Invalid user token",
                };
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
        };

        let (tx, rx) = self.registry.channel();
        let mut session = Session {
            id: ConnectionId::new(),
            identity,
            tx,
            state: ConnectionState::Connecting,
        };
        session.transition(ConnectionState::Authenticated);

        self.registry
            .register(&session.identity, session.id.clone(), session.tx.clone());
        self.metrics.connection_opened();
        self.roster.refresh(&session.identity).await;
        session.send(&OutboundFrame::connected(session.identity.id.clone()));
        session.transition(ConnectionState::Active);
        tracing::info!(
            connection_id = %session.id,
            identity_id = %session.identity.id,
            role = %session.identity.role,
            "Connection active"
        );

        let (sink, mut stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, rx, self.settings.heartbeat_interval));

        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    session.close(close_code::AWAY, "Server shutting down");
                    break;
                }
                _ = &mut idle => {
                    tracing::info!(connection_id = %session.id, "Closing idle connection");
                    session.close(close_code::NORMAL, "Idle timeout");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.roster.refresh(&session.identity).await;
                }
                msg = stream.next() => {
                    let Some(Ok(msg)) = msg else {
                        break;
                    };
                    idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);
                    match msg {
                        Message::Text(text) => {
                            if !self.on_text(&mut session, text.as_str()).await {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        Message::Binary(_) => {
                            tracing::debug!(connection_id = %session.id, "Ignoring binary frame");
                        }
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
            }
        }

        session.transition(ConnectionState::Closed);
        self.finish(session);

        if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            tracing::warn!("Connection writer did not drain in time");
        }
    }

    /// Handle one text frame. Returns false when the connection must close.
    async fn on_text(&self, session: &mut Session, text: &str) -> bool {
        let frame = match InboundFrame::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(connection_id = %session.id, "Ignoring unrecognised frame");
                return true;
            }
            Err(e) => {
                self.metrics.protocol_violation();
                tracing::warn!(connection_id = %session.id, error = %e, "Malformed frame, closing");
                session.close(close_code::POLICY, "Malformed frame");
                return false;
            }
        };

        if frame.is_fulfiller_only() && !session.identity.is_fulfiller() {
            tracing::debug!(
                connection_id = %session.id,
                frame_type = frame.frame_type(),
                "Ignoring fulfiller-only frame from requester"
            );
            return true;
        }

        match frame {
            InboundFrame::Ping => session.send(&OutboundFrame::Pong),
            InboundFrame::ViewingOrder {
                order_id: Some(order_id),
                ..
            } => {
                if !self.registry.mark_viewing(&session.identity, order_id) {
                    tracing::debug!(connection_id = %session.id, "Connection already removed, not marking viewer");
                    return true;
                }
                self.presence.mark_viewing(order_id, &session.identity.id).await;
                self.announce_viewers(order_id).await;
            }
            InboundFrame::StopViewingOrder {
                order_id: Some(order_id),
            } => {
                self.registry.stop_viewing(&session.identity, order_id);
                self.presence.stop_viewing(order_id, &session.identity.id).await;
                self.announce_viewers(order_id).await;
            }
            InboundFrame::RequestLock {
                order_id: Some(order_id),
            } => {
                let granted = self.locks.try_acquire(order_id, &session.identity.id).await;
                tracing::info!(
                    connection_id = %session.id,
                    identity_id = %session.identity.id,
                    order_id = %order_id,
                    granted,
                    "Lock request"
                );
                session.send(&OutboundFrame::lock_result(order_id, granted));
            }
            other => {
                tracing::debug!(
                    connection_id = %session.id,
                    frame_type = other.frame_type(),
                    "Ignoring frame without order_id"
                );
            }
        }
        true
    }

    async fn announce_viewers(&self, order_id: OfferId) {
        let count = self.presence.viewer_count(order_id).await;
        self.fanout
            .publish(Audience::AllFulfillers, &OutboundFrame::ViewerCount { order_id, count })
            .await;
    }

    /// Unregister, then clean up presence in the background.
    ///
    /// Viewing state belongs to the identity, so it is only cleared when
    /// the identity's last connection here goes away, whichever of its
    /// connections marked the offers.
    fn finish(self: &Arc<Self>, session: Session) {
        self.metrics.connection_closed();
        let Some(gone) = self.registry.unregister(&session.id) else {
            return;
        };
        tracing::info!(
            connection_id = %session.id,
            identity_id = %gone.identity.id,
            last = gone.last,
            viewing = gone.viewing.len(),
            "Connection closed"
        );
        if !gone.last {
            return;
        }

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            this.roster.leave(&gone.identity).await;
            for order_id in gone.viewing {
                this.presence.stop_viewing(order_id, &gone.identity.id).await;
                this.announce_viewers(order_id).await;
            }
        });
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>, heartbeat: Duration) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Frame(text)) => {
                    if sink.send(Message::Text(text.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
