//! WebSocket session gateway
//!
//! The gateway is a thin transport adapter: it verifies the capability
//! token before the upgrade, registers the session with the presence
//! store, subscribes to the fan-out pipeline, and forwards the events
//! addressed to this user. All delivery decisions are made in
//! `push_for`, a pure function over the event and the session's identity,
//! so routing is testable without a live socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::Claims;
use crate::pipeline::PipelineEvent;
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket_handler))
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// GET /ws?token=
///
/// The token is checked before upgrading so an invalid credential gets a
/// plain 401 instead of a doomed websocket.
async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match state.verifier.verify(&params.token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "Rejected websocket upgrade");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_session(socket, state, claims))
}

/// One gateway session, from attach to detach
async fn handle_session(socket: WebSocket, state: Arc<AppState>, claims: Claims) {
    let session_id = Uuid::new_v4().to_string();
    info!(
        username = %claims.username,
        session = %session_id,
        "WebSocket session attached"
    );

    // Group memberships are snapshotted at attach; a membership change takes
    // effect for live routing on the next connect
    let groups: HashSet<i64> = match state.directory.groups_of(claims.user_id).await {
        Ok(groups) => groups.into_iter().collect(),
        Err(e) => {
            warn!(error = %e, "Group lookup failed, session gets no group traffic");
            HashSet::new()
        }
    };

    // Subscribe before the JOIN broadcast so this session sees its own
    // roster delta
    let mut events = state.pipeline.subscribe();
    let join = state.presence.connect(&claims.username, &session_id);
    state.pipeline.publish(PipelineEvent::Roster(join));

    let (mut sink, mut stream) = socket.split();

    // A quietly listening client sends nothing; without a server-side ping
    // its session would be swept at the TTL while the socket is still live
    let mut heartbeat = tokio::time::interval(heartbeat_period(state.presence.ttl()));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                state.presence.touch(&session_id);
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(_))) | Some(Ok(Message::Pong(_))) => {
                    // Any inbound traffic keeps the session alive
                    state.presence.touch(&session_id);
                }
                Some(Ok(Message::Ping(data))) => {
                    state.presence.touch(&session_id);
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(session = %session_id, "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    error!(session = %session_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(push) = push_for(&event, &claims, &groups) {
                        if sink.send(Message::Text(push)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // The client refetches history on reconnect, so skipping
                    // ahead is safe
                    warn!(session = %session_id, skipped, "Session lagged behind pipeline");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(leave) = state.presence.disconnect(&session_id) {
        state.pipeline.publish(PipelineEvent::Roster(leave));
    }
    info!(
        username = %claims.username,
        session = %session_id,
        "WebSocket session detached"
    );
}

/// How often a session pings and refreshes its TTL; several beats fit in
/// one TTL so a single missed tick cannot expire a live session
fn heartbeat_period(ttl: std::time::Duration) -> std::time::Duration {
    ttl / 3
}

/// Decide whether this session receives the event and render the push frame.
///
/// - private messages go to the receiver's sessions
/// - group messages go to sessions of members (membership at attach time)
/// - read receipts go back to the original sender's sessions
/// - roster deltas go to everyone
fn push_for(event: &PipelineEvent, claims: &Claims, groups: &HashSet<i64>) -> Option<String> {
    let (channel, payload) = match event {
        PipelineEvent::Message(m) => match (m.receiver_id, m.group_id) {
            (Some(receiver), _) if receiver == claims.user_id => {
                ("private".to_string(), serde_json::to_value(m).ok()?)
            }
            (_, Some(group)) if groups.contains(&group) => {
                (format!("group:{}", group), serde_json::to_value(m).ok()?)
            }
            _ => return None,
        },
        PipelineEvent::ReadReceipt(r) if r.sender_username == claims.username => {
            ("read-receipts".to_string(), serde_json::to_value(r).ok()?)
        }
        PipelineEvent::ReadReceipt(_) => return None,
        PipelineEvent::Roster(r) => ("presence".to_string(), serde_json::to_value(r).ok()?),
    };

    Some(json!({ "channel": channel, "event": payload }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DeliveryStatus, MessageWire};
    use crate::pipeline::{ReadReceiptEvent, RosterEvent, RosterEventKind};
    use chrono::Utc;

    fn claims(user_id: i64, username: &str) -> Claims {
        Claims {
            user_id,
            username: username.to_string(),
            expires_at: Utc::now().timestamp() + 3600,
        }
    }

    fn wire(sender: i64, receiver: Option<i64>, group: Option<i64>) -> MessageWire {
        MessageWire {
            id: Uuid::now_v7().to_string(),
            sender_id: sender,
            receiver_id: receiver,
            group_id: group,
            content: "hello".to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Delivered,
        }
    }

    #[test]
    fn test_private_message_routed_to_receiver_only() {
        let event = PipelineEvent::Message(wire(1, Some(2), None));

        let push = push_for(&event, &claims(2, "bob"), &HashSet::new()).unwrap();
        let frame: serde_json::Value = serde_json::from_str(&push).unwrap();
        assert_eq!(frame["channel"], "private");
        assert_eq!(frame["event"]["senderId"], 1);

        assert!(push_for(&event, &claims(3, "carol"), &HashSet::new()).is_none());
        // Not even the sender's own sessions
        assert!(push_for(&event, &claims(1, "alice"), &HashSet::new()).is_none());
    }

    #[test]
    fn test_group_message_routed_by_membership() {
        let event = PipelineEvent::Message(wire(1, None, Some(7)));
        let member_groups: HashSet<i64> = [7].into_iter().collect();

        let push = push_for(&event, &claims(2, "bob"), &member_groups).unwrap();
        let frame: serde_json::Value = serde_json::from_str(&push).unwrap();
        assert_eq!(frame["channel"], "group:7");

        assert!(push_for(&event, &claims(3, "carol"), &HashSet::new()).is_none());
    }

    #[test]
    fn test_receipt_routed_to_original_sender() {
        let event = PipelineEvent::ReadReceipt(ReadReceiptEvent {
            message_id: "m1".to_string(),
            sender_username: "alice".to_string(),
            receiver_username: "bob".to_string(),
        });

        let push = push_for(&event, &claims(1, "alice"), &HashSet::new()).unwrap();
        let frame: serde_json::Value = serde_json::from_str(&push).unwrap();
        assert_eq!(frame["channel"], "read-receipts");
        assert_eq!(frame["event"]["receiverUsername"], "bob");

        assert!(push_for(&event, &claims(2, "bob"), &HashSet::new()).is_none());
    }

    #[test]
    fn test_heartbeat_fits_inside_session_ttl() {
        use crate::presence::DEFAULT_SESSION_TTL;

        let period = heartbeat_period(DEFAULT_SESSION_TTL);
        // At least two beats per TTL, so one lost ping never expires a
        // live session
        assert!(period * 2 < DEFAULT_SESSION_TTL);
        assert!(!period.is_zero());
    }

    #[test]
    fn test_roster_delta_broadcast_to_all() {
        let event = PipelineEvent::Roster(RosterEvent {
            kind: RosterEventKind::Join,
            username: "alice".to_string(),
            online_users: "alice,bob".to_string(),
        });

        for (id, name) in [(1, "alice"), (2, "bob"), (9, "zed")] {
            let push = push_for(&event, &claims(id, name), &HashSet::new()).unwrap();
            let frame: serde_json::Value = serde_json::from_str(&push).unwrap();
            assert_eq!(frame["channel"], "presence");
            assert_eq!(frame["event"]["type"], "JOIN");
        }
    }
}
