use crate::error::RdvsError;
use crate::metrics::counters;
use crate::registry::{Admission, Outbound, PeerHandle};
use crate::server::ServerState;
use futures_util::SinkExt;
use rdv_common::envelope::{self, EnvelopeError, Inbound, MessageType};
use rdv_common::Role;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Classifies one inbound text frame and performs the resulting sends.
///
/// Local service types (`SET_ADMIN_KEY`, `REQUEST_ADMIN_KEY`) are answered
/// on the sender's own sink. Forwarded types are resolved to a peer by the
/// sender's role and delivered through that peer's outbound channel with
/// `senderId` stamped in. Malformed input and protocol misuse are dropped
/// without a reply.
///
/// # Errors
///
/// Returns an error only when a reply to the sender's own sink fails,
/// which means the sender's connection is gone.
pub async fn route<S>(
    state: &ServerState,
    sender: &Admission,
    text: &str,
    ws_tx: &mut S,
) -> Result<(), RdvsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            let reason = match err {
                EnvelopeError::UnknownType(_) => "unknown_type",
                _ => "malformed",
            };
            debug!(id = sender.id, error = %err, "dropping unparsable envelope");
            counters::messages_dropped_total(reason);
            return Ok(());
        }
    };

    match inbound.msg_type {
        MessageType::SetAdminKey => set_admin_key(state, sender, &inbound, ws_tx).await,
        MessageType::RequestAdminKey => request_admin_key(state, sender, ws_tx).await,
        MessageType::PublicKey | MessageType::Message => {
            forward(state, sender, inbound, ws_tx).await
        }
        other => {
            // Relay-originated types are never accepted from clients.
            debug!(
                id = sender.id,
                msg_type = other.as_str(),
                "dropping unroutable message type"
            );
            counters::messages_dropped_total("unroutable");
            Ok(())
        }
    }
}

/// Caches the admin key. Only the admin may set it, and the first write
/// wins; every other case is ignored without a reply.
async fn set_admin_key<S>(
    state: &ServerState,
    sender: &Admission,
    inbound: &Inbound,
    ws_tx: &mut S,
) -> Result<(), RdvsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    if sender.role != Role::Admin {
        debug!(id = sender.id, "ignoring SET_ADMIN_KEY from non-admin");
        counters::messages_dropped_total("not_admin");
        return Ok(());
    }
    let Some(key) = inbound.key() else {
        debug!(id = sender.id, "ignoring SET_ADMIN_KEY without key material");
        counters::messages_dropped_total("malformed");
        return Ok(());
    };
    if state.registry.set_key_if_absent(key.clone()) {
        reply(ws_tx, envelope::status("admin key stored")).await
    } else {
        debug!(id = sender.id, "ignoring SET_ADMIN_KEY, key already cached");
        counters::messages_dropped_total("key_already_set");
        Ok(())
    }
}

/// Answers a key request with the cached admin key, or ignores the
/// request when no key is cached yet.
async fn request_admin_key<S>(
    state: &ServerState,
    sender: &Admission,
    ws_tx: &mut S,
) -> Result<(), RdvsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    counters::key_requests_total();
    match state.registry.admin_key() {
        Some(key) => reply(ws_tx, envelope::admin_key_response(&key)).await,
        None => {
            debug!(id = sender.id, "ignoring REQUEST_ADMIN_KEY, no key cached");
            counters::messages_dropped_total("no_key");
            Ok(())
        }
    }
}

/// Resolves the recipient for a forwarded envelope and delivers it with
/// the sender's identifier stamped in.
async fn forward<S>(
    state: &ServerState,
    sender: &Admission,
    inbound: Inbound,
    ws_tx: &mut S,
) -> Result<(), RdvsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    let recipient: PeerHandle = match sender.role {
        Role::Admin => {
            let Some(target) = inbound.target_id() else {
                counters::messages_dropped_total("missing_target");
                return reply(ws_tx, envelope::error("targetId is required")).await;
            };
            match state.registry.lookup_user(target) {
                Some(handle) => handle,
                None => {
                    counters::messages_dropped_total("unknown_target");
                    let text = format!("user {target} is not connected");
                    return reply(ws_tx, envelope::error(&text)).await;
                }
            }
        }
        Role::User => match state.registry.admin_handle() {
            Some(handle) => handle,
            None => {
                counters::messages_dropped_total("no_admin");
                return reply(ws_tx, envelope::error("admin is not connected")).await;
            }
        },
    };

    let stamped = inbound.stamp_sender(sender.id);
    match recipient.tx.try_send(Outbound::Envelope(stamped)) {
        Ok(()) => {
            counters::messages_forwarded_total();
            Ok(())
        }
        Err(TrySendError::Full(_)) => {
            // Fire-and-forget delivery: a saturated recipient loses the
            // envelope rather than stalling the sender's event loop.
            debug!(
                id = sender.id,
                recipient = recipient.id,
                "recipient queue full, dropping envelope"
            );
            counters::messages_dropped_total("backpressure");
            Ok(())
        }
        Err(TrySendError::Closed(_)) => {
            // The recipient's task is gone but its disconnect has not been
            // processed yet; report it the same as an absent peer.
            counters::messages_dropped_total("recipient_gone");
            let text = match sender.role {
                Role::Admin => format!("user {} is not connected", recipient.id),
                Role::User => "admin is not connected".to_owned(),
            };
            reply(ws_tx, envelope::error(&text)).await
        }
    }
}

async fn reply<S>(ws_tx: &mut S, text: String) -> Result<(), RdvsError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|_| RdvsError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::Registry;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn test_state() -> ServerState {
        ServerState {
            registry: Registry::new(),
            config: ServerConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                metrics_addr: "127.0.0.1:0".parse().unwrap(),
                max_conns: 100,
                max_message: 65_536,
                ping_interval: 30,
                idle_timeout: 120,
                retain_admin_key: true,
            },
            active_connections: AtomicUsize::new(0),
        }
    }

    struct Peer {
        admission: Admission,
        rx: mpsc::Receiver<Outbound>,
    }

    fn admit(state: &ServerState, capacity: usize) -> Peer {
        let (tx, rx) = mpsc::channel(capacity);
        let admission = state.registry.admit(tx);
        Peer { admission, rx }
    }

    fn sink() -> (
        futures::channel::mpsc::UnboundedSender<Message>,
        futures::channel::mpsc::UnboundedReceiver<Message>,
    ) {
        futures::channel::mpsc::unbounded()
    }

    fn next_json(rx: &mut futures::channel::mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_next() {
            Ok(Some(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text reply, got {other:?}"),
        }
    }

    fn delivered_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Envelope(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected delivered envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_message_is_forwarded_to_admin_with_sender_stamp() {
        let state = test_state();
        let mut admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(
            &state,
            &user.admission,
            r#"{"type":"PUBLIC_KEY","payload":"X"}"#,
            &mut tx,
        )
        .await
        .unwrap();

        let delivered = delivered_json(&mut admin.rx);
        assert_eq!(
            delivered,
            json!({"type": "PUBLIC_KEY", "payload": "X", "senderId": user.admission.id})
        );
        // No reply goes back to the sender on a successful forward.
        assert!(rx.try_next().is_err());
    }

    #[tokio::test]
    async fn unrecognized_fields_survive_forwarding() {
        let state = test_state();
        let mut admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, _rx) = sink();

        route(
            &state,
            &user.admission,
            r#"{"type":"MESSAGE","body":"hi","nested":{"a":1},"n":7}"#,
            &mut tx,
        )
        .await
        .unwrap();

        let delivered = delivered_json(&mut admin.rx);
        assert_eq!(
            delivered,
            json!({
                "type": "MESSAGE",
                "body": "hi",
                "nested": {"a": 1},
                "n": 7,
                "senderId": user.admission.id,
            })
        );
    }

    #[tokio::test]
    async fn spoofed_sender_id_is_overwritten() {
        let state = test_state();
        let mut admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, _rx) = sink();

        route(
            &state,
            &user.admission,
            r#"{"type":"MESSAGE","senderId":999}"#,
            &mut tx,
        )
        .await
        .unwrap();

        let delivered = delivered_json(&mut admin.rx);
        assert_eq!(delivered["senderId"], json!(user.admission.id));
    }

    #[tokio::test]
    async fn admin_message_is_routed_to_target_user() {
        let state = test_state();
        let admin = admit(&state, 8);
        let mut user = admit(&state, 8);
        let (mut tx, _rx) = sink();

        let text = format!(
            r#"{{"type":"MESSAGE","targetId":{},"body":"hi"}}"#,
            user.admission.id
        );
        route(&state, &admin.admission, &text, &mut tx).await.unwrap();

        let delivered = delivered_json(&mut user.rx);
        assert_eq!(delivered["senderId"], json!(admin.admission.id));
        assert_eq!(delivered["body"], json!("hi"));
    }

    #[tokio::test]
    async fn admin_forward_without_target_errors() {
        let state = test_state();
        let admin = admit(&state, 8);
        let mut user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(&state, &admin.admission, r#"{"type":"MESSAGE"}"#, &mut tx)
            .await
            .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], json!("ERROR"));
        assert!(user.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admin_forward_to_unknown_target_errors() {
        let state = test_state();
        let admin = admit(&state, 8);
        let mut user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(
            &state,
            &admin.admission,
            r#"{"type":"MESSAGE","targetId":99}"#,
            &mut tx,
        )
        .await
        .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], json!("ERROR"));
        assert_eq!(reply["message"], json!("user 99 is not connected"));
        assert!(user.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_forward_without_admin_errors() {
        let state = test_state();
        // Register a user directly so no admin exists.
        let (tx_user, _rx_user) = mpsc::channel(8);
        state.registry.register_user(crate::registry::PeerHandle { id: 2, tx: tx_user });
        let sender = Admission {
            id: 2,
            role: Role::User,
        };
        let (mut tx, mut rx) = sink();

        route(&state, &sender, r#"{"type":"MESSAGE","body":"hi"}"#, &mut tx)
            .await
            .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], json!("ERROR"));
        assert_eq!(reply["message"], json!("admin is not connected"));
    }

    #[tokio::test]
    async fn set_admin_key_acks_and_stores() {
        let state = test_state();
        let admin = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(
            &state,
            &admin.admission,
            r#"{"type":"SET_ADMIN_KEY","key":"K1"}"#,
            &mut tx,
        )
        .await
        .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], json!("STATUS"));
        assert_eq!(state.registry.admin_key(), Some(json!("K1")));
    }

    #[tokio::test]
    async fn duplicate_set_admin_key_is_silent() {
        let state = test_state();
        let admin = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(
            &state,
            &admin.admission,
            r#"{"type":"SET_ADMIN_KEY","key":"K1"}"#,
            &mut tx,
        )
        .await
        .unwrap();
        let _ack = next_json(&mut rx);

        route(
            &state,
            &admin.admission,
            r#"{"type":"SET_ADMIN_KEY","key":"K2"}"#,
            &mut tx,
        )
        .await
        .unwrap();

        assert!(rx.try_next().is_err());
        assert_eq!(state.registry.admin_key(), Some(json!("K1")));
    }

    #[tokio::test]
    async fn non_admin_set_admin_key_is_silent() {
        let state = test_state();
        let _admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(
            &state,
            &user.admission,
            r#"{"type":"SET_ADMIN_KEY","key":"K1"}"#,
            &mut tx,
        )
        .await
        .unwrap();

        assert!(rx.try_next().is_err());
        assert_eq!(state.registry.admin_key(), None);
    }

    #[tokio::test]
    async fn set_admin_key_without_key_is_silent() {
        let state = test_state();
        let admin = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(&state, &admin.admission, r#"{"type":"SET_ADMIN_KEY"}"#, &mut tx)
            .await
            .unwrap();

        assert!(rx.try_next().is_err());
        assert_eq!(state.registry.admin_key(), None);
    }

    #[tokio::test]
    async fn request_admin_key_returns_cached_key() {
        let state = test_state();
        let _admin = admit(&state, 8);
        let user = admit(&state, 8);
        assert!(state.registry.set_key_if_absent(json!("K1")));
        let (mut tx, mut rx) = sink();

        route(&state, &user.admission, r#"{"type":"REQUEST_ADMIN_KEY"}"#, &mut tx)
            .await
            .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(
            reply,
            json!({"type": "ADMIN_KEY_RESPONSE", "key": "K1"})
        );
    }

    #[tokio::test]
    async fn request_admin_key_without_key_is_silent() {
        let state = test_state();
        let _admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(&state, &user.admission, r#"{"type":"REQUEST_ADMIN_KEY"}"#, &mut tx)
            .await
            .unwrap();

        assert!(rx.try_next().is_err());
    }

    #[tokio::test]
    async fn unroutable_type_is_dropped() {
        let state = test_state();
        let mut admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        // Relay-originated types are not accepted from clients.
        route(&state, &user.admission, r#"{"type":"STATUS"}"#, &mut tx)
            .await
            .unwrap();

        assert!(rx.try_next().is_err());
        assert!(admin.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_input_is_dropped() {
        let state = test_state();
        let mut admin = admit(&state, 8);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        for text in ["not json", "[1,2]", r#"{"body":"hi"}"#, r#"{"type":"NOPE"}"#] {
            route(&state, &user.admission, text, &mut tx).await.unwrap();
        }

        assert!(rx.try_next().is_err());
        assert!(admin.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_recipient_queue_drops_envelope() {
        let state = test_state();
        let mut admin = admit(&state, 1);
        let user = admit(&state, 8);
        let (mut tx, mut rx) = sink();

        route(&state, &user.admission, r#"{"type":"MESSAGE","n":1}"#, &mut tx)
            .await
            .unwrap();
        route(&state, &user.admission, r#"{"type":"MESSAGE","n":2}"#, &mut tx)
            .await
            .unwrap();

        // Only the first envelope fit; the overflow is dropped without an
        // error reply.
        assert_eq!(delivered_json(&mut admin.rx)["n"], json!(1));
        assert!(admin.rx.try_recv().is_err());
        assert!(rx.try_next().is_err());
    }
}
