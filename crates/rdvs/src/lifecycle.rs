use crate::metrics::gauges;
use crate::registry::{Admission, Outbound};
use crate::server::ServerState;
use rdv_common::envelope;
use rdv_common::{ConnectionId, Role};
use tracing::{debug, info};

/// Status text delivered to every user when the admin goes away.
const ADMIN_OFFLINE: &str = "admin offline, session ended";

/// Handles a disconnect event for the given connection.
///
/// Admin departure tears down the whole session: every user is sent a
/// final `STATUS` notice followed by a close command, then the admin slot
/// is cleared. A user departure removes only that session and notifies
/// the admin with `USER_LEFT`.
pub async fn disconnect(state: &ServerState, admission: &Admission) {
    match admission.role {
        Role::Admin => admin_teardown(state, admission.id).await,
        Role::User => user_teardown(state, admission.id),
    }
}

async fn admin_teardown(state: &ServerState, id: ConnectionId) {
    let evicted = state.registry.clear_all_users();
    info!(id, users = evicted.len(), "admin disconnected, ending session");

    for user in &evicted {
        let notice = Outbound::Envelope(envelope::status(ADMIN_OFFLINE));
        if user.tx.send(notice).await.is_err() || user.tx.send(Outbound::Close).await.is_err() {
            debug!(user = user.id, "user channel already gone during teardown");
        }
        gauges::dec_users_active();
    }

    state.registry.remove_admin(id);

    if !state.config.retain_admin_key {
        state.registry.clear_key();
        debug!("cleared cached admin key");
    }
}

fn user_teardown(state: &ServerState, id: ConnectionId) {
    // A user evicted by admin teardown is already deregistered by the
    // time its own disconnect fires; nothing further to do then.
    if !state.registry.remove_user(id) {
        return;
    }
    gauges::dec_users_active();
    debug!(id, "user disconnected");

    if let Some(admin) = state.registry.admin_handle() {
        let notice = Outbound::Envelope(envelope::user_left(id));
        if admin.tx.try_send(notice).is_err() {
            debug!(user = id, "admin queue full, USER_LEFT notice dropped");
        }
    }
}
