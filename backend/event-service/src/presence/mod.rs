/// Presence and admission control.
///
/// The room registry is the membership source of truth: occupancy is
/// recomputed by walking it, never by incrementing counters, so counts stay
/// correct across abrupt disconnects that fire no leave signal. Recomputes
/// are debounced to at most one per 500 ms window (leading edge).
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::Event;
use crate::websocket::ServerMessage;

pub mod debounce;

use debounce::Debouncer;

pub const PRESENCE_RECOMPUTE_WINDOW: Duration = Duration::from_millis(500);

pub type ConnId = Uuid;

pub fn interactive_room(admin_id: Uuid, fan_url: &str) -> String {
    format!("event:{admin_id}:{fan_url}")
}

pub fn producer_room(interactive_room: &str) -> String {
    format!("{interactive_room}:producer")
}

pub fn broadcast_room(broadcast_id: &str) -> String {
    format!("broadcast:{broadcast_id}")
}

fn is_interactive_room(name: &str) -> bool {
    name.starts_with("event:") && !name.ends_with(":producer")
}

/// Room membership table. Senders double as liveness probes: a closed
/// channel no longer counts and is pruned during snapshots.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    rooms: Arc<RwLock<HashMap<String, HashMap<ConnId, UnboundedSender<ServerMessage>>>>>,
}

impl PresenceRegistry {
    pub async fn join(&self, room: &str, id: ConnId, sender: UnboundedSender<ServerMessage>) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room.to_string()).or_default().insert(id, sender);
    }

    /// Remove one connection from every room it joined.
    pub async fn remove_connection(&self, id: ConnId) {
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(&id);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    pub async fn emit_to_room(&self, room: &str, message: ServerMessage) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(room) {
            for sender in members.values() {
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Current membership counts, pruning dead connections as it goes.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.retain(|_, sender| !sender.is_closed());
        }
        rooms.retain(|_, members| !members.is_empty());
        rooms
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }
}

pub struct PresenceController {
    registry: PresenceRegistry,
    /// interactive room -> stage session id, learned at join time.
    sessions: Arc<RwLock<HashMap<String, String>>>,
    /// stage session id -> connections, refreshed by recompute.
    counts: Arc<RwLock<HashMap<String, usize>>>,
    limit: Option<u32>,
    debouncer: Debouncer,
}

impl PresenceController {
    pub fn new(limit: Option<u32>) -> Self {
        let registry = PresenceRegistry::default();
        let sessions: Arc<RwLock<HashMap<String, String>>> = Arc::new(RwLock::new(HashMap::new()));
        let counts: Arc<RwLock<HashMap<String, usize>>> = Arc::new(RwLock::new(HashMap::new()));

        let registry_for_task = registry.clone();
        let sessions_for_task = sessions.clone();
        let counts_for_task = counts.clone();
        let debouncer = Debouncer::spawn(PRESENCE_RECOMPUTE_WINDOW, move || {
            let registry = registry_for_task.clone();
            let sessions = sessions_for_task.clone();
            let counts = counts_for_task.clone();
            async move {
                recompute(registry, sessions, counts, limit).await;
            }
        });

        Self {
            registry,
            sessions,
            counts,
            limit,
            debouncer,
        }
    }

    /// Admission decision for an interactive join: closed events never
    /// admit; otherwise admit unless the configured per-session limit has
    /// been reached.
    pub async fn able_to_join(&self, event: &Event) -> bool {
        if event.status().is_none() || event.is_closed() {
            return false;
        }
        match self.limit {
            None => true,
            Some(limit) => {
                let counts = self.counts.read().await;
                let current = counts
                    .get(&event.stage_session_id)
                    .copied()
                    .unwrap_or(0);
                current < limit as usize
            }
        }
    }

    pub async fn join_interactive(
        &self,
        event: &Event,
        id: ConnId,
        sender: UnboundedSender<ServerMessage>,
    ) {
        let room = interactive_room(event.admin_id, &event.fan_url);
        self.sessions
            .write()
            .await
            .insert(room.clone(), event.stage_session_id.clone());
        self.registry.join(&room, id, sender).await;
        self.debouncer.trigger();
    }

    pub async fn join_producer(
        &self,
        event: &Event,
        id: ConnId,
        sender: UnboundedSender<ServerMessage>,
    ) {
        let room = producer_room(&interactive_room(event.admin_id, &event.fan_url));
        self.sessions.write().await.insert(
            interactive_room(event.admin_id, &event.fan_url),
            event.stage_session_id.clone(),
        );
        self.registry.join(&room, id, sender).await;
        self.debouncer.trigger();
    }

    pub async fn join_room(&self, room: &str, id: ConnId, sender: UnboundedSender<ServerMessage>) {
        self.registry.join(room, id, sender).await;
        self.debouncer.trigger();
    }

    /// Abrupt disconnects carry no room information; drop the connection
    /// everywhere and let the recompute settle the counts.
    pub async fn disconnect(&self, id: ConnId) {
        self.registry.remove_connection(id).await;
        self.debouncer.trigger();
    }

    pub async fn emit_to_room(&self, room: &str, message: ServerMessage) {
        self.registry.emit_to_room(room, message).await;
    }

    pub async fn session_count(&self, stage_session_id: &str) -> usize {
        self.counts
            .read()
            .await
            .get(stage_session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Run the recompute synchronously, bypassing the debounce window.
    pub async fn recompute_now(&self) {
        recompute(
            self.registry.clone(),
            self.sessions.clone(),
            self.counts.clone(),
            self.limit,
        )
        .await;
    }
}

/// Walk the registry, rebuild per-session counts, and push each interactive
/// room's occupancy to that room's producers only.
async fn recompute(
    registry: PresenceRegistry,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    counts: Arc<RwLock<HashMap<String, usize>>>,
    limit: Option<u32>,
) {
    let rooms = registry.snapshot().await;
    let session_map = sessions.read().await.clone();

    let mut fresh: HashMap<String, usize> = HashMap::new();
    for (room, size) in &rooms {
        if !is_interactive_room(room) {
            continue;
        }
        if let Some(session_id) = session_map.get(room) {
            *fresh.entry(session_id.clone()).or_default() += size;
        }
    }
    tracing::debug!(rooms = rooms.len(), sessions = fresh.len(), "presence recomputed");
    *counts.write().await = fresh;

    let limit_label = match limit {
        Some(limit) => limit.to_string(),
        None => "∞".to_string(),
    };
    for (room, size) in &rooms {
        if !is_interactive_room(room) {
            continue;
        }
        let users = format!("{size} / {limit_label}");
        registry
            .emit_to_room(&producer_room(room), ServerMessage::UpdateInteractiveUsers { users })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventStatus;
    use crate::services::testing::{test_admin, test_event};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn burst_of_joins_recomputes_once_with_true_membership() {
        let controller = PresenceController::new(Some(10));
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        let (producer_tx, mut producer_rx) = unbounded_channel();
        controller
            .join_producer(&event, Uuid::new_v4(), producer_tx)
            .await;

        // Two fans arrive within the same window.
        let (fan1, _rx1) = unbounded_channel();
        let (fan2, _rx2) = unbounded_channel();
        controller.join_interactive(&event, Uuid::new_v4(), fan1).await;
        controller.join_interactive(&event, Uuid::new_v4(), fan2).await;

        sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.session_count("2_stage").await, 2);

        let mut pushes = Vec::new();
        while let Ok(msg) = producer_rx.try_recv() {
            pushes.push(msg);
        }
        assert_eq!(pushes.len(), 1, "leading-edge recompute pushes once");
        assert!(matches!(
            &pushes[0],
            ServerMessage::UpdateInteractiveUsers { users } if users == "2 / 10"
        ));

        // One trailing run after the quiet window.
        sleep(Duration::from_millis(600)).await;
        let mut trailing = Vec::new();
        while let Ok(msg) = producer_rx.try_recv() {
            trailing.push(msg);
        }
        assert_eq!(trailing.len(), 1);
    }

    #[tokio::test]
    async fn occupancy_is_recomputed_not_decremented() {
        let controller = PresenceController::new(None);
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        let id = Uuid::new_v4();
        let (fan, rx) = unbounded_channel();
        controller.join_interactive(&event, id, fan).await;
        controller.recompute_now().await;
        assert_eq!(controller.session_count("2_stage").await, 1);

        // The browser vanished: the channel closes, no leave event fires.
        drop(rx);
        controller.recompute_now().await;
        assert_eq!(controller.session_count("2_stage").await, 0);
    }

    #[tokio::test]
    async fn admission_enforces_per_session_limit() {
        let controller = PresenceController::new(Some(2));
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        assert!(controller.able_to_join(&event).await);

        let (a, _ra) = unbounded_channel();
        let (b, _rb) = unbounded_channel();
        controller.join_interactive(&event, Uuid::new_v4(), a).await;
        controller.join_interactive(&event, Uuid::new_v4(), b).await;
        controller.recompute_now().await;

        assert_eq!(controller.session_count("2_stage").await, 2);
        assert!(!controller.able_to_join(&event).await, "limit reached");
    }

    #[tokio::test]
    async fn unlimited_sessions_always_admit() {
        let controller = PresenceController::new(None);
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        for _ in 0..50 {
            let (tx, _rx) = unbounded_channel();
            controller.join_interactive(&event, Uuid::new_v4(), tx).await;
        }
        controller.recompute_now().await;
        assert!(controller.able_to_join(&event).await);
    }

    #[tokio::test]
    async fn closed_events_never_admit() {
        let controller = PresenceController::new(None);
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Closed);
        assert!(!controller.able_to_join(&event).await);
    }

    #[tokio::test]
    async fn disconnect_removes_connection_from_every_room() {
        let controller = PresenceController::new(None);
        let admin = test_admin(true);
        let event = test_event(&admin, EventStatus::Live);

        let id = Uuid::new_v4();
        let (tx, _rx) = unbounded_channel();
        controller.join_interactive(&event, id, tx.clone()).await;
        controller.join_room("broadcast:bcast-1", id, tx).await;
        controller.recompute_now().await;
        assert_eq!(controller.session_count("2_stage").await, 1);

        controller.disconnect(id).await;
        controller.recompute_now().await;
        assert_eq!(controller.session_count("2_stage").await, 0);
    }
}
