//! Registry of per-room input actors.

use super::actor::{RoomCommand, RoomInputActor};
use super::process::InputShared;
use crate::error::RoomserverError;
use dashmap::DashMap;
use slroom_proto::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Attempts at delivering a command before giving up. A send only fails when
/// the actor shut down in between lookup and send, so one retry normally does.
const SEND_ATTEMPTS: usize = 3;

/// Channels and turn locks of the rooms that have, or just had, an actor.
#[derive(Default)]
pub(crate) struct RoomSlots {
    actors: DashMap<RoomId, mpsc::Sender<RoomCommand>>,
    turns: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl RoomSlots {
    /// Called by an actor after it exits and gives up its turn. Drops the
    /// room's channel if nothing replaced it, and the turn lock once no other
    /// actor holds or waits on it.
    pub(crate) fn release(&self, room_id: &RoomId) {
        self.actors.remove_if(room_id, |_, tx| tx.is_closed());
        self.turns
            .remove_if(room_id, |_, turn| Arc::strong_count(turn) == 1);
    }
}

/// The RoomActorManager is responsible for:
/// - Spawning an input actor the first time a room is touched.
/// - Replacing actors that shut down after idling.
/// - Making sure at most one actor per room processes commands at a time.
pub(crate) struct RoomActorManager {
    shared: Arc<InputShared>,
    slots: Arc<RoomSlots>,
    capacity: usize,
    idle: Duration,
}

impl RoomActorManager {
    pub(crate) fn new(shared: Arc<InputShared>, capacity: usize, idle: Duration) -> Self {
        Self {
            shared,
            slots: Arc::new(RoomSlots::default()),
            capacity,
            idle,
        }
    }

    fn sender(&self, room_id: &RoomId) -> mpsc::Sender<RoomCommand> {
        self.slots
            .actors
            .entry(room_id.clone())
            .or_insert_with(|| {
                let turn = self.slots.turns.entry(room_id.clone()).or_default().clone();
                RoomInputActor::spawn(
                    room_id.clone(),
                    Arc::clone(&self.shared),
                    turn,
                    Arc::clone(&self.slots),
                    self.capacity,
                    self.idle,
                )
            })
            .clone()
    }

    /// Deliver `command` to the room's actor, spawning one if needed.
    pub(crate) async fn send(
        &self,
        room_id: &RoomId,
        mut command: RoomCommand,
    ) -> Result<(), RoomserverError> {
        for _ in 0..SEND_ATTEMPTS {
            let tx = self.sender(room_id);
            match tx.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    debug!(room_id = %room_id, "Room actor gone, respawning");
                    self.slots
                        .actors
                        .remove_if(room_id, |_, current| current.same_channel(&tx));
                    command = returned;
                }
            }
        }
        Err(RoomserverError::Internal(format!(
            "no input actor available for {room_id}"
        )))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots
            .actors
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStream;
    use crate::security::ServerAcls;
    use crate::storage::Database;
    use crate::storage::memory::MemoryDatabase;
    use slroom_proto::ServerName;
    use tokio::sync::oneshot;

    fn manager(idle: Duration) -> RoomActorManager {
        let local = ServerName::parse("a.example").unwrap();
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let shared = Arc::new(InputShared {
            acls: Arc::new(ServerAcls::new(Arc::clone(&db), local.clone())),
            local,
            db,
            output: OutputStream::new(16),
        });
        RoomActorManager::new(shared, 8, idle)
    }

    async fn touch(manager: &RoomActorManager, room_id: &RoomId) {
        let (reply, rx) = oneshot::channel();
        manager
            .send(room_id, RoomCommand::WriteOutput { events: Vec::new(), reply })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_actors_release_their_slots() {
        let manager = manager(Duration::from_millis(20));
        let rooms: Vec<RoomId> = (0..4)
            .map(|i| RoomId::parse(format!("!r{i}:a.example")).unwrap())
            .collect();
        for room_id in &rooms {
            touch(&manager, room_id).await;
        }
        assert_eq!(manager.len(), 4);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !manager.slots.actors.is_empty() || !manager.slots.turns.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "slots never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A released room gets a fresh actor on next use.
        touch(&manager, &rooms[0]).await;
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.slots.turns.len(), 1);
    }

    #[tokio::test]
    async fn release_keeps_a_running_actor() {
        let manager = manager(Duration::from_secs(60));
        let room_id = RoomId::parse("!r:a.example").unwrap();
        touch(&manager, &room_id).await;

        // A running actor still holds its turn and an open channel.
        manager.slots.release(&room_id);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.slots.turns.len(), 1);
    }
}
