//! Per-room input actor.
//!
//! One actor owns all writes to a room. Commands arrive over a bounded mpsc
//! channel and are handled strictly in order, each answered through a
//! oneshot. An actor that sits idle closes its queue, finishes what was
//! already queued, and exits; the manager spawns a fresh one on next use.
//! Forgetting a room also runs here, so it is ordered against the membership
//! changes the room's events make.

use super::InputOutcome;
use super::InputRoomEvent;
use super::manager::RoomSlots;
use super::process::InputShared;
use crate::error::RoomserverError;
use crate::output::{OutputEvent, OutputRecord};
use crate::telemetry::spans;
use slroom_proto::{Membership, RoomId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{Instrument, debug, info};

pub(crate) enum RoomCommand {
    Input {
        input: Box<InputRoomEvent>,
        reply: oneshot::Sender<Result<InputOutcome, RoomserverError>>,
    },
    WriteOutput {
        events: Vec<OutputEvent>,
        reply: oneshot::Sender<Result<Vec<OutputRecord>, RoomserverError>>,
    },
    /// Drop a user's membership record. Answers whether one was removed.
    Forget {
        user_id: UserId,
        reply: oneshot::Sender<Result<bool, RoomserverError>>,
    },
}

pub(crate) struct RoomInputActor {
    room_id: RoomId,
    shared: Arc<InputShared>,
    idle: Duration,
}

impl RoomInputActor {
    /// Spawn an actor for `room_id`.
    ///
    /// `turn` is held for the actor's whole life, so a replacement spawned
    /// while this one drains its queue waits until it is done. On exit the
    /// actor hands its room back to `slots`.
    pub(crate) fn spawn(
        room_id: RoomId,
        shared: Arc<InputShared>,
        turn: Arc<Mutex<()>>,
        slots: Arc<RoomSlots>,
        capacity: usize,
        idle: Duration,
    ) -> mpsc::Sender<RoomCommand> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let span = spans::room(&room_id);
        let actor = Self {
            room_id: room_id.clone(),
            shared,
            idle,
        };
        tokio::spawn(
            async move {
                let turn = turn.lock_owned().await;
                actor.run(rx).await;
                drop(turn);
                slots.release(&room_id);
            }
            .instrument(span),
        );
        tx
    }

    async fn run(self, mut rx: mpsc::Receiver<RoomCommand>) {
        crate::metrics::actor_started();
        debug!("Room actor started");
        loop {
            match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(command)) => self.handle(command).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        self.handle(command).await;
                    }
                    break;
                }
            }
        }
        debug!("Room actor stopped");
        crate::metrics::actor_stopped();
    }

    async fn handle(&self, command: RoomCommand) {
        match command {
            RoomCommand::Input { input, reply } => {
                let result = self.shared.process(*input).await;
                // The caller may have given up; the event is committed either way.
                let _ = reply.send(result);
            }
            RoomCommand::WriteOutput { events, reply } => {
                let result = self.write_output(events).await;
                let _ = reply.send(result);
            }
            RoomCommand::Forget { user_id, reply } => {
                let result = self.forget(&user_id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn forget(&self, user_id: &UserId) -> Result<bool, RoomserverError> {
        let db = &self.shared.db;
        match db.membership(&self.room_id, user_id).await? {
            Some(record) if record.membership == Membership::Join => {
                return Err(RoomserverError::StillJoined(self.room_id.clone()));
            }
            Some(_) => {}
            None if db.room(&self.room_id).await?.is_none() => {
                return Err(RoomserverError::UnknownRoom(self.room_id.clone()));
            }
            None => {}
        }
        let purged = db.purge_membership(&self.room_id, user_id).await?;
        info!(user_id = %user_id, purged, "Forgot room");
        Ok(purged)
    }

    async fn write_output(
        &self,
        events: Vec<OutputEvent>,
    ) -> Result<Vec<OutputRecord>, RoomserverError> {
        let records = self.shared.db.append_output(&self.room_id, events).await?;
        self.shared.output.publish(records.clone());
        Ok(records)
    }
}
