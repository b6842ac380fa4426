//! Event processing inside a room actor.
//!
//! Everything here runs with the room's actor turn held, so room records,
//! extremities and current state are read and written without interleaving.
//! Each event ends in exactly one [`Database::commit_event`] call.

use super::{InputKind, InputOutcome, InputRoomEvent};
use crate::auth::{AuthError, AuthEventSet, auth_types_for_event, check_auth_events, is_authorized};
use crate::error::RoomserverError;
use crate::output::{OutputEvent, OutputStream};
use crate::resolution::{load_inputs, load_inputs_with, resolve_state};
use crate::security::ServerAcls;
use crate::state::{SnapshotId, StateDelta, StateMap, StateSnapshot, state_delta};
use crate::storage::{
    Database, EventCommit, EventStatus, MembershipRecord, RoomRecord, StorageError, StoredEvent,
};
use slroom_proto::{
    CreateContent, Event, EventId, Membership, RoomId, RoomVersion, ServerName, StateKeyTuple,
    UserId, event_type,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the room actors share.
pub(crate) struct InputShared {
    pub(crate) local: ServerName,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) acls: Arc<ServerAcls>,
    pub(crate) output: OutputStream,
}

/// Why an event was not accepted.
enum Refusal {
    /// Not allowed. Stored as rejected.
    Rejected {
        reason: AuthError,
        state_before: Option<StateSnapshot>,
    },
    /// No decision could be reached. Nothing is stored.
    Failed(RoomserverError),
}

impl Refusal {
    fn rejected(reason: AuthError) -> Self {
        Self::Rejected {
            reason,
            state_before: None,
        }
    }
}

impl From<RoomserverError> for Refusal {
    fn from(err: RoomserverError) -> Self {
        Self::Failed(err)
    }
}

impl From<StorageError> for Refusal {
    fn from(err: StorageError) -> Self {
        Self::Failed(err.into())
    }
}

enum PrevState {
    Known(StateSnapshot),
    Missing(Vec<EventId>),
}

/// Room version named by a create event. A missing version means "1".
pub(crate) fn version_of_create(create: &Event) -> Result<RoomVersion, RoomserverError> {
    let content = CreateContent::from_value(create.content())
        .map_err(|e| RoomserverError::BadRequest(e.to_string()))?;
    Ok(content.room_version.as_deref().unwrap_or("1").parse()?)
}

impl InputShared {
    pub(crate) async fn process(
        &self,
        input: InputRoomEvent,
    ) -> Result<InputOutcome, RoomserverError> {
        if let Some(existing) = self.db.event(input.event.event_id()).await? {
            match &existing.status {
                EventStatus::Rejected { reason } => {
                    return Err(RoomserverError::Unauthorized {
                        event_id: Some(existing.event_id().clone()),
                        reason: reason.clone(),
                    });
                }
                EventStatus::Outlier if input.kind != InputKind::Outlier => {
                    debug!(event_id = %existing.event_id(), "Upgrading outlier");
                }
                _ => return Ok(InputOutcome::stored(&existing, true)),
            }
        }

        let result = match input.kind {
            InputKind::New => self.process_new(&input).await,
            InputKind::Outlier => self.process_outlier(&input).await,
            InputKind::Old => self.process_old(&input).await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(Refusal::Failed(err)) => Err(err),
            Err(Refusal::Rejected {
                reason,
                state_before,
            }) => Err(self.reject(&input.event, reason, state_before).await),
        }
    }

    // ========================================================================
    // Live events
    // ========================================================================

    async fn process_new(&self, input: &InputRoomEvent) -> Result<InputOutcome, Refusal> {
        let event = &input.event;
        let room_id = event.room_id();
        let room = self.db.room(room_id).await?;

        self.check_own_auth(event).await?;
        let before = if input.has_state {
            self.state_from_ids(event.event_id(), &input.state_event_ids)
                .await?
        } else {
            match self.prev_state(event, room.as_ref()).await? {
                PrevState::Known(before) => before,
                PrevState::Missing(missing) => {
                    return Err(RoomserverError::MissingPrevState {
                        event_id: event.event_id().clone(),
                        missing,
                    }
                    .into());
                }
            }
        };
        self.check_state_auth(event, &before).await?;

        let version = match &room {
            Some(room) => room.version,
            None if event.is_type(event_type::CREATE) => version_of_create(event)?,
            None => {
                self.room_version(None, std::slice::from_ref(before.state()))
                    .await?
            }
        };
        let after = before.with_event(event);

        let mut extremities: BTreeSet<EventId> = room
            .as_ref()
            .map(|r| r.forward_extremities.iter().cloned().collect())
            .unwrap_or_default();
        for prev in event.prev_events() {
            extremities.remove(prev);
        }
        extremities.insert(event.event_id().clone());

        let old_current = match &room {
            Some(room) => self.load_snapshot(&room.current_state).await?,
            None => StateSnapshot::empty(),
        };
        let current = self
            .current_state(version, &extremities, event, &after)
            .await?;
        let delta = state_delta(old_current.state(), current.state());
        let (memberships, membership_outputs) = self
            .membership_updates(version, event, &delta, &current)
            .await?;

        let stored = StoredEvent {
            event: event.clone(),
            status: EventStatus::Accepted,
            state_before: Some(before.id().clone()),
            state_after: Some(after.id().clone()),
        };
        let latest_event_ids: Vec<EventId> = extremities.into_iter().collect();
        let mut commit = EventCommit::new(stored.clone());
        commit.snapshots = dedup_snapshots([before, after, current.clone()]);
        commit.room = Some(RoomRecord {
            room_id: room_id.clone(),
            version,
            forward_extremities: latest_event_ids.clone(),
            current_state: current.id().clone(),
            depth: room.as_ref().map_or(0, |r| r.depth).max(event.depth()),
        });
        commit.memberships = memberships;
        commit.outputs.push(OutputEvent::NewRoomEvent {
            event: event.clone(),
            added_state_event_ids: delta.added.clone(),
            removed_state_event_ids: delta.removed.clone(),
            latest_event_ids,
            transaction_id: input.transaction_id.clone(),
        });
        commit.outputs.extend(membership_outputs);

        let records = self.db.commit_event(commit).await?;

        let acl_tuple = StateKeyTuple::room(event_type::SERVER_ACL);
        if old_current.get(&acl_tuple) != current.get(&acl_tuple) {
            self.refresh_acl(event, current.get(&acl_tuple)).await?;
        }

        self.output.publish(records);
        info!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            room_id = %room_id,
            "Accepted event"
        );
        Ok(InputOutcome::stored(&stored, false))
    }

    /// Current state after `event` joins the forward extremities.
    async fn current_state(
        &self,
        version: RoomVersion,
        extremities: &BTreeSet<EventId>,
        event: &Event,
        after: &StateSnapshot,
    ) -> Result<StateSnapshot, RoomserverError> {
        let mut snapshots: BTreeMap<SnapshotId, StateSnapshot> = BTreeMap::new();
        snapshots.insert(after.id().clone(), after.clone());

        let others: Vec<EventId> = extremities
            .iter()
            .filter(|id| *id != event.event_id())
            .cloned()
            .collect();
        for stored in self.db.events(&others).await? {
            let Some(id) = stored.state_after else {
                continue;
            };
            if !snapshots.contains_key(&id) {
                let snapshot = self.load_snapshot(&id).await?;
                snapshots.insert(id, snapshot);
            }
        }

        if snapshots.len() == 1 {
            return Ok(after.clone());
        }
        let maps: Vec<StateMap> = snapshots.into_values().map(|s| s.into_state()).collect();
        let pending = [Arc::new(event.clone())];
        let events = load_inputs_with(self.db.as_ref(), &maps, &pending).await?;
        let resolved = resolve_state(version, &maps, &events)?;
        debug!(candidates = maps.len(), "Resolved current state");
        Ok(StateSnapshot::new(resolved))
    }

    /// Membership records and invite outputs for member events entering or
    /// leaving current state.
    async fn membership_updates(
        &self,
        version: RoomVersion,
        event: &Event,
        delta: &StateDelta,
        current: &StateSnapshot,
    ) -> Result<(Vec<MembershipRecord>, Vec<OutputEvent>), RoomserverError> {
        let mut added: Vec<Event> = Vec::with_capacity(delta.added.len());
        let others: Vec<EventId> = delta
            .added
            .iter()
            .filter(|id| *id != event.event_id())
            .cloned()
            .collect();
        if delta.added.contains(event.event_id()) {
            added.push(event.clone());
        }
        added.extend(self.db.events(&others).await?.into_iter().map(|s| s.event));

        let mut records = Vec::new();
        let mut outputs = Vec::new();
        for member in added.iter().filter(|e| e.is_type(event_type::MEMBER)) {
            let (Some(target), Ok(Some(membership))) = (member.membership_target(), member.membership())
            else {
                continue;
            };
            let existing = self.db.membership(member.room_id(), &target).await?;
            if target.server_name() == self.local {
                outputs.extend(invite_transitions(
                    version,
                    member,
                    &target,
                    membership,
                    existing.as_ref(),
                ));
            }
            records.push(MembershipRecord {
                room_id: member.room_id().clone(),
                user_id: target,
                membership,
                event_id: member.event_id().clone(),
                joined_before: membership == Membership::Join
                    || existing.is_some_and(|r| r.joined_before),
            });
        }

        // A member slot resolution dropped without a replacement leaves the
        // user with no membership event: recorded as a leave.
        for dropped in self.db.events(&delta.removed).await? {
            let member = &dropped.event;
            if !member.is_type(event_type::MEMBER) {
                continue;
            }
            let (Some(target), Some(tuple)) = (member.membership_target(), member.state_key_tuple())
            else {
                continue;
            };
            if current.get(&tuple).is_some() {
                continue;
            }
            let Some(existing) = self.db.membership(member.room_id(), &target).await? else {
                continue;
            };
            if &existing.event_id != member.event_id() || existing.membership == Membership::Leave {
                continue;
            }
            debug!(user_id = %target, event_id = %member.event_id(), "Member slot dropped from current state");
            if existing.membership == Membership::Invite && target.server_name() == self.local {
                outputs.push(OutputEvent::RetireInviteEvent {
                    event_id: existing.event_id.clone(),
                    target: target.clone(),
                    membership: Membership::Leave,
                    retired_by: None,
                });
            }
            records.push(MembershipRecord {
                membership: Membership::Leave,
                joined_before: existing.joined_before || existing.membership == Membership::Join,
                ..existing
            });
        }
        Ok((records, outputs))
    }

    async fn refresh_acl(
        &self,
        event: &Event,
        acl_event_id: Option<&EventId>,
    ) -> Result<(), RoomserverError> {
        let acl_event = match acl_event_id {
            None => None,
            Some(id) if id == event.event_id() => Some(event.clone()),
            Some(id) => self.db.event(id).await?.map(|s| s.event),
        };
        self.acls.on_acl_state(event.room_id(), acl_event.as_ref());
        debug!(room_id = %event.room_id(), "Server ACL updated");
        Ok(())
    }

    // ========================================================================
    // Outliers and backfill
    // ========================================================================

    async fn process_outlier(&self, input: &InputRoomEvent) -> Result<InputOutcome, Refusal> {
        let event = &input.event;
        let auth_events = self.check_own_auth(event).await?;

        let stored = StoredEvent {
            event: event.clone(),
            status: EventStatus::Outlier,
            state_before: None,
            state_after: None,
        };
        let mut commit = EventCommit::new(stored.clone());

        // Rooms we are not in have no state to derive membership from, so
        // invites and their rejections are tracked from the events themselves.
        if event.is_type(event_type::MEMBER)
            && let Some(target) = event.membership_target()
            && target.server_name() == self.local
            && let Ok(Some(membership)) = event.membership()
            && !self.is_resident(event.room_id()).await?
        {
            let existing = self.db.membership(event.room_id(), &target).await?;
            if self.supersedes(event, existing.as_ref()).await? {
                let version = match auth_events.iter().find(|e| e.is_type(event_type::CREATE)) {
                    Some(create) => version_of_create(create)?,
                    None => RoomVersion::DEFAULT,
                };
                commit.outputs = invite_transitions(
                    version,
                    event,
                    &target,
                    membership,
                    existing.as_ref(),
                );
                commit.memberships.push(MembershipRecord {
                    room_id: event.room_id().clone(),
                    user_id: target,
                    membership,
                    event_id: event.event_id().clone(),
                    joined_before: membership == Membership::Join
                        || existing.is_some_and(|r| r.joined_before),
                });
            }
        }

        let records = self.db.commit_event(commit).await?;
        self.output.publish(records);
        debug!(event_id = %event.event_id(), "Stored outlier");
        Ok(InputOutcome::stored(&stored, false))
    }

    /// Whether a local user is joined to the room in current state.
    async fn is_resident(&self, room_id: &RoomId) -> Result<bool, RoomserverError> {
        let Some(room) = self.db.room(room_id).await? else {
            return Ok(false);
        };
        let current = self.load_snapshot(&room.current_state).await?;
        let local_members: Vec<EventId> = current
            .state()
            .iter()
            .filter(|(tuple, _)| {
                tuple.event_type == event_type::MEMBER
                    && UserId::parse(tuple.state_key.as_str())
                        .is_ok_and(|user| user.server_name() == self.local)
            })
            .map(|(_, id)| id.clone())
            .collect();
        Ok(self
            .db
            .events(&local_members)
            .await?
            .iter()
            .any(|s| matches!(s.event.membership(), Ok(Some(Membership::Join)))))
    }

    /// Whether `event` is newer than the event behind `existing`.
    async fn supersedes(
        &self,
        event: &Event,
        existing: Option<&MembershipRecord>,
    ) -> Result<bool, RoomserverError> {
        let Some(existing) = existing else {
            return Ok(true);
        };
        if &existing.event_id == event.event_id() {
            return Ok(false);
        }
        Ok(match self.db.event(&existing.event_id).await? {
            Some(previous) => event.depth() >= previous.event.depth(),
            None => true,
        })
    }

    async fn process_old(&self, input: &InputRoomEvent) -> Result<InputOutcome, Refusal> {
        let event = &input.event;
        self.check_own_auth(event).await?;
        let room = self.db.room(event.room_id()).await?;

        let mut stored = StoredEvent {
            event: event.clone(),
            status: EventStatus::Historical,
            state_before: None,
            state_after: None,
        };
        let mut snapshots = Vec::new();
        if let PrevState::Known(before) = self.prev_state(event, room.as_ref()).await? {
            self.check_state_auth(event, &before).await?;
            let after = before.with_event(event);
            stored.state_before = Some(before.id().clone());
            stored.state_after = Some(after.id().clone());
            snapshots = dedup_snapshots([before, after]);
        }

        let mut commit = EventCommit::new(stored.clone());
        commit.snapshots = snapshots;
        commit.outputs.push(OutputEvent::OldRoomEvent {
            event: event.clone(),
        });
        let records = self.db.commit_event(commit).await?;
        self.output.publish(records);
        debug!(event_id = %event.event_id(), has_state = stored.state_after.is_some(), "Stored backfilled event");
        Ok(InputOutcome::stored(&stored, false))
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Check `event` against the auth events it cites. Returns those events.
    async fn check_own_auth(&self, event: &Event) -> Result<Vec<Event>, Refusal> {
        let stored = self.db.events(event.auth_events()).await?;
        let missing: Vec<EventId> = event
            .auth_events()
            .iter()
            .filter(|id| !stored.iter().any(|s| s.event_id() == *id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RoomserverError::MissingAuthEvent { missing }.into());
        }
        if let Some(rejected) = stored.iter().find(|s| s.is_rejected()) {
            return Err(Refusal::rejected(AuthError::AuthEvents(format!(
                "{} was rejected",
                rejected.event_id()
            ))));
        }

        let auth_events: Vec<Event> = stored.into_iter().map(|s| s.event).collect();
        let refs: Vec<&Event> = auth_events.iter().collect();
        check_auth_events(event, &refs).map_err(Refusal::rejected)?;
        is_authorized(event, &AuthEventSet::from_events(refs.iter().copied()))
            .map_err(Refusal::rejected)?;
        Ok(auth_events)
    }

    /// Check `event` against the room state before it.
    async fn check_state_auth(&self, event: &Event, before: &StateSnapshot) -> Result<(), Refusal> {
        let tuples = auth_types_for_event(event);
        let ids = if tuples.is_empty() {
            Vec::new()
        } else {
            before.event_ids(&tuples)
        };
        let stored = self.db.events(&ids).await?;
        if stored.len() != ids.len() {
            return Err(RoomserverError::StateUnavailable(format!(
                "state events needed to authorize {} are missing",
                event.event_id()
            ))
            .into());
        }
        let state_events: Vec<Event> = stored.into_iter().map(|s| s.event).collect();
        is_authorized(event, &AuthEventSet::from_events(state_events.iter())).map_err(|reason| {
            Refusal::Rejected {
                reason,
                state_before: Some(before.clone()),
            }
        })
    }

    async fn reject(
        &self,
        event: &Event,
        reason: AuthError,
        state_before: Option<StateSnapshot>,
    ) -> RoomserverError {
        warn!(event_id = %event.event_id(), reason = %reason, "Rejected event");
        let mut commit = EventCommit::new(StoredEvent {
            event: event.clone(),
            status: EventStatus::Rejected {
                reason: reason.to_string(),
            },
            state_before: state_before.as_ref().map(|s| s.id().clone()),
            state_after: None,
        });
        commit.snapshots.extend(state_before);
        if let Err(err) = self.db.commit_event(commit).await {
            return err.into();
        }
        RoomserverError::unauthorized(event.event_id(), &reason)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// State before `event` derived from its prev events.
    async fn prev_state(
        &self,
        event: &Event,
        room: Option<&RoomRecord>,
    ) -> Result<PrevState, RoomserverError> {
        if event.prev_events().is_empty() {
            return Ok(if event.is_type(event_type::CREATE) {
                PrevState::Known(StateSnapshot::empty())
            } else {
                PrevState::Missing(Vec::new())
            });
        }

        let prevs = self.db.events(event.prev_events()).await?;
        let mut missing = Vec::new();
        let mut snapshot_ids = BTreeSet::new();
        for id in event.prev_events() {
            let state = prevs.iter().find(|p| p.event_id() == id).and_then(|p| {
                // Children of a rejected event see the state it was rejected against.
                p.state_after.clone().or_else(|| {
                    if p.is_rejected() {
                        p.state_before.clone()
                    } else {
                        None
                    }
                })
            });
            match state {
                Some(snapshot_id) => {
                    snapshot_ids.insert(snapshot_id);
                }
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            return Ok(PrevState::Missing(missing));
        }

        let mut snapshots = Vec::with_capacity(snapshot_ids.len());
        for id in &snapshot_ids {
            snapshots.push(self.load_snapshot(id).await?);
        }
        if snapshots.len() == 1 {
            return Ok(PrevState::Known(snapshots.remove(0)));
        }

        let maps: Vec<StateMap> = snapshots.into_iter().map(|s| s.into_state()).collect();
        let version = self.room_version(room, &maps).await?;
        let events = load_inputs(self.db.as_ref(), &maps).await?;
        let resolved = resolve_state(version, &maps, &events)?;
        Ok(PrevState::Known(StateSnapshot::new(resolved)))
    }

    /// State given explicitly as a list of state event ids.
    async fn state_from_ids(
        &self,
        event_id: &EventId,
        ids: &[EventId],
    ) -> Result<StateSnapshot, Refusal> {
        let stored = self.db.events(ids).await?;
        let missing: Vec<EventId> = ids
            .iter()
            .filter(|id| !stored.iter().any(|s| s.event_id() == *id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RoomserverError::MissingPrevState {
                event_id: event_id.clone(),
                missing,
            }
            .into());
        }

        let mut state = StateMap::new();
        for s in stored {
            let tuple = s
                .event
                .state_key_tuple()
                .filter(|_| !s.is_rejected())
                .ok_or_else(|| {
                    RoomserverError::BadRequest(format!(
                        "{} cannot be part of room state",
                        s.event_id()
                    ))
                })?;
            state.insert(tuple, s.event_id().clone());
        }
        Ok(StateSnapshot::new(state))
    }

    async fn room_version(
        &self,
        room: Option<&RoomRecord>,
        maps: &[StateMap],
    ) -> Result<RoomVersion, RoomserverError> {
        if let Some(room) = room {
            return Ok(room.version);
        }
        let create_tuple = StateKeyTuple::room(event_type::CREATE);
        let create_id = maps
            .iter()
            .find_map(|m| m.get(&create_tuple))
            .ok_or_else(|| RoomserverError::StateUnavailable("no create event in state".into()))?;
        let create = self
            .db
            .event(create_id)
            .await?
            .ok_or_else(|| RoomserverError::MissingAuthEvent {
                missing: vec![create_id.clone()],
            })?;
        version_of_create(&create.event)
    }

    async fn load_snapshot(&self, id: &SnapshotId) -> Result<StateSnapshot, RoomserverError> {
        self.db
            .snapshot(id)
            .await?
            .ok_or_else(|| RoomserverError::StateUnavailable(format!("snapshot {id}")))
    }
}

/// Outputs for a local user's membership moving to `membership`.
fn invite_transitions(
    version: RoomVersion,
    member: &Event,
    target: &UserId,
    membership: Membership,
    existing: Option<&MembershipRecord>,
) -> Vec<OutputEvent> {
    let mut outputs = Vec::new();
    if let Some(previous) = existing
        && previous.membership == Membership::Invite
        && membership != Membership::Invite
        && &previous.event_id != member.event_id()
    {
        outputs.push(OutputEvent::RetireInviteEvent {
            event_id: previous.event_id.clone(),
            target: target.clone(),
            membership,
            retired_by: Some(member.event_id().clone()),
        });
    }
    if membership == Membership::Invite
        && existing.is_none_or(|r| &r.event_id != member.event_id())
    {
        outputs.push(OutputEvent::NewInviteEvent {
            event: member.clone(),
            room_version: version,
        });
    }
    outputs
}

fn dedup_snapshots(snapshots: impl IntoIterator<Item = StateSnapshot>) -> Vec<StateSnapshot> {
    let mut seen = BTreeSet::new();
    snapshots
        .into_iter()
        .filter(|s| seen.insert(s.id().clone()))
        .collect()
}
