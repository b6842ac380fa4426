//! State resolution, version 2.
//!
//! 1. Split the candidates into unconflicted and conflicted slots.
//! 2. Full conflicted set = conflicted events plus the auth difference.
//! 3. Power events (and their auth ancestors in the set) are sorted by
//!    reverse topological power ordering and replayed with iterative auth
//!    checks on top of the unconflicted state.
//! 4. The rest are sorted by mainline position against the resolved power
//!    levels and replayed the same way.
//! 5. Unconflicted state is reapplied.

use super::ResolutionError;
use crate::auth::{AuthEventSet, auth_types_for_event, is_authorized};
use crate::state::{EventMap, StateMap};
use slroom_proto::{
    CreateContent, Event, EventId, Membership, PowerLevelsContent, StateKeyTuple, event_type,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

pub(super) fn resolve(
    snapshots: &[StateMap],
    events: &EventMap,
) -> Result<StateMap, ResolutionError> {
    let (unconflicted, conflicted) = partition(snapshots);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    let mut full_set: BTreeSet<EventId> = conflicted.values().flatten().cloned().collect();
    full_set.extend(auth_difference(snapshots, events)?);
    require(&full_set, events)?;

    let power_set = power_closure(&full_set, events)?;
    let power_order = reverse_topological_power_order(&power_set, events)?;
    let mut resolved = iterative_auth_checks(&power_order, unconflicted.clone(), events)?;

    let others: Vec<EventId> = full_set.difference(&power_set).cloned().collect();
    let others = mainline_order(others, &resolved, events)?;
    resolved = iterative_auth_checks(&others, resolved, events)?;

    for (tuple, id) in unconflicted.iter() {
        resolved.insert(tuple.clone(), id.clone());
    }
    Ok(resolved)
}

/// Slots every candidate agrees on, and for the rest every candidate event.
/// A slot missing from some candidate is conflicted.
fn partition(snapshots: &[StateMap]) -> (StateMap, BTreeMap<StateKeyTuple, BTreeSet<EventId>>) {
    let mut candidates: BTreeMap<StateKeyTuple, (usize, BTreeSet<EventId>)> = BTreeMap::new();
    for snapshot in snapshots {
        for (tuple, id) in snapshot.iter() {
            let entry = candidates.entry(tuple.clone()).or_default();
            entry.0 += 1;
            entry.1.insert(id.clone());
        }
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted = BTreeMap::new();
    for (tuple, (count, ids)) in candidates {
        if count == snapshots.len() && ids.len() == 1 {
            if let Some(id) = ids.into_iter().next() {
                unconflicted.insert(tuple, id);
            }
        } else {
            conflicted.insert(tuple, ids);
        }
    }
    (unconflicted, conflicted)
}

fn require(ids: &BTreeSet<EventId>, events: &EventMap) -> Result<(), ResolutionError> {
    let missing: Vec<EventId> = ids
        .iter()
        .filter(|id| !events.contains_key(*id))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ResolutionError::MissingEvents(missing))
    }
}

fn get<'a>(events: &'a EventMap, id: &EventId) -> Result<&'a Event, ResolutionError> {
    events
        .get(id)
        .map(|e| e.as_ref())
        .ok_or_else(|| ResolutionError::MissingEvents(vec![id.clone()]))
}

/// Full auth chain of `start`, excluding `start` itself.
pub(crate) fn auth_chain<'a>(
    start: impl IntoIterator<Item = &'a EventId>,
    events: &EventMap,
) -> Result<BTreeSet<EventId>, ResolutionError> {
    let mut chain = BTreeSet::new();
    let mut stack: Vec<EventId> = Vec::new();
    for id in start {
        stack.extend(get(events, id)?.auth_events().iter().cloned());
    }
    while let Some(id) = stack.pop() {
        if chain.insert(id.clone()) {
            stack.extend(get(events, &id)?.auth_events().iter().cloned());
        }
    }
    Ok(chain)
}

/// Events in some but not all candidates' auth chains.
fn auth_difference(
    snapshots: &[StateMap],
    events: &EventMap,
) -> Result<BTreeSet<EventId>, ResolutionError> {
    let mut chains = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let mut chain = auth_chain(snapshot.values(), events)?;
        chain.extend(snapshot.values().cloned());
        chains.push(chain);
    }
    let union: BTreeSet<EventId> = chains.iter().flatten().cloned().collect();
    Ok(union
        .into_iter()
        .filter(|id| !chains.iter().all(|c| c.contains(id)))
        .collect())
}

fn is_power_event(event: &Event) -> bool {
    if event.is_state_of(event_type::POWER_LEVELS, "")
        || event.is_state_of(event_type::JOIN_RULES, "")
        || event.is_state_of(event_type::CREATE, "")
    {
        return true;
    }
    if event.is_type(event_type::MEMBER)
        && let Ok(Some(membership)) = event.membership()
        && matches!(membership, Membership::Leave | Membership::Ban)
    {
        return event.state_key() != Some(event.sender().as_str());
    }
    false
}

/// Power events in the full set plus their auth ancestors that are also in it.
fn power_closure(
    full_set: &BTreeSet<EventId>,
    events: &EventMap,
) -> Result<BTreeSet<EventId>, ResolutionError> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<EventId> = Vec::new();
    for id in full_set {
        if is_power_event(get(events, id)?) {
            stack.push(id.clone());
        }
    }
    while let Some(id) = stack.pop() {
        if !closure.insert(id.clone()) {
            continue;
        }
        for auth_id in get(events, &id)?.auth_events() {
            if full_set.contains(auth_id) {
                stack.push(auth_id.clone());
            }
        }
    }
    Ok(closure)
}

/// Power level of the sender according to the event's own auth events.
fn sender_power_level(event: &Event, events: &EventMap) -> i64 {
    let mut power_levels = None;
    let mut create = None;
    for id in event.auth_events() {
        if let Some(auth) = events.get(id) {
            if auth.is_state_of(event_type::POWER_LEVELS, "") {
                power_levels = Some(auth);
            } else if auth.is_state_of(event_type::CREATE, "") {
                create = Some(auth);
            }
        }
    }
    if let Some(pl) = power_levels
        && let Ok(content) = PowerLevelsContent::from_value(pl.content(), false)
    {
        return content.user_level(event.sender());
    }
    let creator = create.map(|c| {
        CreateContent::from_value(c.content())
            .ok()
            .and_then(|content| content.creator)
            .unwrap_or_else(|| c.sender().clone())
    });
    if creator.as_ref() == Some(event.sender()) {
        100
    } else {
        0
    }
}

/// Sort key for ready events: higher power first, then older, then by id.
type PowerKey = (Reverse<i64>, i64, EventId);

/// Kahn's algorithm over the auth DAG restricted to `set`. Auth ancestors come
/// first; among ready events the one with the smallest [`PowerKey`] goes next.
fn reverse_topological_power_order(
    set: &BTreeSet<EventId>,
    events: &EventMap,
) -> Result<Vec<EventId>, ResolutionError> {
    let mut pending: HashMap<&EventId, usize> = HashMap::new();
    let mut dependents: HashMap<&EventId, Vec<&EventId>> = HashMap::new();
    for id in set {
        let event = get(events, id)?;
        let parents: BTreeSet<&EventId> = event
            .auth_events()
            .iter()
            .filter(|a| set.contains(*a))
            .collect();
        pending.insert(id, parents.len());
        for parent in parents {
            dependents.entry(parent).or_default().push(id);
        }
    }

    let key = |id: &EventId| -> Result<PowerKey, ResolutionError> {
        let event = get(events, id)?;
        Ok((
            Reverse(sender_power_level(event, events)),
            event.origin_server_ts(),
            id.clone(),
        ))
    };

    let mut ready = BinaryHeap::new();
    for (id, count) in &pending {
        if *count == 0 {
            ready.push(Reverse(key(*id)?));
        }
    }

    let mut order = Vec::with_capacity(set.len());
    while let Some(Reverse((_, _, id))) = ready.pop() {
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(count) = pending.get_mut(*child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(key(*child)?));
                    }
                }
            }
        }
        order.push(id);
    }
    Ok(order)
}

/// Replay `order` on top of `state`, keeping each state event that passes
/// authorization against the state built so far.
fn iterative_auth_checks(
    order: &[EventId],
    mut state: StateMap,
    events: &EventMap,
) -> Result<StateMap, ResolutionError> {
    for id in order {
        let event = get(events, id)?;
        let Some(tuple) = event.state_key_tuple() else {
            continue;
        };

        let mut auth = AuthEventSet::new();
        for auth_id in event.auth_events() {
            auth.insert(get(events, auth_id)?);
        }
        for needed in auth_types_for_event(event) {
            if let Some(current) = state.get(&needed) {
                auth.insert(get(events, current)?);
            }
        }

        match is_authorized(event, &auth) {
            Ok(()) => {
                state.insert(tuple, id.clone());
            }
            Err(reason) => {
                tracing::debug!(event_id = %id, %reason, "Event dropped during state resolution");
            }
        }
    }
    Ok(state)
}

/// Order non-power events by the position of their closest power levels
/// ancestor on the mainline of the resolved power levels event, then by
/// timestamp and id.
fn mainline_order(
    mut ids: Vec<EventId>,
    resolved: &StateMap,
    events: &EventMap,
) -> Result<Vec<EventId>, ResolutionError> {
    let mut mainline = Vec::new();
    let mut cursor = resolved
        .get(&StateKeyTuple::room(event_type::POWER_LEVELS))
        .cloned();
    while let Some(id) = cursor {
        cursor = power_levels_parent(get(events, &id)?, events);
        mainline.push(id);
    }
    let depth = mainline.len();
    let positions: HashMap<EventId, usize> = mainline
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, depth - i))
        .collect();

    let mut keys: HashMap<EventId, (usize, i64)> = HashMap::new();
    for id in &ids {
        let event = get(events, id)?;
        let mut position = 0;
        let mut cursor = power_levels_parent(event, events);
        while let Some(pl) = cursor {
            if let Some(p) = positions.get(&pl) {
                position = *p;
                break;
            }
            cursor = power_levels_parent(get(events, &pl)?, events);
        }
        keys.insert(id.clone(), (position, event.origin_server_ts()));
    }

    ids.sort_by(|a, b| keys[a].cmp(&keys[b]).then_with(|| a.cmp(b)));
    Ok(ids)
}

fn power_levels_parent(event: &Event, events: &EventMap) -> Option<EventId> {
    event
        .auth_events()
        .iter()
        .find(|id| {
            events
                .get(*id)
                .is_some_and(|e| e.is_state_of(event_type::POWER_LEVELS, ""))
        })
        .cloned()
}
