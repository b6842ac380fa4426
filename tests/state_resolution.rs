//! Integration test: state resolution
//!
//! Builds forked room graphs in memory and checks that resolution picks the
//! same winner regardless of the order candidates are given in.

mod common;

use common::{room_id, user};
use proptest::prelude::*;
use serde_json::{Value, json};
use slroom_proto::{Event, EventBuilder, EventId, RoomVersion, StateKeyTuple, UserId, event_type};
use slroomd::resolution::resolve_state;
use slroomd::state::{EventMap, StateMap};
use std::sync::Arc;

/// A room graph kept entirely in memory.
struct Dag {
    events: EventMap,
    state: StateMap,
    head: Vec<EventId>,
    depth: u64,
    ts: i64,
}

impl Dag {
    fn new() -> Self {
        Self {
            events: EventMap::new(),
            state: StateMap::new(),
            head: Vec::new(),
            depth: 0,
            ts: 0,
        }
    }

    /// Build an event on the current head, citing auth from current state.
    fn build(&mut self, sender: &UserId, ty: &str, key: &str, content: Value) -> Event {
        self.ts += 1;
        let tuples = slroomd::auth::auth_types_for(ty, Some(key), sender, &content);
        let auth = tuples
            .iter()
            .filter_map(|t| self.state.get(t).cloned())
            .collect();
        let event = EventBuilder::new(room_id("!r:a.example"), sender.clone(), ty, content)
            .state_key(key)
            .prev_events(self.head.clone())
            .auth_events(auth)
            .depth(self.depth + 1)
            .origin_server_ts(self.ts)
            .build();
        self.events
            .insert(event.event_id().clone(), Arc::new(event.clone()));
        event
    }

    /// Build and apply to the linear state.
    fn push(&mut self, sender: &UserId, ty: &str, key: &str, content: Value) -> EventId {
        let event = self.build(sender, ty, key, content);
        let id = event.event_id().clone();
        self.state.insert(StateKeyTuple::new(ty, key), id.clone());
        self.head = vec![id.clone()];
        self.depth += 1;
        id
    }

    /// State with `event` applied on top of the current state, without
    /// moving the head.
    fn fork_with(&self, event: &Event) -> StateMap {
        let mut state = self.state.clone();
        if let Some(tuple) = event.state_key_tuple() {
            state.insert(tuple, event.event_id().clone());
        }
        state
    }
}

fn power_levels(levels: &[(&UserId, i64)]) -> Value {
    let users: serde_json::Map<String, Value> = levels
        .iter()
        .map(|(u, l)| (u.to_string(), json!(l)))
        .collect();
    json!({"users": users, "users_default": 0})
}

struct PowerFork {
    dag: Dag,
    raise: Event,
    lower: Event,
}

/// A=100, B=50, C=60. A raises B to 100 while C lowers B to 10.
fn power_fork() -> PowerFork {
    let a = user("@a:a.example");
    let b = user("@b:a.example");
    let c = user("@c:a.example");

    let mut dag = Dag::new();
    dag.push(&a, event_type::CREATE, "", json!({"room_version": "10"}));
    dag.push(&a, event_type::MEMBER, a.as_str(), json!({"membership": "join"}));
    dag.push(&a, event_type::POWER_LEVELS, "", power_levels(&[(&a, 100)]));
    dag.push(&a, event_type::JOIN_RULES, "", json!({"join_rule": "public"}));
    dag.push(&b, event_type::MEMBER, b.as_str(), json!({"membership": "join"}));
    dag.push(&c, event_type::MEMBER, c.as_str(), json!({"membership": "join"}));
    dag.push(
        &a,
        event_type::POWER_LEVELS,
        "",
        power_levels(&[(&a, 100), (&b, 50), (&c, 60)]),
    );

    let raise = dag.build(
        &a,
        event_type::POWER_LEVELS,
        "",
        power_levels(&[(&a, 100), (&b, 100), (&c, 60)]),
    );
    let lower = dag.build(
        &c,
        event_type::POWER_LEVELS,
        "",
        power_levels(&[(&a, 100), (&b, 10), (&c, 60)]),
    );
    PowerFork { dag, raise, lower }
}

#[test]
fn higher_power_edit_wins() {
    let fork = power_fork();
    let with_raise = fork.dag.fork_with(&fork.raise);
    let with_lower = fork.dag.fork_with(&fork.lower);
    let pl = StateKeyTuple::room(event_type::POWER_LEVELS);

    for candidates in [
        vec![with_raise.clone(), with_lower.clone()],
        vec![with_lower.clone(), with_raise.clone()],
    ] {
        let resolved = resolve_state(RoomVersion::V10, &candidates, &fork.dag.events).unwrap();
        assert_eq!(resolved.get(&pl), Some(fork.raise.event_id()));
    }
}

#[test]
fn identical_candidates_resolve_to_themselves() {
    let fork = power_fork();
    let state = fork.dag.state.clone();
    let resolved = resolve_state(
        RoomVersion::V10,
        &[state.clone(), state.clone(), state.clone()],
        &fork.dag.events,
    )
    .unwrap();
    assert_eq!(resolved, state);
}

#[test]
fn slots_missing_from_some_candidates_are_resolved() {
    let a = user("@a:a.example");
    let mut dag = Dag::new();
    dag.push(&a, event_type::CREATE, "", json!({"room_version": "10"}));
    dag.push(&a, event_type::MEMBER, a.as_str(), json!({"membership": "join"}));
    dag.push(&a, event_type::POWER_LEVELS, "", power_levels(&[(&a, 100)]));

    let name = dag.build(&a, event_type::NAME, "", json!({"name": "lobby"}));
    let topic = dag.build(&a, event_type::TOPIC, "", json!({"topic": "hello"}));
    let resolved = resolve_state(
        RoomVersion::V10,
        &[dag.fork_with(&name), dag.fork_with(&topic)],
        &dag.events,
    )
    .unwrap();

    assert_eq!(
        resolved.get(&StateKeyTuple::room(event_type::NAME)),
        Some(name.event_id())
    );
    assert_eq!(
        resolved.get(&StateKeyTuple::room(event_type::TOPIC)),
        Some(topic.event_id())
    );
}

#[test]
fn missing_auth_events_are_reported() {
    let fork = power_fork();
    let mut events = fork.dag.events.clone();
    let create = fork
        .dag
        .state
        .get(&StateKeyTuple::room(event_type::CREATE))
        .cloned()
        .unwrap();
    events.remove(&create);

    let result = resolve_state(
        RoomVersion::V10,
        &[fork.dag.fork_with(&fork.raise), fork.dag.fork_with(&fork.lower)],
        &events,
    );
    assert!(result.is_err());
}

#[test]
fn no_candidates_is_empty_state() {
    let resolved = resolve_state(RoomVersion::V10, &[], &EventMap::new()).unwrap();
    assert!(resolved.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn result_is_independent_of_candidate_order(order in Just(vec![0usize, 1, 2, 3]).prop_shuffle()) {
        let mut fork = power_fork();
        let a = user("@a:a.example");
        let name = fork.dag.build(&a, event_type::NAME, "", json!({"name": "one"}));
        let rename = fork.dag.build(&a, event_type::NAME, "", json!({"name": "two"}));
        let candidates = [
            fork.dag.fork_with(&fork.raise),
            fork.dag.fork_with(&fork.lower),
            fork.dag.fork_with(&name),
            fork.dag.fork_with(&rename),
        ];
        let baseline = resolve_state(RoomVersion::V10, &candidates, &fork.dag.events).unwrap();

        let permuted: Vec<StateMap> = order.iter().map(|&i| candidates[i].clone()).collect();
        let resolved = resolve_state(RoomVersion::V10, &permuted, &fork.dag.events).unwrap();
        prop_assert_eq!(resolved, baseline);
    }
}
