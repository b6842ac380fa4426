//! Integration test: room state on a single server
//!
//! Drives the input pipeline directly and checks current state, the query
//! engine, rejection handling and server ACLs.

mod common;

use common::room::tick;
use common::{TestRoom, room_id, server_name, single_server, user};
use serde_json::json;
use slroom_proto::{EventBuilder, EventId, Membership, RoomVersion, StateKeyTuple, UserId, event_type};
use slroomd::Roomserver;
use slroomd::ErrorKind;
use slroomd::api::*;
use slroomd::context::RequestContext;
use slroomd::input::{InputKind, InputRoomEvent};
use slroomd::output::OutputEvent;
use slroomd::storage::EventStatus;

async fn latest_event_ids(server: &Roomserver, room: &TestRoom) -> anyhow::Result<Vec<EventId>> {
    Ok(server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?
        .latest_event_ids)
}

async fn current_event_id(
    server: &Roomserver,
    room: &TestRoom,
    ty: &str,
    state_key: &str,
) -> anyhow::Result<Option<EventId>> {
    Ok(server
        .query_state_event(&QueryStateEventRequest {
            room_id: room.room_id.clone(),
            event_type: ty.into(),
            state_key: state_key.into(),
        })
        .await
        .into_result()?
        .event
        .map(|e| e.event_id().clone()))
}

#[tokio::test]
async fn linear_room_builds_current_state() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let room = TestRoom::create(&server, room_id("!lobby:a.example"), alice.clone()).await?;
    let bob_join = room.join(&server, &bob).await?;

    let state = server
        .query_current_state(&QueryCurrentStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?;
    let tuples: Vec<_> = state
        .state_events
        .iter()
        .filter_map(|e| e.state_key_tuple())
        .collect();
    assert!(tuples.contains(&StateKeyTuple::room(event_type::CREATE)));
    assert!(tuples.contains(&StateKeyTuple::room(event_type::POWER_LEVELS)));
    assert!(tuples.contains(&StateKeyTuple::new(event_type::MEMBER, bob.as_str())));
    assert_eq!(state.state_events.len(), 6);

    let member = server
        .query_state_event(&QueryStateEventRequest {
            room_id: room.room_id.clone(),
            event_type: event_type::MEMBER.into(),
            state_key: bob.to_string(),
        })
        .await
        .into_result()?;
    assert_eq!(member.event.map(|e| e.event_id().clone()), Some(bob_join.clone()));

    let latest = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: vec![StateKeyTuple::room(event_type::JOIN_RULES)],
        })
        .await
        .into_result()?;
    assert!(latest.room_exists);
    assert_eq!(latest.room_version, Some(RoomVersion::V10));
    assert_eq!(latest.latest_event_ids, vec![bob_join]);
    assert_eq!(latest.depth, 6);
    assert_eq!(latest.state_events.len(), 1);
    Ok(())
}

#[tokio::test]
async fn state_before_and_after_an_event() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let topic = room
        .send(&server, &alice, event_type::TOPIC, Some(""), json!({"topic": "rust"}))
        .await?;

    let before = server
        .query_state_before_event(&QueryStateBeforeEventRequest {
            event_id: topic.clone(),
        })
        .await
        .into_result()?;
    let after = server
        .query_state_after_event(&QueryStateAfterEventRequest {
            event_id: topic.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?;
    assert!(!before.state_events.iter().any(|e| e.event_id() == &topic));
    assert!(after.state_events.iter().any(|e| e.event_id() == &topic));
    assert_eq!(after.state_events.len(), before.state_events.len() + 1);

    let unknown = server
        .query_state_after_event(&QueryStateAfterEventRequest {
            event_id: slroom_proto::EventId::parse("$nothing")?,
            tuples: Vec::new(),
        })
        .await;
    assert_eq!(unknown.error.map(|e| e.kind), Some(ErrorKind::BadRequest));
    Ok(())
}

#[tokio::test]
async fn non_member_message_is_rejected_and_kept_out_of_state() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let mallory = user("@mallory:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let before = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await;

    let (event, response) = room
        .try_send(&server, &mallory, event_type::NAME, Some(""), json!({"name": "pwned"}))
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::Unauthorized));

    let after = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await;
    assert_eq!(after.latest_event_ids, before.latest_event_ids);
    assert_eq!(after.state_events, before.state_events);

    // Rejected events are not served.
    let by_id = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: vec![event.event_id().clone()],
        })
        .await;
    assert!(by_id.events.is_empty());

    // Resubmitting gives the same answer.
    let again = server
        .input_event(&RequestContext::new(), InputKind::New, event)
        .await;
    assert_eq!(again.error.map(|e| e.kind), Some(ErrorKind::Unauthorized));
    Ok(())
}

#[tokio::test]
async fn duplicate_input_is_idempotent() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let event = room
        .build(&server, &alice, event_type::MESSAGE, None, json!({"body": "hi"}))
        .await;

    let first = server
        .input_event(&RequestContext::new(), InputKind::New, event.clone())
        .await
        .into_result()?;
    assert!(!first.outcomes[0].already_known);
    let log_len = server
        .query_output_log(&QueryOutputLogRequest {
            room_id: room.room_id.clone(),
            since: 0,
            limit: 1000,
        })
        .await
        .records
        .len();

    let second = server
        .input_event(&RequestContext::new(), InputKind::New, event)
        .await
        .into_result()?;
    assert!(second.outcomes[0].already_known);
    assert_eq!(second.outcomes[0].status, EventStatus::Accepted);

    let records = server
        .query_output_log(&QueryOutputLogRequest {
            room_id: room.room_id.clone(),
            since: 0,
            limit: 1000,
        })
        .await
        .records;
    assert_eq!(records.len(), log_len);
    Ok(())
}

#[tokio::test]
async fn output_log_is_ordered_per_room() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let first = room.message(&server, &alice, "one").await?;
    let second = room.message(&server, &alice, "two").await?;

    let records = server
        .query_output_log(&QueryOutputLogRequest {
            room_id: room.room_id.clone(),
            since: 0,
            limit: 1000,
        })
        .await
        .into_result()?
        .records;
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));

    let ids: Vec<_> = records
        .iter()
        .filter_map(|r| match &r.event {
            OutputEvent::NewRoomEvent { event, .. } => Some(event.event_id().clone()),
            _ => None,
        })
        .collect();
    let pos = |id| ids.iter().position(|x| x == id);
    assert!(pos(&first) < pos(&second));

    let since = records[records.len() - 2].seq;
    let tail = server
        .query_output_log(&QueryOutputLogRequest {
            room_id: room.room_id.clone(),
            since,
            limit: 10,
        })
        .await
        .records;
    assert_eq!(tail.len(), 1);
    Ok(())
}

#[tokio::test]
async fn membership_queries() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let carol = user("@carol:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;
    room.send(
        &server,
        &bob,
        event_type::MEMBER,
        Some(bob.as_str()),
        json!({"membership": "leave"}),
    )
    .await?;

    let members = server
        .query_members(&QueryMembersRequest {
            room_id: room.room_id.clone(),
            joined_only: true,
        })
        .await
        .into_result()?;
    assert_eq!(members.members.len(), 1);
    let everyone = server
        .query_members(&QueryMembersRequest {
            room_id: room.room_id.clone(),
            joined_only: false,
        })
        .await
        .into_result()?;
    assert_eq!(everyone.members.len(), 2);

    let bob_membership = server
        .query_membership_for_user(&QueryMembershipForUserRequest {
            room_id: room.room_id.clone(),
            user_id: bob.clone(),
        })
        .await
        .into_result()?;
    assert_eq!(bob_membership.membership, Some(Membership::Leave));
    assert!(!bob_membership.is_in_room);
    assert!(bob_membership.has_been_in_room);

    let carol_membership = server
        .query_membership_for_user(&QueryMembershipForUserRequest {
            room_id: room.room_id.clone(),
            user_id: carol,
        })
        .await
        .into_result()?;
    assert_eq!(carol_membership.membership, None);
    assert!(!carol_membership.has_been_in_room);

    let unknown = server
        .query_membership_for_user(&QueryMembershipForUserRequest {
            room_id: room_id("!missing:a.example"),
            user_id: bob.clone(),
        })
        .await;
    assert_eq!(unknown.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));

    let joined = server
        .query_rooms_for_user(&QueryRoomsForUserRequest {
            user_id: alice,
            membership: Some(Membership::Join),
        })
        .await
        .into_result()?;
    assert_eq!(joined.room_ids, vec![room.room_id.clone()]);
    let bob_joined = server
        .query_rooms_for_user(&QueryRoomsForUserRequest {
            user_id: bob,
            membership: Some(Membership::Join),
        })
        .await
        .into_result()?;
    assert!(bob_joined.room_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn events_and_auth_chain() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let message = room.message(&server, &alice, "hello").await?;

    let events = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: vec![message.clone()],
        })
        .await
        .into_result()?;
    assert_eq!(events.events.len(), 1);

    let chain = server
        .query_auth_chain(&QueryAuthChainRequest {
            event_ids: vec![message.clone()],
        })
        .await
        .into_result()?
        .auth_chain;
    assert!(!chain.iter().any(|e| e.event_id() == &message));
    assert_eq!(chain[0].event_type(), event_type::CREATE);
    assert!(chain.iter().any(|e| e.is_type(event_type::POWER_LEVELS)));

    let version = server
        .query_room_version(&QueryRoomVersionRequest {
            room_id: room.room_id.clone(),
        })
        .await
        .into_result()?;
    assert_eq!(version.room_version, Some(RoomVersion::V10));

    let missing = server
        .query_room_version(&QueryRoomVersionRequest {
            room_id: room_id("!nope:a.example"),
        })
        .await;
    assert_eq!(missing.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));
    Ok(())
}

#[tokio::test]
async fn missing_events_and_local_backfill_walk() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let m1 = room.message(&server, &alice, "1").await?;
    let m2 = room.message(&server, &alice, "2").await?;
    let m3 = room.message(&server, &alice, "3").await?;
    let m4 = room.message(&server, &alice, "4").await?;

    let missing = server
        .query_missing_events(&QueryMissingEventsRequest {
            room_id: room.room_id.clone(),
            earliest: vec![m1.clone()],
            latest: vec![m4.clone()],
            limit: 10,
        })
        .await
        .into_result()?;
    let ids: Vec<_> = missing.events.iter().map(|e| e.event_id().clone()).collect();
    assert_eq!(ids, vec![m2.clone(), m3.clone()]);

    let backfill = server
        .query_backfill(&QueryBackfillRequest {
            room_id: room.room_id.clone(),
            from: vec![m4.clone()],
            limit: 3,
        })
        .await
        .into_result()?;
    let ids: Vec<_> = backfill.events.iter().map(|e| e.event_id().clone()).collect();
    assert_eq!(ids, vec![m4, m3, m2]);
    Ok(())
}

#[tokio::test]
async fn server_acl_denies_events_from_banned_origin() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let eve = user("@eve:evil.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &eve).await?;
    room.send(
        &server,
        &alice,
        event_type::SERVER_ACL,
        Some(""),
        json!({"allow": ["*"], "deny": ["evil.example"], "allow_ip_literals": false}),
    )
    .await?;

    let allowed = server
        .query_server_allowed(&QueryServerAllowedRequest {
            room_id: room.room_id.clone(),
            server_name: server_name("evil.example"),
        })
        .await;
    assert!(!allowed.allowed);
    let good = server
        .query_server_allowed(&QueryServerAllowedRequest {
            room_id: room.room_id.clone(),
            server_name: server_name("b.example"),
        })
        .await;
    assert!(good.allowed);

    let before = latest_event_ids(&server, &room).await?;
    let event = room
        .build(&server, &eve, event_type::MESSAGE, None, json!({"body": "spam"}))
        .await;
    let response = server
        .input_room_events(
            &RequestContext::new(),
            InputRoomEventsRequest {
                room_id: room.room_id.clone(),
                events: vec![
                    InputRoomEvent::new(InputKind::New, event.clone())
                        .with_origin(server_name("evil.example")),
                ],
                asynchronous: false,
            },
        )
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::ForbiddenOrigin));

    let stored = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: vec![event.event_id().clone()],
        })
        .await;
    assert!(stored.events.is_empty());
    assert_eq!(latest_event_ids(&server, &room).await?, before);
    Ok(())
}

#[tokio::test]
async fn queries_for_unknown_rooms() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let room = room_id("!ghost:a.example");

    let latest = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?;
    assert!(!latest.room_exists);

    let joined = server
        .query_server_joined_to_room(&QueryServerJoinedToRoomRequest {
            room_id: room.clone(),
            server_name: server_name("a.example"),
        })
        .await
        .into_result()?;
    assert!(!joined.room_exists);

    let state = server
        .query_current_state(&QueryCurrentStateRequest {
            room_id: room,
            tuples: Vec::new(),
        })
        .await;
    assert_eq!(state.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));
    Ok(())
}

#[tokio::test]
async fn join_dropped_by_resolution_leaves_membership_index() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;

    // Both forks grow from the same extremity: bob joins while alice closes
    // the room to invites only.
    let join = room
        .build(&server, &bob, event_type::MEMBER, Some(bob.as_str()), json!({"membership": "join"}))
        .await;
    let closed = room
        .build(&server, &alice, event_type::JOIN_RULES, Some(""), json!({"join_rule": "invite"}))
        .await;
    for event in [join.clone(), closed.clone()] {
        server
            .input_event(&RequestContext::new(), InputKind::New, event)
            .await
            .into_result()?;
    }

    assert_eq!(
        current_event_id(&server, &room, event_type::JOIN_RULES, "").await?,
        Some(closed.event_id().clone())
    );
    assert_eq!(current_event_id(&server, &room, event_type::MEMBER, bob.as_str()).await?, None);

    let member = server
        .query_membership_for_user(&QueryMembershipForUserRequest {
            room_id: room.room_id.clone(),
            user_id: bob.clone(),
        })
        .await
        .into_result()?;
    assert_eq!(member.membership, Some(Membership::Leave));
    assert!(!member.is_in_room);
    assert!(member.has_been_in_room);

    let joined = server
        .query_rooms_for_user(&QueryRoomsForUserRequest {
            user_id: bob.clone(),
            membership: Some(Membership::Join),
        })
        .await
        .into_result()?;
    assert!(joined.room_ids.is_empty());

    server
        .perform_forget(&PerformForgetRequest {
            room_id: room.room_id.clone(),
            user_id: bob,
        })
        .await
        .into_result()?;
    Ok(())
}

#[tokio::test]
async fn power_level_fork_keeps_higher_authority() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let carol = user("@carol:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;
    room.join(&server, &carol).await?;
    room.send(
        &server,
        &alice,
        event_type::POWER_LEVELS,
        Some(""),
        json!({"users": {alice.as_str(): 100, bob.as_str(): 50, carol.as_str(): 60}, "users_default": 0}),
    )
    .await?;

    let raise = room
        .build(
            &server,
            &alice,
            event_type::POWER_LEVELS,
            Some(""),
            json!({"users": {alice.as_str(): 100, bob.as_str(): 100, carol.as_str(): 60}, "users_default": 0}),
        )
        .await;
    let lower = room
        .build(
            &server,
            &carol,
            event_type::POWER_LEVELS,
            Some(""),
            json!({"users": {alice.as_str(): 100, bob.as_str(): 10, carol.as_str(): 60}, "users_default": 0}),
        )
        .await;
    // Carol's change arrives last and is still outranked.
    for event in [raise.clone(), lower.clone()] {
        server
            .input_event(&RequestContext::new(), InputKind::New, event)
            .await
            .into_result()?;
    }

    assert_eq!(
        current_event_id(&server, &room, event_type::POWER_LEVELS, "").await?,
        Some(raise.event_id().clone())
    );
    let mut latest = latest_event_ids(&server, &room).await?;
    latest.sort();
    let mut forks = vec![raise.event_id().clone(), lower.event_id().clone()];
    forks.sort();
    assert_eq!(latest, forks);

    // The losing change is kept, with the state it was accepted against.
    let stored = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: vec![lower.event_id().clone()],
        })
        .await
        .into_result()?;
    assert_eq!(stored.events.len(), 1);
    let after_lower = server
        .query_state_after_event(&QueryStateAfterEventRequest {
            event_id: lower.event_id().clone(),
            tuples: vec![StateKeyTuple::room(event_type::POWER_LEVELS)],
        })
        .await
        .into_result()?;
    assert_eq!(
        after_lower.state_events.first().map(|e| e.event_id().clone()),
        Some(lower.event_id().clone())
    );
    Ok(())
}

/// A message from `sender` citing the room's real auth events, with the
/// given prev events.
async fn message_with_prevs(
    server: &Roomserver,
    room: &TestRoom,
    sender: &UserId,
    prev_events: Vec<EventId>,
    extra_auth: Option<EventId>,
) -> slroom_proto::Event {
    let template = room
        .build(server, sender, event_type::MESSAGE, None, json!({"body": "template"}))
        .await;
    let mut auth_events = template.auth_events().to_vec();
    auth_events.extend(extra_auth);
    EventBuilder::new(room.room_id.clone(), sender.clone(), event_type::MESSAGE, json!({"body": "hi"}))
        .origin_server_ts(tick())
        .prev_events(prev_events)
        .auth_events(auth_events)
        .depth(template.depth())
        .build()
}

#[tokio::test]
async fn unknown_prev_event_reports_missing_prev_state() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:b.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;
    let before = latest_event_ids(&server, &room).await?;

    let unknown = EventId::parse("$never-seen")?;
    let event = message_with_prevs(&server, &room, &bob, vec![unknown], None).await;
    let response = server
        .input_room_events(
            &RequestContext::new(),
            InputRoomEventsRequest {
                room_id: room.room_id.clone(),
                events: vec![
                    InputRoomEvent::new(InputKind::New, event.clone())
                        .with_origin(server_name("b.example")),
                ],
                asynchronous: false,
            },
        )
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::MissingPrevState));
    assert_eq!(latest_event_ids(&server, &room).await?, before);
    Ok(())
}

#[tokio::test]
async fn unknown_auth_event_reports_missing_auth_event() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:b.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;
    let before = latest_event_ids(&server, &room).await?;

    let unknown = EventId::parse("$never-seen")?;
    let event = message_with_prevs(&server, &room, &bob, before.clone(), Some(unknown)).await;
    let response = server
        .input_room_events(
            &RequestContext::new(),
            InputRoomEventsRequest {
                room_id: room.room_id.clone(),
                events: vec![
                    InputRoomEvent::new(InputKind::New, event.clone())
                        .with_origin(server_name("b.example")),
                ],
                asynchronous: false,
            },
        )
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::MissingAuthEvent));

    let stored = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: vec![event.event_id().clone()],
        })
        .await;
    assert!(stored.events.is_empty());
    assert_eq!(latest_event_ids(&server, &room).await?, before);
    Ok(())
}

#[tokio::test]
async fn outlier_has_no_state_to_query() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;

    let event = room
        .build(&server, &alice, event_type::MESSAGE, None, json!({"body": "outlier"}))
        .await;
    server
        .input_event(&RequestContext::new(), InputKind::Outlier, event.clone())
        .await
        .into_result()?;

    let after = server
        .query_state_after_event(&QueryStateAfterEventRequest {
            event_id: event.event_id().clone(),
            tuples: Vec::new(),
        })
        .await;
    assert_eq!(after.error.map(|e| e.kind), Some(ErrorKind::StateUnavailable));
    let before = server
        .query_state_before_event(&QueryStateBeforeEventRequest {
            event_id: event.event_id().clone(),
        })
        .await;
    assert_eq!(before.error.map(|e| e.kind), Some(ErrorKind::StateUnavailable));
    Ok(())
}
