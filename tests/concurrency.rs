//! Integration test: concurrent input
//!
//! Many writers racing on one room, several rooms at once, forgetting a
//! room while rejoining it, and the queued (asynchronous) input path.

mod common;

use common::{TestRoom, room_id, single_server, user};
use serde_json::json;
use slroom_proto::{Membership, event_type};
use slroomd::ErrorKind;
use slroomd::api::*;
use slroomd::context::RequestContext;
use slroomd::input::{InputKind, InputRoomEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_in_one_room() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let server = Arc::clone(&server);
        let room = room.clone();
        let alice = alice.clone();
        tasks.push(tokio::spawn(async move {
            room.message(&server, &alice, &format!("message {i}")).await
        }));
    }
    let mut sent = BTreeSet::new();
    for task in tasks {
        sent.insert(task.await??);
    }
    assert_eq!(sent.len(), 16);

    // Every extremity is one of the racing messages; none were dropped.
    let latest = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?;
    assert!(!latest.latest_event_ids.is_empty());
    assert!(latest.latest_event_ids.iter().all(|id| sent.contains(id)));

    let stored = server
        .query_events_by_id(&QueryEventsByIdRequest {
            event_ids: sent.iter().cloned().collect(),
        })
        .await
        .into_result()?;
    assert_eq!(stored.events.len(), 16);

    // A following event merges the forks.
    let merge = room.message(&server, &alice, "merge").await?;
    let after = server
        .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
            room_id: room.room_id.clone(),
            tuples: Vec::new(),
        })
        .await
        .into_result()?;
    assert_eq!(after.latest_event_ids, vec![merge]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rooms_progress_independently() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");

    let mut tasks = Vec::new();
    for i in 0..6 {
        let server = Arc::clone(&server);
        let alice = alice.clone();
        tasks.push(tokio::spawn(async move {
            let room = TestRoom::create(&server, room_id(&format!("!r{i}:a.example")), alice.clone()).await?;
            for n in 0..5 {
                room.message(&server, &alice, &format!("{n}")).await?;
            }
            anyhow::Ok(room)
        }));
    }
    for task in tasks {
        let room = task.await??;
        let latest = server
            .query_latest_events_and_state(&QueryLatestEventsAndStateRequest {
                room_id: room.room_id.clone(),
                tuples: Vec::new(),
            })
            .await
            .into_result()?;
        assert_eq!(latest.latest_event_ids.len(), 1);
        assert_eq!(latest.depth, 10);
    }

    let rooms = server
        .query_rooms_for_user(&QueryRoomsForUserRequest {
            user_id: alice,
            membership: None,
        })
        .await
        .into_result()?;
    assert_eq!(rooms.room_ids.len(), 6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forget_racing_a_rejoin_keeps_the_join() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");

    for i in 0..8 {
        let room = TestRoom::create(&server, room_id(&format!("!r{i}:a.example")), alice.clone()).await?;
        room.join(&server, &bob).await?;
        room.send(
            &server,
            &bob,
            event_type::MEMBER,
            Some(bob.as_str()),
            json!({"membership": "leave"}),
        )
        .await?;

        let rejoin = {
            let (server, room, bob) = (Arc::clone(&server), room.clone(), bob.clone());
            tokio::spawn(async move { room.join(&server, &bob).await })
        };
        let forget = {
            let server = Arc::clone(&server);
            let request = PerformForgetRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
            };
            tokio::spawn(async move { server.perform_forget(&request).await })
        };
        let join_id = rejoin.await??;
        if let Some(err) = forget.await?.error {
            assert_eq!(err.kind, ErrorKind::StillJoined);
        }

        // Whichever ran first, the join is what the index ends up with.
        let member = server
            .query_membership_for_user(&QueryMembershipForUserRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
            })
            .await
            .into_result()?;
        assert_eq!(member.membership, Some(Membership::Join));
        assert_eq!(member.event_id, Some(join_id));
    }
    Ok(())
}

#[tokio::test]
async fn queued_input_is_processed() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;

    let event = room
        .build(&server, &alice, event_type::TOPIC, Some(""), json!({"topic": "later"}))
        .await;
    let response = server
        .input_room_events(
            &RequestContext::new(),
            InputRoomEventsRequest {
                room_id: room.room_id.clone(),
                events: vec![InputRoomEvent::new(InputKind::New, event.clone())],
                asynchronous: true,
            },
        )
        .await
        .into_result()?;
    assert!(response.outcomes.is_empty());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let topic = server
            .query_state_event(&QueryStateEventRequest {
                room_id: room.room_id.clone(),
                event_type: event_type::TOPIC.into(),
                state_key: String::new(),
            })
            .await;
        if topic.event.as_ref().map(|e| e.event_id()) == Some(event.event_id()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queued event never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
