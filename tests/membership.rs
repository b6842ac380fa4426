//! Integration test: membership performers on a single server
//!
//! Invite, join, leave, forget, publish and local peeks, plus the failure
//! kinds each one reports.

mod common;

use common::servers::test_config;
use common::{TestRoom, room_id, single_server, user};
use slroom_proto::{Membership, event_type};
use slroomd::api::*;
use slroomd::context::RequestContext;
use slroomd::output::OutputEvent;
use slroomd::storage::memory::MemoryDatabase;
use slroomd::{ErrorKind, Roomserver};
use std::sync::Arc;
use std::time::Duration;

fn ctx() -> RequestContext {
    RequestContext::new()
}

async fn membership(server: &Roomserver, room: &TestRoom, user_id: &slroom_proto::UserId) -> QueryMembershipForUserResponse {
    server
        .query_membership_for_user(&QueryMembershipForUserRequest {
            room_id: room.room_id.clone(),
            user_id: user_id.clone(),
        })
        .await
}

#[tokio::test]
async fn performers_need_federation_attached() -> anyhow::Result<()> {
    let server = Roomserver::new(test_config("a.example"), Arc::new(MemoryDatabase::new()))?;
    let response = server
        .perform_join(
            &ctx(),
            &PerformJoinRequest {
                room_id: room_id("!r:a.example"),
                user_id: user("@alice:a.example"),
                server_names: Vec::new(),
                displayname: None,
                reason: None,
            },
        )
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::NotAttached));
    Ok(())
}

#[tokio::test]
async fn invite_then_join() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    let mut outputs = server.outputs();

    let invite = server
        .perform_invite(
            &ctx(),
            &PerformInviteRequest {
                room_id: room.room_id.clone(),
                sender: alice.clone(),
                invitee: bob.clone(),
                reason: Some("come along".into()),
                transaction_id: Some("txn1".into()),
            },
        )
        .await
        .into_result()?;
    let invite_id = invite.event_id.clone().unwrap();
    assert_eq!(membership(&server, &room, &bob).await.membership, Some(Membership::Invite));

    let mut saw_invite = false;
    while let Ok(Ok(record)) = tokio::time::timeout(Duration::from_millis(200), outputs.recv()).await {
        match &record.event {
            OutputEvent::NewInviteEvent { event, .. } if event.event_id() == &invite_id => {
                saw_invite = true;
                break;
            }
            OutputEvent::NewRoomEvent { event, transaction_id, .. } if event.event_id() == &invite_id => {
                assert_eq!(transaction_id.as_deref(), Some("txn1"));
            }
            _ => {}
        }
    }
    assert!(saw_invite);

    let join = server
        .perform_join(
            &ctx(),
            &PerformJoinRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
                server_names: Vec::new(),
                displayname: Some("Bob".into()),
                reason: None,
            },
        )
        .await
        .into_result()?;
    let join_id = join.event_id.unwrap();
    let current = membership(&server, &room, &bob).await;
    assert_eq!(current.membership, Some(Membership::Join));
    assert_eq!(current.event_id, Some(join_id.clone()));

    // Joining again is a no-op that returns the existing join.
    let again = server
        .perform_join(
            &ctx(),
            &PerformJoinRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
                server_names: Vec::new(),
                displayname: None,
                reason: None,
            },
        )
        .await
        .into_result()?;
    assert_eq!(again.event_id, Some(join_id));
    Ok(())
}

#[tokio::test]
async fn invite_failures() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;

    let invite = |room_id, sender: &slroom_proto::UserId, invitee: &slroom_proto::UserId| PerformInviteRequest {
        room_id,
        sender: sender.clone(),
        invitee: invitee.clone(),
        reason: None,
        transaction_id: None,
    };

    let joined = server
        .perform_invite(&ctx(), &invite(room.room_id.clone(), &alice, &bob))
        .await;
    assert_eq!(joined.error.map(|e| e.kind), Some(ErrorKind::Unauthorized));

    let unknown = server
        .perform_invite(&ctx(), &invite(room_id("!ghost:a.example"), &alice, &bob))
        .await;
    assert_eq!(unknown.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));

    let remote_sender = server
        .perform_invite(
            &ctx(),
            &invite(room.room_id.clone(), &user("@zed:b.example"), &user("@carol:a.example")),
        )
        .await;
    assert_eq!(remote_sender.error.map(|e| e.kind), Some(ErrorKind::BadRequest));
    Ok(())
}

#[tokio::test]
async fn leave_and_forget() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let bob = user("@bob:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice.clone()).await?;
    room.join(&server, &bob).await?;

    let forget = PerformForgetRequest {
        room_id: room.room_id.clone(),
        user_id: bob.clone(),
    };
    let still_joined = server.perform_forget(&forget).await;
    assert_eq!(still_joined.error.map(|e| e.kind), Some(ErrorKind::StillJoined));

    let leave = server
        .perform_leave(
            &ctx(),
            &PerformLeaveRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
                reason: Some("bye".into()),
            },
        )
        .await
        .into_result()?;
    assert!(leave.event_id.is_some());
    let after_leave = membership(&server, &room, &bob).await;
    assert_eq!(after_leave.membership, Some(Membership::Leave));
    assert!(after_leave.has_been_in_room);

    let left_again = server
        .perform_leave(
            &ctx(),
            &PerformLeaveRequest {
                room_id: room.room_id.clone(),
                user_id: bob.clone(),
                reason: None,
            },
        )
        .await;
    assert_eq!(left_again.error.map(|e| e.kind), Some(ErrorKind::NotInRoom));

    server.perform_forget(&forget).await.into_result()?;
    let forgotten = membership(&server, &room, &bob).await;
    assert_eq!(forgotten.membership, None);
    assert!(!forgotten.has_been_in_room);

    // Room state is untouched by forgetting.
    let member = server
        .query_state_event(&QueryStateEventRequest {
            room_id: room.room_id.clone(),
            event_type: event_type::MEMBER.into(),
            state_key: bob.to_string(),
        })
        .await;
    assert_eq!(member.event.map(|e| e.event_id().clone()), leave.event_id);

    let unknown = server
        .perform_forget(&PerformForgetRequest {
            room_id: room_id("!ghost:a.example"),
            user_id: bob,
        })
        .await;
    assert_eq!(unknown.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));
    Ok(())
}

#[tokio::test]
async fn join_fails_without_resident_server() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let response = server
        .perform_join(
            &ctx(),
            &PerformJoinRequest {
                room_id: room_id("!far:b.example"),
                user_id: user("@alice:a.example"),
                server_names: Vec::new(),
                displayname: None,
                reason: None,
            },
        )
        .await;
    assert_eq!(
        response.error.map(|e| e.kind),
        Some(ErrorKind::RemoteNegotiationFailed)
    );
    Ok(())
}

#[tokio::test]
async fn publish_and_list() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice).await?;

    let publish = |visibility| PerformPublishRequest {
        room_id: room.room_id.clone(),
        visibility,
    };
    server
        .perform_publish(&publish(Visibility::Public))
        .await
        .into_result()?;
    let listed = server.query_published_rooms().await.into_result()?;
    assert_eq!(listed.room_ids, vec![room.room_id.clone()]);

    server
        .perform_publish(&publish(Visibility::Private))
        .await
        .into_result()?;
    assert!(server.query_published_rooms().await.room_ids.is_empty());

    let unknown = server
        .perform_publish(&PerformPublishRequest {
            room_id: room_id("!ghost:a.example"),
            visibility: Visibility::Public,
        })
        .await;
    assert_eq!(unknown.error.map(|e| e.kind), Some(ErrorKind::UnknownRoom));
    Ok(())
}

#[tokio::test]
async fn local_peek_and_unpeek() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let dave = user("@dave:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice).await?;

    let peek = |device: &str| PerformPeekRequest {
        room_id: room.room_id.clone(),
        user_id: dave.clone(),
        device_id: device.to_string(),
        server_names: Vec::new(),
    };

    let hidden = server.perform_peek(&ctx(), &peek("PHONE")).await;
    assert_eq!(hidden.error.map(|e| e.kind), Some(ErrorKind::Unauthorized));

    room.set_world_readable(&server).await?;
    let no_device = server.perform_peek(&ctx(), &peek("")).await;
    assert_eq!(no_device.error.map(|e| e.kind), Some(ErrorKind::BadRequest));

    let peeked = server.perform_peek(&ctx(), &peek("PHONE")).await.into_result()?;
    assert_eq!(peeked.room_id, Some(room.room_id.clone()));
    assert_eq!(peeked.peeked_via, None);

    let unpeek = PerformUnpeekRequest {
        room_id: room.room_id.clone(),
        user_id: dave.clone(),
        device_id: "PHONE".into(),
    };
    server.perform_unpeek(&unpeek).await.into_result()?;
    let twice = server.perform_unpeek(&unpeek).await;
    assert_eq!(twice.error.map(|e| e.kind), Some(ErrorKind::BadRequest));

    let kinds: Vec<&'static str> = server
        .query_output_log(&QueryOutputLogRequest {
            room_id: room.room_id.clone(),
            since: 0,
            limit: 1000,
        })
        .await
        .records
        .iter()
        .map(|r| r.event.kind())
        .collect();
    let new_peek = kinds.iter().position(|k| *k == "new_peek");
    let retire_peek = kinds.iter().position(|k| *k == "retire_peek");
    assert!(new_peek.is_some());
    assert!(new_peek < retire_peek);
    Ok(())
}

#[tokio::test]
async fn inbound_peek_on_unknown_room() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let response = server
        .perform_inbound_peek(&PerformInboundPeekRequest {
            room_id: room_id("!ghost:a.example"),
            server_name: common::server_name("b.example"),
            peek_id: "p1".into(),
        })
        .await
        .into_result()?;
    assert!(!response.room_exists);
    assert!(response.latest_event.is_none());
    Ok(())
}

#[tokio::test]
async fn cancelled_context_aborts_join() -> anyhow::Result<()> {
    let server = single_server("a.example").await?;
    let alice = user("@alice:a.example");
    let room = TestRoom::create(&server, room_id("!r:a.example"), alice).await?;
    let ctx = RequestContext::new();
    ctx.cancel();

    let response = server
        .perform_join(
            &ctx,
            &PerformJoinRequest {
                room_id: room.room_id.clone(),
                user_id: user("@bob:a.example"),
                server_names: Vec::new(),
                displayname: None,
                reason: None,
            },
        )
        .await;
    assert_eq!(response.error.map(|e| e.kind), Some(ErrorKind::Cancelled));
    Ok(())
}
