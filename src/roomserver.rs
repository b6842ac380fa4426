//! The roomserver façade.
//!
//! [`Roomserver`] owns one server's storage, ACL cache, query engine and
//! input pipeline. Performers need the federation collaborator, which is
//! attached in a second step so servers on a loopback network can be built
//! before any of them is reachable:
//!
//! ```ignore
//! let server = Arc::new(Roomserver::new(config, db)?);
//! network.register(&server);
//! server.attach_federation(network.client(server.server_name().clone())).await?;
//! ```

use crate::api::*;
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::RoomserverError;
use crate::federation::FederationApi;
use crate::input::{InputKind, Inputer};
use crate::output::{OutputRecord, OutputStream};
use crate::perform::{Performed, Performers};
use crate::query::Queryer;
use crate::reporting::{ErrorReporter, TracingReporter};
use crate::security::ServerAcls;
use crate::storage::Database;
use crate::telemetry::{OperationTimer, spans};
use slroom_proto::{RoomId, ServerName};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{Instrument, info};

/// Live output records buffered per subscriber.
const OUTPUT_BUFFER: usize = 1024;

pub struct Roomserver {
    pub(crate) config: Config,
    pub(crate) local: ServerName,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) acls: Arc<ServerAcls>,
    pub(crate) queryer: Arc<Queryer>,
    pub(crate) inputer: Arc<Inputer>,
    output: OutputStream,
    performers: OnceLock<Arc<Performers>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Roomserver {
    pub fn new(config: Config, db: Arc<dyn Database>) -> Result<Self, RoomserverError> {
        let local = config
            .server_name()
            .map_err(|e| RoomserverError::BadRequest(format!("server.name: {e}")))?;
        let acls = Arc::new(ServerAcls::new(Arc::clone(&db), local.clone()));
        let queryer = Arc::new(Queryer::new(
            Arc::clone(&db),
            Arc::clone(&acls),
            config.backfill.max_limit,
        ));
        let output = OutputStream::new(OUTPUT_BUFFER);
        let inputer = Arc::new(Inputer::new(
            local.clone(),
            Arc::clone(&db),
            Arc::clone(&acls),
            output.clone(),
            config.input.clone(),
        ));
        Ok(Self {
            config,
            local,
            db,
            acls,
            queryer,
            inputer,
            output,
            performers: OnceLock::new(),
            reporter: Arc::new(TracingReporter),
        })
    }

    /// Replace the default [`TracingReporter`].
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn server_name(&self) -> &ServerName {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribe to committed output records.
    pub fn outputs(&self) -> broadcast::Receiver<Arc<OutputRecord>> {
        self.output.subscribe()
    }

    /// Number of rooms with a running input actor.
    pub fn active_rooms(&self) -> usize {
        self.inputer.active_rooms()
    }

    /// Second construction phase: wire in federation, build the performers
    /// and start the input pipeline. An error means this server cannot run.
    pub async fn attach_federation(
        &self,
        federation: Arc<dyn FederationApi>,
    ) -> Result<(), RoomserverError> {
        self.inputer.set_federation(Arc::clone(&federation));
        let performers = Arc::new(Performers::new(
            self.local.clone(),
            Arc::clone(&self.db),
            Arc::clone(&self.acls),
            Arc::clone(&self.queryer),
            Arc::clone(&self.inputer),
            federation,
            self.config.perspective_servers(),
            self.config.backfill.clone(),
        ));
        self.performers
            .set(performers)
            .map_err(|_| RoomserverError::Internal("federation already attached".into()))?;
        self.inputer.start().await?;
        info!(server = %self.local, "Roomserver ready");
        Ok(())
    }

    pub(crate) fn performers(&self) -> Result<Arc<Performers>, RoomserverError> {
        self.performers
            .get()
            .cloned()
            .ok_or(RoomserverError::NotAttached)
    }

    /// Run a performer: time it, write its outputs, and report a failure.
    pub(crate) async fn perform<R, F, Fut>(
        &self,
        operation: &'static str,
        room_id: &RoomId,
        f: F,
    ) -> Result<R, RoomserverError>
    where
        F: FnOnce(Arc<Performers>) -> Fut,
        Fut: Future<Output = Result<Performed<R>, RoomserverError>>,
    {
        let _timer = OperationTimer::new(operation);
        let result = async {
            let performed = f(self.performers()?).await?;
            self.inputer
                .write_output_events(room_id, performed.outputs)
                .await?;
            Ok(performed.response)
        }
        .instrument(spans::perform(operation, room_id))
        .await;
        if let Err(err) = &result {
            self.reporter.capture(operation, err);
        }
        result
    }

    // ========================================================================
    // Input
    // ========================================================================

    pub async fn input_room_events(
        &self,
        ctx: &RequestContext,
        req: InputRoomEventsRequest,
    ) -> InputRoomEventsResponse {
        if req.asynchronous {
            if self.performers.get().is_none() {
                return InputRoomEventsResponse::failed(&RoomserverError::NotAttached);
            }
            return match self.inputer.queue_input_events(&req.room_id, req.events).await {
                Ok(()) => InputRoomEventsResponse::default(),
                Err(err) => InputRoomEventsResponse::failed(&err),
            };
        }

        let batch = self
            .inputer
            .process_input_events(ctx, &req.room_id, req.events)
            .await;
        let mut response = InputRoomEventsResponse {
            outcomes: batch.outcomes,
            ..Default::default()
        };
        if let Some(err) = batch.error {
            response.set_error((&err).into());
        }
        response
    }

    /// Submit a single event built or received by the caller.
    pub async fn input_event(
        &self,
        ctx: &RequestContext,
        kind: InputKind,
        event: slroom_proto::Event,
    ) -> InputRoomEventsResponse {
        let room_id = event.room_id().clone();
        self.input_room_events(
            ctx,
            InputRoomEventsRequest {
                room_id,
                events: vec![crate::input::InputRoomEvent::new(kind, event)],
                asynchronous: false,
            },
        )
        .await
    }

    // ========================================================================
    // Performers
    // ========================================================================

    pub async fn perform_invite(
        &self,
        ctx: &RequestContext,
        req: &PerformInviteRequest,
    ) -> PerformInviteResponse {
        self.perform("invite", &req.room_id, |p| async move {
            p.perform_invite(ctx, req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformInviteResponse::failed(&err))
    }

    pub async fn perform_join(
        &self,
        ctx: &RequestContext,
        req: &PerformJoinRequest,
    ) -> PerformJoinResponse {
        self.perform("join", &req.room_id, |p| async move {
            p.perform_join(ctx, req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformJoinResponse::failed(&err))
    }

    pub async fn perform_leave(
        &self,
        ctx: &RequestContext,
        req: &PerformLeaveRequest,
    ) -> PerformLeaveResponse {
        self.perform("leave", &req.room_id, |p| async move {
            p.perform_leave(ctx, req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformLeaveResponse::failed(&err))
    }

    pub async fn perform_forget(&self, req: &PerformForgetRequest) -> PerformForgetResponse {
        self.perform("forget", &req.room_id, |p| async move {
            p.perform_forget(req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformForgetResponse::failed(&err))
    }

    pub async fn perform_peek(
        &self,
        ctx: &RequestContext,
        req: &PerformPeekRequest,
    ) -> PerformPeekResponse {
        self.perform("peek", &req.room_id, |p| async move {
            p.perform_peek(ctx, req).await
        })
        .await
        .unwrap_or_else(|err| PerformPeekResponse::failed(&err))
    }

    pub async fn perform_unpeek(&self, req: &PerformUnpeekRequest) -> PerformUnpeekResponse {
        self.perform("unpeek", &req.room_id, |p| async move {
            p.perform_unpeek(req).await
        })
        .await
        .unwrap_or_else(|err| PerformUnpeekResponse::failed(&err))
    }

    pub async fn perform_inbound_peek(
        &self,
        req: &PerformInboundPeekRequest,
    ) -> PerformInboundPeekResponse {
        self.perform("inbound_peek", &req.room_id, |p| async move {
            p.perform_inbound_peek(req).await
        })
        .await
        .unwrap_or_else(|err| PerformInboundPeekResponse::failed(&err))
    }

    pub async fn perform_publish(&self, req: &PerformPublishRequest) -> PerformPublishResponse {
        self.perform("publish", &req.room_id, |p| async move {
            p.perform_publish(req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformPublishResponse::failed(&err))
    }

    pub async fn perform_backfill(
        &self,
        ctx: &RequestContext,
        req: &PerformBackfillRequest,
    ) -> PerformBackfillResponse {
        self.perform("backfill", &req.room_id, |p| async move {
            p.perform_backfill(ctx, req).await.map(Performed::new)
        })
        .await
        .unwrap_or_else(|err| PerformBackfillResponse::failed(&err))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn query_current_state(
        &self,
        req: &QueryCurrentStateRequest,
    ) -> QueryCurrentStateResponse {
        answer(self.queryer.query_current_state(req).await)
    }

    pub async fn query_state_event(&self, req: &QueryStateEventRequest) -> QueryStateEventResponse {
        answer(self.queryer.query_state_event(req).await)
    }

    pub async fn query_state_after_event(
        &self,
        req: &QueryStateAfterEventRequest,
    ) -> QueryStateAtEventResponse {
        answer(self.queryer.query_state_after_event(req).await)
    }

    pub async fn query_state_before_event(
        &self,
        req: &QueryStateBeforeEventRequest,
    ) -> QueryStateAtEventResponse {
        answer(self.queryer.query_state_before_event(req).await)
    }

    pub async fn query_latest_events_and_state(
        &self,
        req: &QueryLatestEventsAndStateRequest,
    ) -> QueryLatestEventsAndStateResponse {
        answer(self.queryer.query_latest_events_and_state(req).await)
    }

    pub async fn query_members(&self, req: &QueryMembersRequest) -> QueryMembersResponse {
        answer(self.queryer.query_members(req).await)
    }

    pub async fn query_membership_for_user(
        &self,
        req: &QueryMembershipForUserRequest,
    ) -> QueryMembershipForUserResponse {
        answer(self.queryer.query_membership_for_user(req).await)
    }

    pub async fn query_rooms_for_user(
        &self,
        req: &QueryRoomsForUserRequest,
    ) -> QueryRoomsForUserResponse {
        answer(self.queryer.query_rooms_for_user(req).await)
    }

    pub async fn query_room_version(&self, req: &QueryRoomVersionRequest) -> QueryRoomVersionResponse {
        answer(self.queryer.query_room_version(req).await)
    }

    pub async fn query_events_by_id(&self, req: &QueryEventsByIdRequest) -> QueryEventsByIdResponse {
        answer(self.queryer.query_events_by_id(req).await)
    }

    pub async fn query_auth_chain(&self, req: &QueryAuthChainRequest) -> QueryAuthChainResponse {
        answer(self.queryer.query_auth_chain(req).await)
    }

    pub async fn query_server_allowed(
        &self,
        req: &QueryServerAllowedRequest,
    ) -> QueryServerAllowedResponse {
        answer(self.queryer.query_server_allowed(req).await)
    }

    pub async fn query_server_joined_to_room(
        &self,
        req: &QueryServerJoinedToRoomRequest,
    ) -> QueryServerJoinedToRoomResponse {
        answer(self.queryer.query_server_joined_to_room(req).await)
    }

    pub async fn query_published_rooms(&self) -> QueryPublishedRoomsResponse {
        answer(self.queryer.query_published_rooms().await)
    }

    pub async fn query_missing_events(&self, req: &QueryMissingEventsRequest) -> QueryEventsResponse {
        answer(self.queryer.query_missing_events(req).await)
    }

    pub async fn query_backfill(&self, req: &QueryBackfillRequest) -> QueryEventsResponse {
        answer(self.queryer.query_backfill(req).await)
    }

    pub async fn query_output_log(&self, req: &QueryOutputLogRequest) -> QueryOutputLogResponse {
        answer(self.queryer.query_output_log(req).await)
    }
}

fn answer<R: ApiResponse>(result: Result<R, RoomserverError>) -> R {
    result.unwrap_or_else(|err| R::failed(&err))
}
