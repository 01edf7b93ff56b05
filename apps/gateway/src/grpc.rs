//! gRPC stream surface, semantically identical to the WebSocket contract:
//! one bi-directional stream per subscription session, bearer token in the
//! `authorization` metadata header, frames as JSON text.

use std::pin::Pin;

use botgate_hub::Client;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::AppState;

pub mod pb {
    tonic::include_proto!("botgate.v1");
}

use pb::event_stream_server::{EventStream, EventStreamServer};

pub struct EventStreamService {
    state: AppState,
}

pub fn server(state: AppState) -> EventStreamServer<EventStreamService> {
    EventStreamServer::new(EventStreamService { state })
}

#[tonic::async_trait]
impl EventStream for EventStreamService {
    type SubscribeStream = Pin<Box<dyn Stream<Item = Result<pb::ServerFrame, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<Streaming<pb::ControlFrame>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let token = request
            .metadata()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
            })
            .map(str::trim)
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;
        let principal = self
            .state
            .authenticator
            .resolve_bearer(token)
            .map_err(|err| Status::unauthenticated(err.to_string()))?;

        let (client, queue) = Client::new(principal);
        self.state.hub.register(client.clone()).await;
        tracing::debug!(client_id = %client.id(), "grpc stream connected");

        let hub = std::sync::Arc::clone(&self.state.hub);
        let mut inbound = request.into_inner();
        let reader_client = client.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        let control = serde_json::json!({
                            "action": frame.action,
                            "chat_id": frame.chat_id,
                        });
                        hub.handle_control(&reader_client, &control.to_string()).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(
                            client_id = %reader_client.id(),
                            error = %err,
                            "grpc stream read error"
                        );
                        break;
                    }
                }
            }
            hub.unregister(reader_client.id()).await;
        });

        let outbound = ReceiverStream::new(queue)
            .map(|frame| Ok(pb::ServerFrame { json: frame.to_text() }));
        Ok(Response::new(Box::pin(outbound)))
    }
}
