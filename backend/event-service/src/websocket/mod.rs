/// WebSocket surface.
///
/// One actor per connection. Clients authenticate with a bearer token inside
/// 15 seconds, then exchange tagged JSON messages. Async work is spawned off
/// the actor; replies travel back through the session's channel, which is
/// also what the presence registry holds for room pushes.
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::cache::{self, BroadcastRecord};
use crate::error::{AppError, AppResult};
use crate::middleware;
use crate::models::Event;
use crate::presence::{self, ConnId};
use crate::services::opentok::ParticipantRole;
use crate::state::AppState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    JoinRoom {
        room: String,
    },
    JoinInteractive {
        admin_id: Uuid,
        fan_url: String,
    },
    ProducerJoinRoom {
        admin_id: Uuid,
        fan_url: String,
    },
    JoinBroadcast {
        room: String,
    },
    EventGoLive {
        session_id: String,
    },
    EventEnded {
        admin_id: Uuid,
        fan_url: String,
        session_id: String,
        broadcast_enabled: bool,
    },
    RequestBroadcastUrl {
        session_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerConnected,
    AbleToJoin {
        able_to_join: bool,
        event: Option<Event>,
        broadcast: Option<BroadcastRecord>,
        token: Option<String>,
    },
    UpdateInteractiveUsers {
        users: String,
    },
    EventGoLive,
    EventEnded,
    BroadcastUrl {
        url: Option<String>,
    },
    Error {
        message: String,
    },
}

pub struct WsSession {
    id: ConnId,
    state: Arc<AppState>,
    authed: bool,
    tx: UnboundedSender<ServerMessage>,
    rx: Option<UnboundedReceiver<ServerMessage>>,
}

impl WsSession {
    pub fn new(state: Arc<AppState>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            state,
            authed: false,
            tx,
            rx: Some(rx),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => tracing::warn!(error = %err, "failed to serialize server message"),
        }
    }

    fn close_unauthorized(&self, ctx: &mut ws::WebsocketContext<Self>, description: &str) {
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(description.to_string()),
        }));
        ctx.stop();
    }

    fn handle_client_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.authed {
            match msg {
                ClientMessage::Auth { token } => {
                    match middleware::decode_token(&self.state.config.auth.jwt_secret, &token) {
                        Ok(_) => {
                            self.authed = true;
                            self.send(ctx, &ServerMessage::ServerConnected);
                        }
                        Err(err) => {
                            tracing::warn!(session = %self.id, error = %err, "websocket auth failed");
                            self.close_unauthorized(ctx, "authentication failed");
                        }
                    }
                }
                _ => self.close_unauthorized(ctx, "authenticate first"),
            }
            return;
        }

        let state = self.state.clone();
        let tx = self.tx.clone();
        let conn_id = self.id;
        match msg {
            ClientMessage::Auth { .. } => {}
            ClientMessage::JoinRoom { room } | ClientMessage::JoinBroadcast { room } => {
                actix_rt::spawn(async move {
                    state.presence.join_room(&room, conn_id, tx).await;
                });
            }
            ClientMessage::JoinInteractive { admin_id, fan_url } => {
                actix_rt::spawn(async move {
                    join_interactive_flow(state, conn_id, tx, admin_id, fan_url).await;
                });
            }
            ClientMessage::ProducerJoinRoom { admin_id, fan_url } => {
                actix_rt::spawn(async move {
                    producer_join_flow(state, conn_id, tx, admin_id, fan_url).await;
                });
            }
            ClientMessage::EventGoLive { session_id } => {
                actix_rt::spawn(async move {
                    event_go_live_flow(state, session_id).await;
                });
            }
            ClientMessage::EventEnded {
                admin_id,
                fan_url,
                broadcast_enabled,
                ..
            } => {
                actix_rt::spawn(async move {
                    event_ended_flow(state, admin_id, fan_url, broadcast_enabled).await;
                });
            }
            ClientMessage::RequestBroadcastUrl { session_id } => {
                actix_rt::spawn(async move {
                    broadcast_url_flow(state, tx, session_id).await;
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(session = %self.id, "websocket session started");
        if let Some(rx) = self.rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        ctx.run_later(AUTH_TIMEOUT, |act, ctx| {
            if !act.authed {
                tracing::debug!(session = %act.id, "closing unauthenticated session");
                act.close_unauthorized(ctx, "authentication timeout");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::debug!(session = %self.id, "websocket session stopped");
        let presence = self.state.presence.clone();
        let id = self.id;
        actix_rt::spawn(async move {
            presence.disconnect(id).await;
        });
    }
}

/// Room pushes and async-flow replies arrive here and go out on the socket.
impl StreamHandler<ServerMessage> for WsSession {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        self.send(ctx, &msg);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(parsed) => self.handle_client_message(parsed, ctx),
                Err(err) => {
                    tracing::debug!(session = %self.id, error = %err, "ignoring malformed message");
                    self.send(
                        ctx,
                        &ServerMessage::Error {
                            message: "malformed message".to_string(),
                        },
                    );
                }
            },
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) | Ok(ws::Message::Continuation(_)) => {
                tracing::warn!(session = %self.id, "unsupported frame, closing");
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                tracing::error!(session = %self.id, error = %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    ws::start(WsSession::new(state.into_inner()), &req, stream)
}

// ========================================
// Async flows
// ========================================

async fn join_interactive_flow(
    state: Arc<AppState>,
    conn_id: ConnId,
    tx: UnboundedSender<ServerMessage>,
    admin_id: Uuid,
    fan_url: String,
) {
    match admit_interactive(&state, conn_id, tx.clone(), admin_id, &fan_url).await {
        Ok(reply) => {
            let _ = tx.send(reply);
        }
        Err(err) => {
            tracing::warn!(%admin_id, %fan_url, error = %err, "interactive join failed");
            let _ = tx.send(ServerMessage::Error {
                message: "unable to join".to_string(),
            });
        }
    }
}

/// The admission decision plus its join side effects: look the event up by
/// routing slug, let the presence controller decide, then mint the fan token
/// and attach the broadcast record when HLS is on.
async fn admit_interactive(
    state: &AppState,
    conn_id: ConnId,
    sender: UnboundedSender<ServerMessage>,
    admin_id: Uuid,
    fan_url: &str,
) -> AppResult<ServerMessage> {
    let Some(event) = state.events.find_by_fan_url(admin_id, fan_url).await? else {
        return Ok(ServerMessage::AbleToJoin {
            able_to_join: false,
            event: None,
            broadcast: None,
            token: None,
        });
    };

    if !state.presence.able_to_join(&event).await {
        return Ok(ServerMessage::AbleToJoin {
            able_to_join: false,
            event: Some(event),
            broadcast: None,
            token: None,
        });
    }

    let admin = state
        .admins
        .find(event.admin_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("admin {} not found", event.admin_id)))?;
    let creds = state.credentials_for(&admin)?;
    let token = state
        .platform
        .create_token(
            &creds,
            &event.stage_session_id,
            ParticipantRole::Fan,
            Some(serde_json::json!({ "fanUrl": event.fan_url })),
        )
        .map_err(|e| AppError::Platform(e.to_string()))?;

    let broadcast = if admin.hls_enabled {
        state
            .orchestrator
            .broadcast_data(&cache::event_key(event.admin_id, &event.fan_url))
            .await?
    } else {
        None
    };

    state.presence.join_interactive(&event, conn_id, sender).await;

    Ok(ServerMessage::AbleToJoin {
        able_to_join: true,
        event: Some(event),
        broadcast,
        token: Some(token),
    })
}

async fn producer_join_flow(
    state: Arc<AppState>,
    conn_id: ConnId,
    tx: UnboundedSender<ServerMessage>,
    admin_id: Uuid,
    fan_url: String,
) {
    match state.events.find_by_fan_url(admin_id, &fan_url).await {
        Ok(Some(event)) => {
            state.presence.join_producer(&event, conn_id, tx).await;
        }
        Ok(None) => {
            let _ = tx.send(ServerMessage::Error {
                message: "event not found".to_string(),
            });
        }
        Err(err) => {
            tracing::warn!(%admin_id, %fan_url, error = %err, "producer join failed");
        }
    }
}

/// Producer signalled the stage is live: flag the record (which may lazily
/// start the CDN broadcast) and tell the one-way viewers.
async fn event_go_live_flow(state: Arc<AppState>, session_id: String) {
    let flow = async {
        let Some(record) = state.orchestrator.broadcast_data_by_session(&session_id).await? else {
            return Ok::<_, AppError>(());
        };
        let admin = state
            .admins
            .find(record.admin_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("admin {} not found", record.admin_id)))?;
        let creds = state.credentials_for(&admin)?;

        let updated = state
            .orchestrator
            .mark_live(&record.event_key(), &creds)
            .await?;
        if let Some(broadcast_id) = updated.and_then(|r| r.broadcast_id) {
            state
                .presence
                .emit_to_room(&presence::broadcast_room(&broadcast_id), ServerMessage::EventGoLive)
                .await;
        }
        Ok(())
    };
    if let Err(err) = flow.await {
        tracing::warn!(%session_id, error = %err, "event go-live signal failed");
    }
}

/// Producer signalled the show is over: tell CDN viewers, schedule the
/// delayed broadcast stop, and drop the record.
async fn event_ended_flow(
    state: Arc<AppState>,
    admin_id: Uuid,
    fan_url: String,
    broadcast_enabled: bool,
) {
    let flow = async {
        let event_key = cache::event_key(admin_id, &fan_url);
        if broadcast_enabled {
            if let Some(record) = state.orchestrator.broadcast_data(&event_key).await? {
                if let Some(broadcast_id) = record.broadcast_id.clone() {
                    state
                        .presence
                        .emit_to_room(
                            &presence::broadcast_room(&broadcast_id),
                            ServerMessage::EventEnded,
                        )
                        .await;
                    let admin = state
                        .admins
                        .find(record.admin_id)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound(format!("admin {} not found", record.admin_id))
                        })?;
                    let creds = state.credentials_for(&admin)?;
                    state.orchestrator.stop(broadcast_id, &event_key, &creds).await;
                }
            }
        }
        state.orchestrator.delete_record(&event_key).await?;
        Ok::<_, AppError>(())
    };
    if let Err(err) = flow.await {
        tracing::warn!(%admin_id, %fan_url, error = %err, "event ended signal failed");
    }
}

async fn broadcast_url_flow(
    state: Arc<AppState>,
    tx: UnboundedSender<ServerMessage>,
    session_id: String,
) {
    match state.orchestrator.broadcast_data_by_session(&session_id).await {
        Ok(record) => {
            let _ = tx.send(ServerMessage::BroadcastUrl {
                url: record.and_then(|r| r.broadcast_url),
            });
        }
        Err(err) => {
            tracing::warn!(%session_id, error = %err, "broadcast url lookup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"join_interactive","admin_id":"00000000-0000-0000-0000-000000000000","fan_url":"spring-show"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinInteractive { fan_url, .. } if fan_url == "spring-show"
        ));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn server_messages_serialize_with_tags() {
        let json = serde_json::to_string(&ServerMessage::UpdateInteractiveUsers {
            users: "3 / 10".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"update_interactive_users","users":"3 / 10"}"#
        );
    }
}
