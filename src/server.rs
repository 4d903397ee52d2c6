use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::auth::{bearer_token, Authenticator};
use crate::backend::{MessageStore, Page, Profile, ProfileResolver};
use crate::error::{BackendError, SessionError};
use crate::messages::ChatPayload;
use crate::relay::chat_payload;
use crate::room::{MessageId, RoomId, UserId};
use crate::session::{ConnectionSession, SessionContext, SessionGuard};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;
const CLOSE_UNAUTHENTICATED: u16 = 4401;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct Server {
    ctx: SessionContext,
    messages: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileResolver>,
    auth: Arc<dyn Authenticator>,
}

impl Server {
    pub fn new(
        ctx: SessionContext,
        messages: Arc<dyn MessageStore>,
        profiles: Arc<dyn ProfileResolver>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Server {
            ctx,
            messages,
            profiles,
            auth,
        }
    }

    /// Resolves the caller from a bearer header, falling back to `?token=`
    /// since browsers cannot set headers on websocket upgrades.
    async fn identify(&self, header: Option<&str>, query: &HashMap<String, String>) -> Option<UserId> {
        let token = header
            .and_then(bearer_token)
            .or_else(|| query.get("token").map(String::as_str))?;
        self.auth.authenticate(token).await
    }

    pub async fn handle_connection(&self, ws: WebSocket, room: RoomId, user: Option<UserId>) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let mut session = ConnectionSession::new(self.ctx.clone(), room, user, tx);
        if let Err(e) = session.join().await {
            warn!("Session {} could not join room {}: {}", session.id(), room, e);
            let code = match e {
                SessionError::Unauthenticated => CLOSE_UNAUTHENTICATED,
                _ => CLOSE_INTERNAL,
            };
            if let Err(e) = ws_tx.send(Message::close_with(code, e.to_string())).await {
                debug!("Failed to send close frame: {}", e);
            }
            return;
        }
        let session_id = session.id().to_string();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::text(frame)).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            if let Err(e) = ws_tx.close().await {
                debug!("Failed to close WebSocket: {}", e);
            }
        });

        let mut guard = SessionGuard::new(session);
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("WebSocket error on session {}: {}", session_id, e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            debug!("Frame from session {}: {}", session_id, text);
            if let Err(e) = guard.receive(text).await {
                if e.is_fatal() {
                    error!("Closing session {}: {}", session_id, e);
                    break;
                }
                warn!("Frame on session {} failed: {}", session_id, e);
            }
        }
        guard.finish().await;
    }

    async fn history(&self, room: RoomId, query: PageQuery) -> Response {
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = match self.messages.read_page(room, offset, limit).await {
            Ok(page) => page,
            Err(e) => return backend_error_reply(&e),
        };

        let authors: Vec<UserId> = page
            .items
            .iter()
            .map(|m| m.user)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let profiles: HashMap<UserId, Profile> = match self.profiles.resolve(&authors).await {
            Ok(profiles) => profiles.into_iter().map(|p| (p.id, p)).collect(),
            Err(e) => return backend_error_reply(&e),
        };

        let items: Vec<ChatPayload> = page
            .items
            .iter()
            .map(|m| chat_payload(m, profiles.get(&m.user)))
            .collect();
        let body = Page {
            items,
            total: page.total,
        };
        warp::reply::with_status(warp::reply::json(&body), StatusCode::OK).into_response()
    }

    async fn delete_message(&self, id: MessageId, header: Option<&str>) -> Response {
        let Some(user) = self.identify(header, &HashMap::new()).await else {
            return detail(StatusCode::UNAUTHORIZED, "Authentication required");
        };
        match self.messages.delete(id, user).await {
            Ok(()) => {
                info!("User {} deleted message {}", user, id);
                StatusCode::NO_CONTENT.into_response()
            }
            Err(e) => backend_error_reply(&e),
        }
    }

    async fn presence(&self, room: RoomId) -> Response {
        match self.ctx.presence.snapshot(room).await {
            Ok(snapshot) => warp::reply::json(&snapshot).into_response(),
            Err(e) => {
                error!("Presence snapshot for room {} failed: {}", room, e);
                detail(StatusCode::SERVICE_UNAVAILABLE, "Presence unavailable")
            }
        }
    }
}

fn detail(status: StatusCode, message: &str) -> Response {
    warp::reply::with_status(warp::reply::json(&json!({ "detail": message })), status).into_response()
}

fn backend_error_reply(err: &BackendError) -> Response {
    let status = match err {
        BackendError::RoomNotFound(_) | BackendError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        BackendError::Forbidden => StatusCode::FORBIDDEN,
        BackendError::Unavailable(_) => {
            error!("Backend failure: {}", err);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    detail(status, &err.to_string())
}

pub fn routes(
    server: Server,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_server = warp::any().map(move || server.clone());

    let ws_route = warp::path!("ws" / "rooms" / RoomId)
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server.clone())
        .and_then(
            |room: RoomId, ws: Ws, header: Option<String>, query: HashMap<String, String>, server: Server| async move {
                let user = server.identify(header.as_deref(), &query).await;
                Ok::<_, Rejection>(ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket, room, user).await;
                }))
            },
        );

    let history = warp::path!("api" / "rooms" / RoomId / "messages")
        .and(warp::get())
        .and(warp::query::<PageQuery>())
        .and(with_server.clone())
        .and_then(|room: RoomId, query: PageQuery, server: Server| async move {
            Ok::<_, Rejection>(server.history(room, query).await)
        });

    let presence = warp::path!("api" / "rooms" / RoomId / "presence")
        .and(warp::get())
        .and(with_server.clone())
        .and_then(|room: RoomId, server: Server| async move {
            Ok::<_, Rejection>(server.presence(room).await)
        });

    let delete = warp::path!("api" / "messages" / MessageId)
        .and(warp::delete())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_server)
        .and_then(|id: MessageId, header: Option<String>, server: Server| async move {
            Ok::<_, Rejection>(server.delete_message(id, header.as_deref()).await)
        });

    let health = warp::path!("health").and(warp::get()).map(|| "ok");

    ws_route
        .or(history)
        .or(presence)
        .or(delete)
        .or(health)
        .or(warp::fs::dir(static_dir))
        .with(warp::cors().allow_any_origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::TokenAuthenticator;
    use crate::backend::MemoryBackend;
    use crate::channel::LocalChannel;
    use crate::messages::ServerMessage;
    use crate::presence::{MemoryPresenceStore, PresenceCoordinator, DEFAULT_HEARTBEAT_TTL};
    use crate::relay::MessageRelay;

    struct App {
        server: Server,
        backend: Arc<MemoryBackend>,
        channel: Arc<LocalChannel>,
        alice: String,
        bob: String,
    }

    async fn app() -> App {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_room(RoomId(7), "lobby").await;
        for (id, name) in [(1, "alice"), (2, "bob")] {
            backend
                .add_profile(Profile { id: UserId(id), username: name.to_string(), avatar: None })
                .await;
        }
        let auth = Arc::new(TokenAuthenticator::new());
        let alice = auth.issue(UserId(1)).await;
        let bob = auth.issue(UserId(2)).await;

        let channel = Arc::new(LocalChannel::new());
        let presence = Arc::new(PresenceCoordinator::new(
            Arc::new(MemoryPresenceStore::new()),
            backend.clone(),
            channel.clone(),
            DEFAULT_HEARTBEAT_TTL,
        ));
        let relay = Arc::new(MessageRelay::new(backend.clone(), backend.clone(), channel.clone()));
        let ctx = SessionContext { presence, relay, channel: channel.clone() };
        let server = Server::new(ctx, backend.clone(), backend.clone(), auth);
        App { server, backend, channel, alice, bob }
    }

    fn filter(app: &App) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        routes(app.server.clone(), PathBuf::from("public"))
    }

    async fn next_event(client: &mut warp::test::WsClient) -> ServerMessage {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for event")
            .expect("websocket closed");
        serde_json::from_str(msg.to_str().expect("text frame")).unwrap()
    }

    fn count_of(event: &ServerMessage) -> usize {
        match event {
            ServerMessage::Presence { count, .. } => *count,
            ServerMessage::Chat { .. } => panic!("expected presence, got {event:?}"),
        }
    }

    #[tokio::test]
    async fn health_check() {
        let app = app().await;
        let res = warp::test::request().path("/health").reply(&filter(&app)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), "ok");
    }

    #[tokio::test]
    async fn anonymous_socket_is_closed() {
        let app = app().await;
        let mut client = warp::test::ws()
            .path("/ws/rooms/7?token=bogus")
            .handshake(filter(&app))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.recv_closed())
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert!(app.server.ctx.presence.live_members(RoomId(7)).await.unwrap().is_empty());
        assert_eq!(app.channel.subscriber_count(RoomId(7)).await, 0);
    }

    #[tokio::test]
    async fn two_users_chat_and_see_each_other() {
        let app = app().await;
        let mut a = warp::test::ws()
            .path(&format!("/ws/rooms/7?token={}", app.alice))
            .handshake(filter(&app))
            .await
            .unwrap();
        assert_eq!(count_of(&next_event(&mut a).await), 1);

        let mut b = warp::test::ws()
            .path("/ws/rooms/7")
            .header("authorization", format!("Bearer {}", app.bob))
            .handshake(filter(&app))
            .await
            .unwrap();
        assert_eq!(count_of(&next_event(&mut a).await), 2);
        assert_eq!(count_of(&next_event(&mut b).await), 2);

        b.send_text(r#"{"body":"hi"}"#).await;
        for client in [&mut a, &mut b] {
            let ServerMessage::Chat { message } = next_event(client).await else {
                panic!("expected chat event");
            };
            assert_eq!(message.body, "hi");
            assert_eq!(message.user, UserId(2));
            assert_eq!(message.username, "bob");
        }

        drop(a);
        let ServerMessage::Presence { users, count } = next_event(&mut b).await else {
            panic!("expected presence event");
        };
        assert_eq!(count, 1);
        assert_eq!(users[0].id, UserId(2));
    }

    #[tokio::test]
    async fn history_is_paged_newest_first() {
        let app = app().await;
        for body in ["one", "two", "three"] {
            app.backend.persist(RoomId(7), UserId(1), body).await.unwrap();
        }
        let res = warp::test::request()
            .path("/api/rooms/7/messages?limit=2")
            .reply(&filter(&app))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["total"], 3);
        assert_eq!(body["items"][0]["body"], "three");
        assert_eq!(body["items"][0]["username"], "alice");
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let res = warp::test::request()
            .path("/api/rooms/99/messages")
            .reply(&filter(&app))
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_checks_authorship() {
        let app = app().await;
        let message = app.backend.persist(RoomId(7), UserId(1), "mine").await.unwrap();
        let path = format!("/api/messages/{}", message.id);

        let res = warp::test::request().method("DELETE").path(&path).reply(&filter(&app)).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request()
            .method("DELETE")
            .path(&path)
            .header("authorization", format!("Bearer {}", app.bob))
            .reply(&filter(&app))
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(app.backend.message_count().await, 1);

        let res = warp::test::request()
            .method("DELETE")
            .path(&path)
            .header("authorization", format!("Bearer {}", app.alice))
            .reply(&filter(&app))
            .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(app.backend.message_count().await, 0);
    }

    #[tokio::test]
    async fn presence_endpoint_returns_snapshot() {
        let app = app().await;
        app.server.ctx.presence.enter(RoomId(7), UserId(1)).await.unwrap();
        let res = warp::test::request()
            .path("/api/rooms/7/presence")
            .reply(&filter(&app))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["type"], "presence");
        assert_eq!(body["count"], 1);
        assert_eq!(body["users"][0]["username"], "alice");
    }
}
