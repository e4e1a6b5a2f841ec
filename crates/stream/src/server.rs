//! HTTP server: the websocket endpoint and the JSON API.

use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use roost_types::{MessageId, MessageRecord, SealedMessage, Subscription, User};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthError, Authenticator},
    bus::Subscriber,
    connection::Outbound,
    cursor::{CursorCodec, CursorError},
    filter::Filter,
    manager::{ConnectionManager, Event, ManagerHandle},
    store::{MemoryStore, MessageStore, QueryOptions, StoreError},
    types::ServerOptions,
};

/// Default page size for `GET /api/messages`.
const DEFAULT_MESSAGE_COUNT: u64 = 20;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: ManagerHandle,
    pub store: Arc<dyn MessageStore>,
    pub auth: Arc<dyn Authenticator>,
    pub subscriber: Arc<Subscriber>,
    pub codec: CursorCodec,
    pub options: ServerOptions,
}

/// A wired-up server whose connection manager has not started yet.
pub struct App {
    pub state: AppState,
    pub manager: ConnectionManager,
    pub events: mpsc::UnboundedReceiver<Event>,
}

impl App {
    pub fn new(
        options: ServerOptions,
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, ServeError> {
        let codec = CursorCodec::new(options.cursor_secret.as_bytes())?;
        let (manager, events) = ConnectionManager::new(
            store.clone(),
            auth.clone(),
            codec.clone(),
            options.manager_options(),
        );
        let handle = manager.handle();
        let subscriber = Subscriber::new(store.clone(), handle.clone());
        let state = AppState {
            manager: handle,
            store,
            auth,
            subscriber,
            codec,
            options,
        };
        Ok(Self {
            state,
            manager,
            events,
        })
    }
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Invalid cursor secret: {0}")]
    Cursor(#[from] CursorError),

    #[error("Failed to load subscriptions: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Auth backend failure: {0}")]
    Auth(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::User(reason) => ApiError::Unauthorized(reason),
            AuthError::Internal(reason) => ApiError::Auth(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingToken | ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Store(StoreError::InvalidSubscription(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Auth(_) | ApiError::Store(_) => {
                warn!(error = %self, "API request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Create the router with the socket endpoint and the API.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/v1/socket", get(handle_socket_upgrade))
        .route("/health", get(handle_health))
        .route("/api/subscriptions", get(handle_get_subscriptions))
        .route("/api/subscribe", post(handle_subscribe))
        .route("/api/unsubscribe", post(handle_unsubscribe))
        .route(
            "/api/messages",
            get(handle_get_messages).post(handle_publish),
        )
        .layer(cors)
        .with_state(state)
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn handle_socket_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

/// Pump one websocket. The manager sees the socket as a stream of `Data`
/// events followed by `Closed`; everything it writes comes back through the
/// outbound queue.
async fn handle_socket(socket: WebSocket, manager: ManagerHandle) {
    let (socket_id, mut outbound) = manager.open_socket();
    let (mut sender, mut receiver) = socket.split();
    debug!(socket = %socket_id, "WebSocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let reader_manager = manager.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => reader_manager.data(socket_id, text.as_str()),
                Ok(Message::Binary(data)) => reader_manager.data(socket_id, data.to_vec()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(socket = %socket_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    manager.closed(socket_id);
    debug!(socket = %socket_id, "WebSocket disconnected");
}

/// Resolve the `Authorization: Bearer` token on an API request.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::MissingToken)?;
    Ok(state.auth.check_auth_token(token.trim()).await?)
}

/// Body of subscribe and unsubscribe requests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    /// Requesting client; its sockets are not told about the change
    #[serde(default)]
    pub client_id: Option<String>,
}

impl SubscriptionRequest {
    fn subscription(&self) -> Result<Subscription, ApiError> {
        let class = match self.class.as_deref() {
            Some(class) if !class.is_empty() => class,
            _ => return Err(ApiError::BadRequest("class parameter required".to_string())),
        };
        Ok(Subscription::new(
            class,
            self.instance.clone(),
            self.recipient.clone().unwrap_or_default(),
        ))
    }
}

/// GET /api/subscriptions
async fn handle_get_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    Ok(Json(state.store.get_user_subscriptions(user.id).await?))
}

/// POST /api/subscribe
async fn handle_subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let subscription = request.subscription()?;
    state
        .subscriber
        .subscribe(&user, request.client_id, vec![subscription.clone()])
        .await?;
    info!(user = user.id, class = %subscription.class, "Subscribed");
    Ok(Json(subscription))
}

/// POST /api/unsubscribe
async fn handle_unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let subscription = request.subscription()?;
    state
        .subscriber
        .unsubscribe(&user, request.client_id, subscription.clone())
        .await?;
    info!(user = user.id, class = %subscription.class, "Unsubscribed");
    Ok(Json(subscription))
}

/// Query parameters for GET /api/messages.
#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    /// Cursor to page from; absent means the start (or end, in reverse)
    pub offset: Option<String>,
    /// Include the message at `offset`
    #[serde(default)]
    pub inclusive: bool,
    #[serde(default)]
    pub reverse: bool,
    pub count: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<SealedMessage>,
    pub is_done: bool,
}

/// Translate a page request into the store's exclusive anchor.
fn query_anchor(offset: Option<MessageId>, inclusive: bool, reverse: bool) -> MessageId {
    match (offset, reverse) {
        (None, false) => 0,
        (None, true) => MessageId::MAX,
        (Some(id), false) if inclusive => id.saturating_sub(1),
        (Some(id), true) if inclusive => id.saturating_add(1),
        (Some(id), _) => id,
    }
}

/// GET /api/messages
async fn handle_get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let offset = match query.offset.as_deref() {
        None | Some("") => None,
        Some(cursor) => Some(
            state
                .codec
                .unseal(cursor)
                .map_err(|e| ApiError::BadRequest(format!("Bad offset: {}", e)))?,
        ),
    };
    let anchor = query_anchor(offset, query.inclusive, query.reverse);
    let options = QueryOptions {
        limit: query.count.unwrap_or(DEFAULT_MESSAGE_COUNT),
        reverse: query.reverse,
    };

    let result = state
        .store
        .get_messages(user.id, anchor, &Filter::default(), options)
        .await?;
    let messages = result
        .messages
        .iter()
        .map(|m| m.seal(state.codec.seal(m.id)))
        .collect();
    Ok(Json(MessagesResponse {
        messages,
        is_done: result.is_done,
    }))
}

/// Body of POST /api/messages.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub class: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub opcode: String,
    #[serde(default)]
    pub signature: String,
    pub message: String,
}

/// POST /api/messages: inject a message as if it arrived from upstream.
async fn handle_publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let now = Utc::now().timestamp_millis();
    let record = MessageRecord {
        class: request.class,
        instance: request.instance,
        sender: user.display_name,
        recipient: request.recipient,
        realm: String::new(),
        opcode: request.opcode,
        signature: request.signature,
        message: request.message,
        time: now,
        receive_time: now,
        auth: 1,
    };

    match state.subscriber.publish(record).await? {
        Some(message) => {
            let cursor = state.codec.seal(message.id);
            Ok((StatusCode::CREATED, Json(json!({ "id": cursor }))).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Start the server with an in-memory store and run until `shutdown`
/// resolves.
pub async fn start_server<F>(
    options: ServerOptions,
    auth: Arc<dyn Authenticator>,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = MemoryStore::with_max_messages(options.max_messages_returned);
    let App {
        state,
        manager,
        events,
    } = App::new(options.clone(), store, auth)?;

    let subs = state.store.load_active_subscriptions().await?;
    let added = state.subscriber.subscribe_to(&subs);
    info!(triples = added, "Loaded active subscriptions");

    let manager_task = tokio::spawn(manager.run(events));
    let router = create_router(state.clone());

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting roost server on {}", listener.local_addr()?);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Cancelling subscriptions");
    state.subscriber.cancel_subscriptions();
    state.manager.shutdown();
    let _ = manager_task.await;

    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::StaticAuthenticator;

    const TOKEN: &str = "Bearer alice-token";

    fn create_test_app() -> (Router, App) {
        let auth = StaticAuthenticator::new().with_user(
            "alice-token",
            User {
                id: 1,
                display_name: "alice".to_string(),
            },
        );
        let app = App::new(ServerOptions::default(), MemoryStore::new(), Arc::new(auth)).unwrap();
        (create_router(app.state.clone()), app)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Authorization", TOKEN)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("Authorization", TOKEN)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _app) = create_test_app();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let (router, _app) = create_test_app();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/subscriptions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/subscriptions")
                    .header("Authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Bad token");
    }

    #[tokio::test]
    async fn test_subscribe_and_list() {
        let (router, mut app) = create_test_app();

        let response = router
            .clone()
            .oneshot(post(
                "/api/subscribe",
                json!({"class": "help", "instance": null, "clientId": "A"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.state.subscriber.upstream_count(), 1);

        // Other sockets of the user hear about it.
        assert!(matches!(
            app.events.try_recv(),
            Ok(Event::Bus(crate::manager::BusEvent::Subscribed { user: 1, .. }))
        ));

        let response = router
            .clone()
            .oneshot(get("/api/subscriptions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([{"class": "help", "instance": null, "recipient": ""}])
        );

        let response = router
            .clone()
            .oneshot(post("/api/unsubscribe", json!({"class": "HELP"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(get("/api/subscriptions")).await.unwrap();
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn test_subscribe_requires_class() {
        let (router, _app) = create_test_app();
        let response = router
            .oneshot(post("/api/subscribe", json!({"instance": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_and_page_messages() {
        let (router, app) = create_test_app();
        router
            .clone()
            .oneshot(post("/api/subscribe", json!({"class": "help"})))
            .await
            .unwrap();

        let mut cursors = Vec::new();
        for i in 0..3 {
            let response = router
                .clone()
                .oneshot(post(
                    "/api/messages",
                    json!({"class": "help", "instance": "test", "message": format!("m{}", i)}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            cursors.push(body_json(response).await["id"].as_str().unwrap().to_string());
        }

        // Nobody is subscribed to this one.
        let response = router
            .clone()
            .oneshot(post("/api/messages", json!({"class": "misc", "message": "x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .clone()
            .oneshot(get("/api/messages?count=2"))
            .await
            .unwrap();
        let page: MessagesResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.is_done);
        assert_eq!(page.messages[0].id, cursors[0]);
        assert_eq!(page.messages[0].record.sender, "alice");

        let uri = format!("/api/messages?offset={}", cursors[1]);
        let response = router.clone().oneshot(get(&uri)).await.unwrap();
        let page: MessagesResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, cursors[2]);
        assert!(page.is_done);

        let uri = format!("/api/messages?offset={}&reverse=true&inclusive=true", cursors[1]);
        let response = router.clone().oneshot(get(&uri)).await.unwrap();
        let page: MessagesResponse = serde_json::from_value(body_json(response).await).unwrap();
        let ids: Vec<MessageId> = page
            .messages
            .iter()
            .map(|m| app.state.codec.unseal(&m.id).unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);

        let response = router
            .oneshot(get("/api/messages?offset=garbage"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_query_anchor() {
        assert_eq!(query_anchor(None, false, false), 0);
        assert_eq!(query_anchor(None, true, true), MessageId::MAX);
        assert_eq!(query_anchor(Some(5), false, false), 5);
        assert_eq!(query_anchor(Some(5), true, false), 4);
        assert_eq!(query_anchor(Some(5), true, true), 6);
        assert_eq!(query_anchor(Some(0), true, false), 0);
    }
}
