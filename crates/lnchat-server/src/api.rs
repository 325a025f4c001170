use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequest, State},
    http::Method,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use lnchat_service::{ChatService, SendRequest, Subscription, Version};
use lnchat_shared::ln::{ChannelPoint, OpenChannelRequest, SelfBalance, SelfInfo};
use lnchat_shared::{Address, ChatError, MessageOptions, Node, PageOptions};
use lnchat_store::{Contact, Discussion, DiscussionStatistics, Invoice, Message};

use crate::auth::{basic_auth_middleware, BasicAuth};
use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
}

/// JSON body whose rejections come back as `invalid_argument`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct Body<T>(T);

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: AppState, auth: Option<BasicAuth>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let mut router = Router::new()
        // NodeInfo
        .route("/v1/nodeinfo/version", get(get_version))
        .route("/v1/nodeinfo/self", get(get_self_info))
        .route("/v1/nodeinfo/balance", get(get_self_balance))
        .route("/v1/nodeinfo/nodes", get(get_nodes))
        .route("/v1/nodeinfo/search_by_address", post(search_node_by_address))
        .route("/v1/nodeinfo/search_by_alias", post(search_node_by_alias))
        .route("/v1/nodeinfo/connect", post(connect_node))
        // Contact
        .route("/v1/contact/add", post(add_contact))
        .route("/v1/contact/get", post(get_contact))
        .route("/v1/contact/list", post(get_contacts))
        .route("/v1/contact/remove_by_id", post(remove_contact_by_id))
        .route("/v1/contact/remove_by_address", post(remove_contact_by_address))
        // Discussion
        .route("/v1/discussion/list", post(get_discussions))
        .route("/v1/discussion/get", post(get_discussion))
        .route("/v1/discussion/history", post(get_history))
        .route("/v1/discussion/statistics", post(get_statistics))
        .route("/v1/discussion/add", post(add_discussion))
        .route("/v1/discussion/update_last_read", post(update_last_read))
        .route("/v1/discussion/remove", post(remove_discussion))
        // Message
        .route("/v1/message/estimate", post(estimate_message))
        .route("/v1/message/send", post(send_message))
        .route("/v1/message/subscribe", get(subscribe_messages))
        // Payment
        .route("/v1/payment/create_invoice", post(create_invoice))
        .route("/v1/payment/lookup_invoice", post(lookup_invoice))
        // Channel
        .route("/v1/channel/open", post(open_channel));

    if let Some(auth) = auth {
        router = router.layer(middleware::from_fn_with_state(auth, basic_auth_middleware));
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_address(s: &str) -> Result<Address, ApiError> {
    Ok(Address::parse(s)?)
}

#[derive(Serialize)]
struct Empty {}

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddressRequest {
    address: String,
}

#[derive(Deserialize)]
struct AliasRequest {
    alias: String,
}

#[derive(Deserialize)]
struct ConnectRequest {
    address: String,
    host_port: String,
}

async fn get_version(State(state): State<AppState>) -> Json<Version> {
    Json(state.service.get_version())
}

async fn get_self_info(State(state): State<AppState>) -> ApiResult<SelfInfo> {
    Ok(Json(state.service.get_self_info().await?))
}

async fn get_self_balance(State(state): State<AppState>) -> ApiResult<SelfBalance> {
    Ok(Json(state.service.get_self_balance().await?))
}

async fn get_nodes(State(state): State<AppState>) -> ApiResult<Vec<Node>> {
    Ok(Json(state.service.get_nodes().await?))
}

async fn search_node_by_address(
    State(state): State<AppState>,
    Body(req): Body<AddressRequest>,
) -> ApiResult<Node> {
    let address = parse_address(&req.address)?;
    Ok(Json(state.service.search_node_by_address(&address).await?))
}

async fn search_node_by_alias(
    State(state): State<AppState>,
    Body(req): Body<AliasRequest>,
) -> ApiResult<Vec<Node>> {
    Ok(Json(state.service.search_node_by_alias(&req.alias).await?))
}

async fn connect_node(
    State(state): State<AppState>,
    Body(req): Body<ConnectRequest>,
) -> ApiResult<Empty> {
    let address = parse_address(&req.address)?;
    state.service.connect_node(&address, &req.host_port).await?;
    Ok(Json(Empty {}))
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddContactRequest {
    display_name: String,
    address: String,
    #[serde(default)]
    alias: String,
}

#[derive(Deserialize)]
struct IdRequest {
    id: u64,
}

async fn add_contact(
    State(state): State<AppState>,
    Body(req): Body<AddContactRequest>,
) -> ApiResult<Contact> {
    let node = Node {
        alias: req.alias,
        address: parse_address(&req.address)?,
    };
    Ok(Json(state.service.add_contact(&req.display_name, &node)?))
}

async fn get_contact(
    State(state): State<AppState>,
    Body(req): Body<IdRequest>,
) -> ApiResult<Contact> {
    Ok(Json(state.service.get_contact(req.id)?))
}

async fn get_contacts(
    State(state): State<AppState>,
    Body(page): Body<PageOptions>,
) -> ApiResult<Vec<Contact>> {
    Ok(Json(state.service.get_contacts(&page)?))
}

async fn remove_contact_by_id(
    State(state): State<AppState>,
    Body(req): Body<IdRequest>,
) -> ApiResult<Empty> {
    state.service.remove_contact_by_id(req.id)?;
    Ok(Json(Empty {}))
}

async fn remove_contact_by_address(
    State(state): State<AppState>,
    Body(req): Body<AddressRequest>,
) -> ApiResult<Empty> {
    let address = parse_address(&req.address)?;
    state.service.remove_contact_by_address(&address)?;
    Ok(Json(Empty {}))
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct HistoryRequest {
    id: u64,
    #[serde(default)]
    page: PageOptions,
}

#[derive(Deserialize)]
struct AddDiscussionRequest {
    participants: Vec<String>,
    #[serde(default)]
    options: MessageOptions,
}

#[derive(Deserialize)]
struct UpdateLastReadRequest {
    id: u64,
    message_id: u64,
}

async fn get_discussions(
    State(state): State<AppState>,
    Body(page): Body<PageOptions>,
) -> ApiResult<Vec<Discussion>> {
    Ok(Json(state.service.get_discussions(&page)?))
}

async fn get_discussion(
    State(state): State<AppState>,
    Body(req): Body<IdRequest>,
) -> ApiResult<Discussion> {
    Ok(Json(state.service.get_discussion(req.id)?))
}

async fn get_history(
    State(state): State<AppState>,
    Body(req): Body<HistoryRequest>,
) -> ApiResult<Vec<Message>> {
    Ok(Json(state.service.get_history(req.id, &req.page)?))
}

async fn get_statistics(
    State(state): State<AppState>,
    Body(req): Body<IdRequest>,
) -> ApiResult<DiscussionStatistics> {
    Ok(Json(state.service.get_statistics(req.id)?))
}

async fn add_discussion(
    State(state): State<AppState>,
    Body(req): Body<AddDiscussionRequest>,
) -> ApiResult<Discussion> {
    let participants = req
        .participants
        .iter()
        .map(|p| parse_address(p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(
        state.service.add_discussion(&participants, &req.options)?,
    ))
}

async fn update_last_read(
    State(state): State<AppState>,
    Body(req): Body<UpdateLastReadRequest>,
) -> ApiResult<Empty> {
    state.service.update_last_read(req.id, req.message_id)?;
    Ok(Json(Empty {}))
}

async fn remove_discussion(
    State(state): State<AppState>,
    Body(req): Body<IdRequest>,
) -> ApiResult<Empty> {
    state.service.remove_discussion(req.id)?;
    Ok(Json(Empty {}))
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    error: String,
}

impl From<&ChatError> for ErrorBody {
    fn from(err: &ChatError) -> Self {
        Self {
            kind: err.kind().as_str(),
            error: err.description().to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendResponse {
    message: Message,
    /// Recipients that could not be paid, when others were.
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_error: Option<ErrorBody>,
}

async fn estimate_message(
    State(state): State<AppState>,
    Body(req): Body<SendRequest>,
) -> ApiResult<Message> {
    Ok(Json(state.service.estimate_message(&req).await?))
}

async fn send_message(
    State(state): State<AppState>,
    Body(req): Body<SendRequest>,
) -> ApiResult<SendResponse> {
    let outcome = state.service.send_message(&req).await?;
    Ok(Json(SendResponse {
        message: outcome.message,
        partial_error: outcome.partial_error.as_ref().map(ErrorBody::from),
    }))
}

/// Unsubscribes when the event stream is dropped.
struct SubscriptionGuard {
    service: Arc<ChatService>,
    subscription: Subscription,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.service.unsubscribe_messages(self.subscription.id);
        debug!(subscriber = self.subscription.id, "event stream closed");
    }
}

async fn subscribe_messages(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.service.subscribe_messages();
    info!(subscriber = subscription.id, "event stream opened");
    let guard = SubscriptionGuard {
        service: state.service.clone(),
        subscription,
    };

    let events = stream::unfold(guard, |mut guard| async move {
        loop {
            let message = guard.subscription.receiver.recv().await?;
            match Event::default().event("message").json_data(&message) {
                Ok(event) => return Some((Ok(event), guard)),
                Err(e) => debug!(error = %e, message_id = message.id, "cannot encode message"),
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Payment & Channel
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateInvoiceRequest {
    #[serde(default)]
    memo: String,
    #[serde(default)]
    amt_msat: i64,
    #[serde(default = "default_expiry")]
    expiry: i64,
    #[serde(default)]
    private: bool,
}

fn default_expiry() -> i64 {
    3600
}

#[derive(Deserialize)]
struct LookupInvoiceRequest {
    pay_req: String,
}

async fn create_invoice(
    State(state): State<AppState>,
    Body(req): Body<CreateInvoiceRequest>,
) -> ApiResult<Invoice> {
    Ok(Json(
        state
            .service
            .create_invoice(&req.memo, req.amt_msat, req.expiry, req.private)
            .await?,
    ))
}

async fn lookup_invoice(
    State(state): State<AppState>,
    Body(req): Body<LookupInvoiceRequest>,
) -> ApiResult<Invoice> {
    Ok(Json(state.service.lookup_invoice(&req.pay_req).await?))
}

async fn open_channel(
    State(state): State<AppState>,
    Body(req): Body<OpenChannelRequest>,
) -> ApiResult<ChannelPoint> {
    Ok(Json(state.service.open_channel(&req).await?))
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Serve `app` until `shutdown` resolves, over TLS when `tls` is set.
pub async fn serve(
    app: Router,
    addr: std::net::SocketAddr,
    tls: Option<axum_server::tls_rustls::RustlsConfig>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    match tls {
        Some(tls) => {
            info!(addr = %addr, "starting HTTPS API server");
            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            tokio::spawn(async move {
                shutdown.await;
                stopper.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
            });
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!(addr = %addr, "starting HTTP API server");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as HttpBody;
    use axum::http::{header, Request, StatusCode};
    use base64::Engine;
    use lnchat_node::SimNetwork;
    use tower::ServiceExt;

    use crate::config::BasicAuthConfig;

    struct Fixture {
        network: SimNetwork,
        service: Arc<ChatService>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let network = SimNetwork::new();
        let node = network.add_node("alice");
        let dir = tempfile::tempdir().unwrap();
        let service = ChatService::start(Arc::new(node), &dir.path().join("lnchat.db"))
            .await
            .unwrap();
        Fixture {
            network,
            service: Arc::new(service),
            _dir: dir,
        }
    }

    fn router(f: &Fixture) -> Router {
        build_router(
            AppState {
                service: f.service.clone(),
            },
            None,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<HttpBody> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(HttpBody::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_version() {
        let f = fixture().await;
        let response = router(&f)
            .oneshot(Request::get("/v1/nodeinfo/version").body(HttpBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["version"], env!("CARGO_PKG_VERSION"));
        f.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_add_discussion_validation() {
        let f = fixture().await;
        let bob = f.network.add_node("bob").address();
        let carol = f.network.add_node("carol").address();

        let response = router(&f)
            .oneshot(post_json(
                "/v1/discussion/add",
                serde_json::json!({
                    "participants": [bob.as_str(), carol.as_str()],
                    "options": {"anonymous": true},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "invalid_argument");

        let response = router(&f)
            .oneshot(post_json(
                "/v1/discussion/add",
                serde_json::json!({"participants": ["NOT-AN-ADDRESS"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "invalid_address");

        let response = router(&f)
            .oneshot(post_json(
                "/v1/discussion/add",
                serde_json::json!({"participants": [bob.as_str()]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let discussion = json(response).await;
        assert_eq!(discussion["options"]["fee_limit_msat"], 3000);

        let response = router(&f)
            .oneshot(post_json(
                "/v1/discussion/get",
                serde_json::json!({"id": discussion["id"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        f.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_unknown_discussion_is_404() {
        let f = fixture().await;
        let response = router(&f)
            .oneshot(post_json("/v1/discussion/history", serde_json::json!({"id": 99})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["kind"], "not_found");
        f.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_argument() {
        let f = fixture().await;
        let response = router(&f)
            .oneshot(post_json("/v1/contact/get", serde_json::json!({"nope": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["kind"], "invalid_argument");
        f.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_send_over_http() {
        let f = fixture().await;
        let bob = f.network.add_node("bob");
        let discussion = f
            .service
            .add_discussion(&[bob.address()], &MessageOptions::default())
            .unwrap();

        let response = router(&f)
            .oneshot(post_json(
                "/v1/message/send",
                serde_json::json!({
                    "payload": "hi",
                    "amt_msat": 1000,
                    "discussion_id": discussion.id,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["message"]["payload"], "hi");
        assert!(body.get("partial_error").is_none());

        f.service.cleanup().await;
    }

    #[tokio::test]
    async fn test_basic_auth_required() {
        let f = fixture().await;
        let auth = BasicAuth::new(&BasicAuthConfig {
            user: "admin".into(),
            password_hash: bcrypt::hash("pw", 4).unwrap(),
        });
        let app = build_router(
            AppState {
                service: f.service.clone(),
            },
            Some(auth),
        );

        let response = app
            .clone()
            .oneshot(Request::get("/v1/nodeinfo/version").body(HttpBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let credentials = base64::engine::general_purpose::STANDARD.encode("admin:pw");
        let response = app
            .oneshot(
                Request::get("/v1/nodeinfo/version")
                    .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                    .body(HttpBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        f.service.cleanup().await;
    }
}
