use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::api::auth::CurrentUser;
use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::db::Db;
use crate::directory::{ChatDirectory, UserDirectory};
use crate::engine::{QuinielaEngine, ShopExchange, TaskClaimEngine};
use crate::error::AppError;
use crate::ledger::PointsLedger;
use crate::types::{
    now_ms, ChatId, ChatKind, EquipOutcome, InstanceDetails, InstanceId, InstanceSummary, ItemId,
    JoinReceipt, LeaderboardEntry, LedgerEntry, OwnedItem, Participation, ParticipationListing,
    PointsEvent, PurchaseReceipt, Quiniela, QuinielaId, QuinielaInstance, Settlement, ShopItem,
    Task, TaskCompletion, TaskId, TaskListing, UserId, UserProfile,
};

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
    pub ledger: PointsLedger,
    pub users: UserDirectory,
    pub chats: ChatDirectory,
    pub tasks: TaskClaimEngine,
    pub quinielas: QuinielaEngine,
    pub shop: ShopExchange,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub events: mpsc::Sender<PointsEvent>,
}

impl ApiState {
    pub fn new(
        db: Db,
        welcome_bonus: i64,
        latency: Arc<LatencyStats>,
        events: mpsc::Sender<PointsEvent>,
    ) -> Self {
        Self {
            ledger: PointsLedger::new(db.clone()),
            users: UserDirectory::new(db.clone(), welcome_bonus),
            chats: ChatDirectory::new(db.clone()),
            tasks: TaskClaimEngine::new(db.clone()),
            quinielas: QuinielaEngine::new(db.clone()),
            shop: ShopExchange::new(db.clone()),
            health: Arc::new(HealthState::new()),
            latency,
            events,
            db,
        }
    }

    /// Hands a committed outcome to the notification consumer without waiting.
    fn publish(&self, event: PointsEvent) {
        let name = event.name();
        match self.events.try_send(event) {
            Ok(()) => self.health.record_published(now_ms()),
            Err(e) => {
                self.health.record_dropped();
                warn!(event = name, "event channel unavailable, dropping: {e}");
            }
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/users", post(create_user))
        .route("/me", get(get_me))
        .route("/me/ledger", get(get_my_ledger))
        .route("/me/items", get(get_my_items))
        .route("/me/unequip", post(unequip))
        .route("/leaderboard", get(get_leaderboard))
        .route("/chats", post(create_chat))
        .route("/chats/:chat_id/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id", delete(delete_task))
        .route("/quinielas", get(list_quinielas))
        .route("/chats/:chat_id/quinielas", post(attach_quiniela).get(list_chat_quinielas))
        .route("/quiniela-instances/:id", get(get_instance))
        .route("/quiniela-instances/:id/join", post(join_instance))
        .route("/quiniela-instances/:id/settle", post(settle_instance))
        .route("/quiniela-instances/:id/participations", get(list_participations))
        .route("/quiniela-instances/:id/me", get(get_my_participation))
        .route("/shop/items", get(list_shop_items))
        .route("/shop/items/:id/purchase", post(purchase_item))
        .route("/shop/items/:id/equip", post(equip_item))
        .layer(middleware::from_fn_with_state(state.clone(), track_latency))
        .with_state(state)
}

async fn track_latency(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let resp = next.run(req).await;
    state.latency.record(started.elapsed());
    resp
}

// ---------------------------------------------------------------------------
// Request bodies and query params
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateUserBody {
    pub display_name: String,
}

#[derive(Deserialize)]
pub struct CreateChatBody {
    pub kind: ChatKind,
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<UserId>,
}

#[derive(Deserialize)]
pub struct CreateTaskBody {
    pub title: String,
    pub description: Option<String>,
    pub reward: Option<i64>,
}

#[derive(Deserialize)]
pub struct AttachBody {
    pub quiniela_id: QuinielaId,
}

#[derive(Deserialize)]
pub struct JoinBody {
    pub stake: i64,
    pub prediction: String,
}

#[derive(Deserialize)]
pub struct SettleBody {
    pub result: String,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub db_ok: bool,
    pub events_published: u64,
    pub events_dropped: u64,
    pub last_event_at_ms: Option<i64>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub sample_count: u64,
}

#[derive(Serialize)]
pub struct ChatCreated {
    pub id: ChatId,
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ---------------------------------------------------------------------------
// Handlers: service
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let db_ok = match state.db.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("health check: database unreachable: {e}");
            false
        }
    };
    let last = state.health.last_event_at_ms();
    Json(HealthResponse {
        db_ok,
        events_published: state.health.events_published(),
        events_dropped: state.health.events_dropped(),
        last_event_at_ms: (last > 0).then_some(last),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let to_ms = |us: Option<u64>| us.map(|v| v as f64 / 1_000.0);
    let (p50, p95, p99) = state.latency.percentiles();
    Json(LatencyResponse {
        p50_ms: to_ms(p50),
        p95_ms: to_ms(p95),
        p99_ms: to_ms(p99),
        sample_count: state.latency.len(),
    })
}

// ---------------------------------------------------------------------------
// Handlers: users, ledger, chats
// ---------------------------------------------------------------------------

async fn create_user(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<CreateUserBody>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    let profile = state.users.register(&body.display_name).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn get_me(State(state): State<ApiState>, CurrentUser(user): CurrentUser) -> ApiResult<UserProfile> {
    Ok(Json(state.users.profile(user).await?))
}

async fn get_my_ledger(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiQuery(q): ApiQuery<LimitQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    Ok(Json(state.ledger.history(user, q.limit.unwrap_or(50)).await?))
}

async fn get_leaderboard(
    State(state): State<ApiState>,
    ApiQuery(q): ApiQuery<LimitQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    Ok(Json(state.ledger.leaderboard(q.limit.unwrap_or(10)).await?))
}

async fn create_chat(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiJson(body): ApiJson<CreateChatBody>,
) -> Result<(StatusCode, Json<ChatCreated>), AppError> {
    let mut members = body.members;
    if !members.contains(&user) {
        members.push(user);
    }
    let id = state.chats.create_chat(body.kind, body.name.as_deref(), &members).await?;
    Ok((StatusCode::CREATED, Json(ChatCreated { id })))
}

// ---------------------------------------------------------------------------
// Handlers: tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(chat_id): ApiPath<ChatId>,
    ApiJson(body): ApiJson<CreateTaskBody>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state
        .tasks
        .create(chat_id, user, &body.title, body.description.as_deref(), body.reward)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(chat_id): ApiPath<ChatId>,
    ApiQuery(q): ApiQuery<LimitQuery>,
) -> ApiResult<Vec<TaskListing>> {
    Ok(Json(state.tasks.list_by_chat(chat_id, user, q.limit.unwrap_or(100)).await?))
}

async fn complete_task(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(task_id): ApiPath<TaskId>,
) -> ApiResult<TaskCompletion> {
    let done = state.tasks.complete(task_id, user).await?;
    state.publish(PointsEvent::from(&done));
    Ok(Json(done))
}

async fn delete_task(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(task_id): ApiPath<TaskId>,
) -> Result<StatusCode, AppError> {
    state.tasks.delete(task_id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Handlers: quinielas
// ---------------------------------------------------------------------------

async fn list_quinielas(State(state): State<ApiState>) -> ApiResult<Vec<Quiniela>> {
    Ok(Json(state.quinielas.list_available().await?))
}

async fn attach_quiniela(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(chat_id): ApiPath<ChatId>,
    ApiJson(body): ApiJson<AttachBody>,
) -> Result<(StatusCode, Json<QuinielaInstance>), AppError> {
    let instance = state.quinielas.attach_to_chat(body.quiniela_id, chat_id, user).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn list_chat_quinielas(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(chat_id): ApiPath<ChatId>,
) -> ApiResult<Vec<InstanceSummary>> {
    Ok(Json(state.quinielas.list_by_chat(chat_id, user).await?))
}

async fn get_instance(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(id): ApiPath<InstanceId>,
) -> ApiResult<InstanceDetails> {
    Ok(Json(state.quinielas.get_details(id, user).await?))
}

async fn join_instance(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(id): ApiPath<InstanceId>,
    ApiJson(body): ApiJson<JoinBody>,
) -> ApiResult<JoinReceipt> {
    let receipt = state.quinielas.join(id, user, body.stake, &body.prediction).await?;
    state.publish(PointsEvent::from(&receipt));
    Ok(Json(receipt))
}

async fn settle_instance(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(id): ApiPath<InstanceId>,
    ApiJson(body): ApiJson<SettleBody>,
) -> ApiResult<Settlement> {
    let settlement = state.quinielas.settle(id, &body.result, user).await?;
    state.publish(PointsEvent::from(&settlement));
    Ok(Json(settlement))
}

async fn list_participations(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<InstanceId>,
) -> ApiResult<Vec<ParticipationListing>> {
    Ok(Json(state.quinielas.list_participations(id).await?))
}

async fn get_my_participation(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(id): ApiPath<InstanceId>,
) -> ApiResult<Option<Participation>> {
    Ok(Json(state.quinielas.my_participation(id, user).await?))
}

// ---------------------------------------------------------------------------
// Handlers: shop
// ---------------------------------------------------------------------------

async fn list_shop_items(State(state): State<ApiState>) -> ApiResult<Vec<ShopItem>> {
    Ok(Json(state.shop.catalog().await?))
}

async fn get_my_items(State(state): State<ApiState>, CurrentUser(user): CurrentUser) -> ApiResult<Vec<OwnedItem>> {
    Ok(Json(state.shop.inventory(user).await?))
}

async fn purchase_item(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(item_id): ApiPath<ItemId>,
) -> ApiResult<PurchaseReceipt> {
    let receipt = state.shop.purchase(user, item_id).await?;
    state.publish(PointsEvent::ItemPurchased {
        user_id: user,
        item_id,
        price: receipt.item.price,
    });
    Ok(Json(receipt))
}

async fn equip_item(
    State(state): State<ApiState>,
    CurrentUser(user): CurrentUser,
    ApiPath(item_id): ApiPath<ItemId>,
) -> ApiResult<EquipOutcome> {
    let outcome = state.shop.equip(user, item_id).await?;
    state.publish(PointsEvent::ItemEquipped { user_id: user, item_id: Some(item_id) });
    Ok(Json(outcome))
}

async fn unequip(State(state): State<ApiState>, CurrentUser(user): CurrentUser) -> ApiResult<EquipOutcome> {
    let outcome = state.shop.unequip(user).await?;
    state.publish(PointsEvent::ItemEquipped { user_id: user, item_id: None });
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDb;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct Harness {
        t: TestDb,
        app: Router,
        events: mpsc::Receiver<PointsEvent>,
    }

    async fn harness() -> Harness {
        let t = TestDb::new().await;
        let (tx, rx) = mpsc::channel(16);
        let latency = Arc::new(LatencyStats::new().unwrap());
        let app = router(ApiState::new(t.db.clone(), 100, latency, tx));
        Harness { t, app, events: rx }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<UserId>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = HttpRequest::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header("x-user-id", user.0.to_string());
        }
        let req = match body {
            Some(json) => req
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let h = harness().await;
        let (status, body) = call(&h.app, "GET", "/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn register_then_read_profile() {
        let h = harness().await;
        let (status, body) =
            call(&h.app, "POST", "/users", None, Some(serde_json::json!({"display_name": "Leo"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["points"], 100);
        let id = UserId(body["id"].as_i64().unwrap());

        let (status, me) = call(&h.app, "GET", "/me", Some(id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["display_name"], "Leo");

        let (_, ledger) = call(&h.app, "GET", "/me/ledger", Some(id), None).await;
        assert_eq!(ledger[0]["reference"]["kind"], "welcome_bonus");
    }

    #[tokio::test]
    async fn task_flow_maps_errors_and_publishes_event() {
        let mut h = harness().await;
        let a = h.t.user("A", 0).await;
        let b = h.t.user("B", 0).await;
        let chat = h.t.group_chat(&[a, b]).await;

        let (status, task) = call(
            &h.app,
            "POST",
            &format!("/chats/{chat}/tasks"),
            Some(a),
            Some(serde_json::json!({"title": "Cantar el himno", "reward": 50})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = task["id"].as_i64().unwrap();

        let (status, body) =
            call(&h.app, "POST", &format!("/tasks/{task_id}/complete"), Some(a), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not_authorized");

        let (status, body) =
            call(&h.app, "POST", &format!("/tasks/{task_id}/complete"), Some(b), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_balance"], 50);

        let (status, body) =
            call(&h.app, "POST", &format!("/tasks/{task_id}/complete"), Some(b), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");

        let event = h.events.try_recv().unwrap();
        assert_eq!(
            event,
            PointsEvent::TaskCompleted {
                task_id: TaskId(task_id),
                chat_id: chat,
                completer_id: b,
                reward: 50,
            }
        );
    }

    #[tokio::test]
    async fn insufficient_funds_is_unprocessable() {
        let h = harness().await;
        let user = h.t.user("Pobre", 100).await;
        let item = h.t.item("Copa", 150, "icon_trophy", true).await;

        let (status, body) =
            call(&h.app, "POST", &format!("/shop/items/{item}/purchase"), Some(user), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "insufficient_funds");

        let (_, me) = call(&h.app, "GET", "/me", Some(user), None).await;
        assert_eq!(me["points"], 100);
    }

    #[tokio::test]
    async fn quiniela_flow_over_http() {
        let mut h = harness().await;
        let a = h.t.user("A", 100).await;
        let b = h.t.user("B", 100).await;
        let chat = h.t.group_chat(&[a, b]).await;
        let q = h.t.catalog_quiniela("Campeón", true).await;

        let (status, inst) = call(
            &h.app,
            "POST",
            &format!("/chats/{chat}/quinielas"),
            Some(a),
            Some(serde_json::json!({"quiniela_id": q.0})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let inst_id = inst["id"].as_i64().unwrap();

        let (status, _) = call(
            &h.app,
            "POST",
            &format!("/quiniela-instances/{inst_id}/join"),
            Some(b),
            Some(serde_json::json!({"stake": 7, "prediction": "Argentina"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, details) =
            call(&h.app, "GET", &format!("/quiniela-instances/{inst_id}"), Some(a), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["can_settle"], true);
        assert_eq!(details["total_staked"], 7);

        let (status, s) = call(
            &h.app,
            "POST",
            &format!("/quiniela-instances/{inst_id}/settle"),
            Some(a),
            Some(serde_json::json!({"result": "Argentina"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(s["winners"][0]["payout"], 10);

        let (_, me) = call(&h.app, "GET", "/me", Some(b), None).await;
        assert_eq!(me["points"], 103);

        assert!(matches!(h.events.try_recv(), Ok(PointsEvent::QuinielaJoined { stake: 7, .. })));
        assert!(matches!(
            h.events.try_recv(),
            Ok(PointsEvent::QuinielaFinalized { total_paid: 10, winner_count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_requests_are_invalid_input() {
        let h = harness().await;
        let a = h.t.user("A", 100).await;
        let chat = h.t.group_chat(&[a]).await;
        let q = h.t.catalog_quiniela("Campeón", true).await;
        let inst = h.t.quinielas().attach_to_chat(q, chat, a).await.unwrap();
        let join = format!("/quiniela-instances/{}/join", inst.id);

        let bad_requests = [
            (join.as_str(), Some(serde_json::json!({"stake": "ten", "prediction": "Argentina"}))),
            (join.as_str(), Some(serde_json::json!({"prediction": "Argentina"}))),
            ("/quiniela-instances/abc/join", Some(serde_json::json!({"stake": 5, "prediction": "x"}))),
            ("/tasks/abc/complete", None),
        ];
        for (uri, body) in bad_requests {
            let (status, resp) = call(&h.app, "POST", uri, Some(a), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}: {resp}");
            assert_eq!(resp["error"], "invalid_input", "{uri}: {resp}");
            assert!(resp["message"].is_string());
        }

        let (status, resp) = call(&h.app, "GET", "/leaderboard?limit=many", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["error"], "invalid_input");

        assert_eq!(h.t.ledger().balance(a).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn latency_is_recorded() {
        let h = harness().await;
        call(&h.app, "GET", "/health", None, None).await;
        let (status, stats) = call(&h.app, "GET", "/stats/latency", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(stats["sample_count"].as_u64().unwrap() >= 1);
    }
}
