//! HTTP routes, all under `/app/v1`.
//!
//! | method   | path                                  | allocator call                     |
//! |----------|---------------------------------------|------------------------------------|
//! | `GET`    | `/`                                   | liveness                           |
//! | `PUT`    | `/pools/{name}`                       | `initialize`                       |
//! | `GET`    | `/pools/{name}`                       | `describe_pool`                    |
//! | `DELETE` | `/pools/{name}`                       | `delete_pool`                      |
//! | `GET`    | `/pools/{name}/free`                  | `free_count`                       |
//! | `POST`   | `/pools/{name}/allocations`           | `allocate`                         |
//! | `DELETE` | `/pools/{name}/allocations/{value}`   | `release`                          |
//! | `PUT`    | `/integer-resource/{name}`            | `initialize_resource_pool`         |
//! | `POST`   | `/integer-resource/{name}?number=n`   | `allocate_one` / `allocate_many`   |
//! | `DELETE` | `/integer-resource/{name}/{id}`       | `release_one`                      |
//! | `PUT`    | `/ipv4-resource/{name}`               | `initialize_ipv4_pool`             |
//! | `POST`   | `/ipv4-resource/{name}?number=n`      | `ip_address_alloc_one` / `_many`   |
//! | `DELETE` | `/ipv4-resource/{name}/{address}`     | `ip_address_release`               |
//! | `POST`   | `/unique-identity/{pool}`             | `get_unique_identity`              |
//! | `DELETE` | `/unique-identity/{pool}`             | `delete_counter`                   |
//! | `POST`   | `/unique-identity-range/{pool}?min&max` | `get_unique_identity_within_range` |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use quartermaster::{
    Allocation, Allocator, Ipv4Range, PoolConfig, PoolStrategy, ValueStrategy,
    store::DocumentStore,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

pub struct AppState<S> {
    allocator: Arc<Allocator<S>>,
    max_bulk: usize,
}

impl<S> AppState<S> {
    pub fn new(allocator: Allocator<S>, max_bulk: usize) -> Self {
        Self {
            allocator: Arc::new(allocator),
            max_bulk,
        }
    }

    /// Resolves the `number` query parameter, defaulting to one.
    fn bulk(&self, query: &BulkQuery) -> ApiResult<usize> {
        let number = query.number.unwrap_or(1);
        if number > self.max_bulk {
            return Err(ApiError::invalid(format!(
                "number ({number}) exceeds the limit of {}",
                self.max_bulk
            )));
        }
        Ok(number)
    }
}

// Derived `Clone` would require `S: Clone`.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
            max_bulk: self.max_bulk,
        }
    }
}

pub fn router<S>(state: AppState<S>) -> Router
where
    S: DocumentStore + 'static,
{
    let api = Router::new()
        .route("/", get(liveness))
        .route(
            "/pools/{name}",
            put(put_pool::<S>).get(get_pool::<S>).delete(delete_pool::<S>),
        )
        .route("/pools/{name}/free", get(free_count::<S>))
        .route("/pools/{name}/allocations", post(allocate::<S>))
        .route("/pools/{name}/allocations/{value}", delete(release::<S>))
        .route(
            "/integer-resource/{name}",
            put(put_integer_resource::<S>).post(allocate_integers::<S>),
        )
        .route("/integer-resource/{name}/{id}", delete(release_integer::<S>))
        .route(
            "/ipv4-resource/{name}",
            put(put_ipv4_resource::<S>).post(allocate_addresses::<S>),
        )
        .route("/ipv4-resource/{name}/{address}", delete(release_address::<S>))
        .route(
            "/unique-identity/{pool}",
            post(unique_identity::<S>).delete(delete_counter::<S>),
        )
        .route("/unique-identity-range/{pool}", post(unique_identity_range::<S>));

    Router::new().nest("/app/v1", api).with_state(state)
}

#[derive(Debug, Deserialize)]
struct BulkQuery {
    number: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    min: i64,
    max: i64,
}

#[derive(Debug, Deserialize)]
struct IntegerResourceRequest {
    min: i64,
    max: i64,
    #[serde(default)]
    strategy: Option<ValueStrategy>,
}

#[derive(Debug, Deserialize)]
struct Ipv4ResourceRequest {
    range: Ipv4Range,
    #[serde(default)]
    strategy: Option<ValueStrategy>,
}

#[derive(Debug, Serialize)]
struct PoolView {
    name: String,
    min: i64,
    max: i64,
    strategy: PoolStrategy,
}

#[derive(Debug, Serialize)]
struct Ids {
    pool: String,
    ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct Addresses {
    pool: String,
    addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Identity {
    pool: String,
    id: i64,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct FreeCount {
    pool: String,
    free: u64,
}

async fn liveness() -> &'static str {
    "quartermaster is alive"
}

async fn put_pool<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Json(config): Json<PoolConfig>,
) -> ApiResult<StatusCode> {
    state.allocator.initialize(&name, &config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_pool<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
) -> ApiResult<Json<PoolView>> {
    let descriptor = state.allocator.describe_pool(&name).await?;
    Ok(Json(PoolView {
        name: descriptor.name,
        min: descriptor.min,
        max: descriptor.max,
        strategy: descriptor.strategy,
    }))
}

async fn delete_pool<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Deleted>> {
    let deleted = state.allocator.delete_pool(&name).await?;
    Ok(Json(Deleted { deleted }))
}

async fn free_count<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
) -> ApiResult<Json<FreeCount>> {
    let free = state.allocator.free_count(&name).await?;
    Ok(Json(FreeCount { pool: name, free }))
}

async fn allocate<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Allocation>> {
    Ok(Json(state.allocator.allocate(&name).await?))
}

async fn release<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path((name, value)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    state.allocator.release(&name, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_integer_resource<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Json(request): Json<IntegerResourceRequest>,
) -> ApiResult<StatusCode> {
    let strategy = request.strategy.unwrap_or(ValueStrategy::Sequential);
    state
        .allocator
        .initialize_resource_pool(&name, request.min, request.max, strategy)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn allocate_integers<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Query(query): Query<BulkQuery>,
) -> ApiResult<Json<Ids>> {
    let ids = match state.bulk(&query)? {
        1 => vec![state.allocator.allocate_one(&name).await?],
        n => state.allocator.allocate_many(&name, n).await?,
    };
    Ok(Json(Ids { pool: name, ids }))
}

async fn release_integer<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path((name, id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    state.allocator.release_one(&name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_ipv4_resource<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Json(request): Json<Ipv4ResourceRequest>,
) -> ApiResult<StatusCode> {
    let strategy = request.strategy.unwrap_or(ValueStrategy::Sequential);
    state
        .allocator
        .initialize_ipv4_pool(&name, &request.range, strategy)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn allocate_addresses<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Query(query): Query<BulkQuery>,
) -> ApiResult<Json<Addresses>> {
    let addresses = match state.bulk(&query)? {
        1 => vec![state.allocator.ip_address_alloc_one(&name).await?],
        n => state.allocator.ip_address_alloc_many(&name, n).await?,
    };
    Ok(Json(Addresses {
        pool: name,
        addresses: addresses.iter().map(ToString::to_string).collect(),
    }))
}

async fn release_address<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path((name, address)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.allocator.ip_address_release(&name, &address).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unique_identity<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(pool): Path<String>,
) -> ApiResult<Json<Identity>> {
    let id = state.allocator.get_unique_identity(&pool).await?;
    Ok(Json(Identity { pool, id }))
}

async fn delete_counter<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(pool): Path<String>,
) -> ApiResult<Json<Deleted>> {
    let deleted = state.allocator.delete_counter(&pool).await?;
    Ok(Json(Deleted { deleted }))
}

async fn unique_identity_range<S: DocumentStore + 'static>(
    State(state): State<AppState<S>>,
    Path(pool): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Identity>> {
    let id = state
        .allocator
        .get_unique_identity_within_range(&pool, range.min, range.max)
        .await?;
    Ok(Json(Identity { pool, id }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use quartermaster::store::MemoryStore;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn app(store: &MemoryStore) -> Router {
        router(AppState::new(Allocator::new(store.clone()), 16))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    #[tokio::test]
    async fn liveness_responds() {
        let app = app(&MemoryStore::new());
        let (status, body) = call(&app, Method::GET, "/app/v1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("quartermaster is alive"));
    }

    #[tokio::test]
    async fn sequential_pool_lifecycle() {
        let app = app(&MemoryStore::new());
        let config = json!({ "min": 1, "max": 3, "strategy": { "kind": "sequential" } });

        let (status, _) = call(&app, Method::PUT, "/app/v1/pools/pool1", Some(config)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, Method::GET, "/app/v1/pools/pool1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "name": "pool1", "min": 1, "max": 3, "strategy": { "kind": "sequential" } })
        );

        for expected in 1..=3 {
            let (status, body) =
                call(&app, Method::POST, "/app/v1/pools/pool1/allocations", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({ "id": expected }));
        }

        let (status, body) =
            call(&app, Method::POST, "/app/v1/pools/pool1/allocations", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "pool_exhausted");

        let (status, _) =
            call(&app, Method::DELETE, "/app/v1/pools/pool1/allocations/2", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, Method::GET, "/app/v1/pools/pool1/free", None).await;
        assert_eq!(body, json!({ "pool": "pool1", "free": 1 }));

        let (_, body) = call(&app, Method::POST, "/app/v1/pools/pool1/allocations", None).await;
        assert_eq!(body, json!({ "id": 2 }));

        let (_, body) = call(&app, Method::DELETE, "/app/v1/pools/pool1", None).await;
        assert_eq!(body, json!({ "deleted": true }));

        let (status, body) = call(&app, Method::GET, "/app/v1/pools/pool1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "configuration_error");
    }

    #[tokio::test]
    async fn invalid_pool_configuration_is_rejected() {
        let app = app(&MemoryStore::new());
        let config = json!({ "min": 5, "max": 1, "strategy": { "kind": "sequential" } });
        let (status, body) = call(&app, Method::PUT, "/app/v1/pools/bad", Some(config)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "configuration_error");
    }

    #[tokio::test]
    async fn chunk_allocations() {
        let app = app(&MemoryStore::new());
        let config = json!({
            "min": 0,
            "max": 99,
            "strategy": { "kind": "chunk", "retry_limit": 64, "chunk_size": 10 }
        });
        call(&app, Method::PUT, "/app/v1/pools/blocks", Some(config)).await;

        let (status, body) =
            call(&app, Method::POST, "/app/v1/pools/blocks/allocations", None).await;
        assert_eq!(status, StatusCode::OK);
        let chunk = &body["chunk"];
        let lower = chunk["lower"].as_i64().unwrap();
        assert_eq!(chunk["upper"].as_i64().unwrap(), lower + 9);
        assert_eq!(chunk["id"].as_i64().unwrap(), lower / 10);
    }

    #[tokio::test]
    async fn integer_resources() {
        let app = app(&MemoryStore::new());
        let request = json!({ "min": 10, "max": 19 });
        let (status, _) =
            call(&app, Method::PUT, "/app/v1/integer-resource/ports", Some(request)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, Method::POST, "/app/v1/integer-resource/ports", None).await;
        assert_eq!(body, json!({ "pool": "ports", "ids": [10] }));

        let (_, body) = call(
            &app,
            Method::POST,
            "/app/v1/integer-resource/ports?number=3",
            None,
        )
        .await;
        assert_eq!(body, json!({ "pool": "ports", "ids": [11, 12, 13] }));

        let (status, _) =
            call(&app, Method::DELETE, "/app/v1/integer-resource/ports/11", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, Method::POST, "/app/v1/integer-resource/ports", None).await;
        assert_eq!(body, json!({ "pool": "ports", "ids": [11] }));
    }

    #[tokio::test]
    async fn bulk_limits() {
        let app = app(&MemoryStore::new());
        call(
            &app,
            Method::PUT,
            "/app/v1/integer-resource/ports",
            Some(json!({ "min": 0, "max": 99 })),
        )
        .await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/app/v1/integer-resource/ports?number=17",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_request");

        let (status, body) = call(
            &app,
            Method::POST,
            "/app/v1/integer-resource/ports?number=0",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn ipv4_resources() {
        let app = app(&MemoryStore::new());
        let request = json!({ "range": "10.0.0.0/29" });
        let (status, _) =
            call(&app, Method::PUT, "/app/v1/ipv4-resource/lan", Some(request)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) =
            call(&app, Method::POST, "/app/v1/ipv4-resource/lan?number=2", None).await;
        assert_eq!(
            body,
            json!({ "pool": "lan", "addresses": ["10.0.0.1", "10.0.0.2"] })
        );

        let (status, _) =
            call(&app, Method::DELETE, "/app/v1/ipv4-resource/lan/10.0.0.1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) =
            call(&app, Method::DELETE, "/app/v1/ipv4-resource/lan/not-an-ip", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");

        // Six usable addresses, one still taken.
        let (status, body) =
            call(&app, Method::POST, "/app/v1/ipv4-resource/lan?number=6", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "pool_exhausted");
    }

    #[tokio::test]
    async fn unique_identities() {
        let app = app(&MemoryStore::new());
        for expected in 1..=3 {
            let (_, body) = call(&app, Method::POST, "/app/v1/unique-identity/orders", None).await;
            assert_eq!(body, json!({ "pool": "orders", "id": expected }));
        }

        let (_, body) = call(
            &app,
            Method::POST,
            "/app/v1/unique-identity-range/tickets?min=100&max=101",
            None,
        )
        .await;
        assert_eq!(body["id"], 100);
        call(
            &app,
            Method::POST,
            "/app/v1/unique-identity-range/tickets?min=100&max=101",
            None,
        )
        .await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/app/v1/unique-identity-range/tickets?min=100&max=101",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "pool_exhausted");

        let (_, body) = call(&app, Method::DELETE, "/app/v1/unique-identity/orders", None).await;
        assert_eq!(body, json!({ "deleted": true }));
        let (_, body) = call(&app, Method::POST, "/app/v1/unique-identity/orders", None).await;
        assert_eq!(body["id"], 1);
    }

    #[tokio::test]
    async fn store_outage_is_service_unavailable() {
        let store = MemoryStore::new();
        let app = app(&store);
        store.set_available(false);

        let (status, body) =
            call(&app, Method::POST, "/app/v1/unique-identity/orders", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "store_unavailable");
    }
}
