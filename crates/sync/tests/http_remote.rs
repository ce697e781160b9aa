use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::Json;
use serde_json::{Value, json};

use stockroom_core::{ServerId, TempId};
use stockroom_inventory::{CATEGORIES, PRODUCTS};
use stockroom_sync::guard::IdempotencyToken;
use stockroom_sync::record::Fields;
use stockroom_sync::{ErrorCategory, HttpRemote, RemoteService};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let api = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/products", post(create_product).get(list_products))
            .route("/products/:id", put(update_product).delete(delete_product))
            .route("/categories", post(reject_category));
        let app = Router::new().nest("/api", api);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/api"),
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn header(headers: &HeaderMap, name: &str) -> Value {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| json!(v))
        .unwrap_or(Value::Null)
}

// Echoes what the client sent so the test can inspect it.
async fn create_product(
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    body["id"] = json!("p-1");
    body["idempotencyKey"] = header(&headers, "idempotency-key");
    body["authorization"] = header(&headers, "authorization");
    (StatusCode::CREATED, Json(json!({"success": true, "data": body})))
}

async fn list_products() -> Json<Value> {
    Json(json!({
        "data": [
            {"id": "p-1", "name": "Widget"},
            {"id": "p-2", "name": "Gadget"}
        ]
    }))
}

async fn update_product(Path(id): Path<String>) -> StatusCode {
    if id == "missing" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn delete_product(Path(_id): Path<String>) -> StatusCode {
    StatusCode::CONFLICT
}

async fn reject_category() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": "name is required"})),
    )
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("object expected, got {other}"),
    }
}

#[tokio::test]
async fn client_speaks_the_rest_contract() {
    let server = TestServer::spawn().await;
    let registry = stockroom_inventory::registry().unwrap();
    let products = registry.descriptor(PRODUCTS).unwrap();
    let categories = registry.descriptor(CATEGORIES).unwrap();

    let remote = HttpRemote::new(server.base_url.clone(), Duration::from_secs(5))
        .unwrap()
        .with_token("secret");
    assert!(remote.probe().await);

    let payload = fields(json!({"name": "Widget"}));
    let token = IdempotencyToken::derive(&TempId::new(), chrono::Utc::now(), &payload);
    let created = remote.create(products, &payload, &token).await.unwrap();
    assert_eq!(created["id"], json!("p-1"));
    assert_eq!(created["name"], json!("Widget"));
    assert_eq!(created["idempotencyKey"], json!(token.to_string()));
    assert_eq!(created["authorization"], json!("Bearer secret"));

    let listed = remote.list(products).await.unwrap();
    assert_eq!(listed.len(), 2);

    remote
        .update(products, &ServerId::new("p-1"), &fields(json!({"name": "W"})))
        .await
        .unwrap();
    let err = remote
        .update(products, &ServerId::new("missing"), &fields(json!({"name": "W"})))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::NotFound);

    let err = remote.delete(products, &ServerId::new("p-1")).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Conflict);

    let err = remote
        .create(categories, &fields(json!({"name": ""})), &token)
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Validation);
    assert!(err.message.contains("name is required"));
}
