use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::{header, Method, Request, Response, StatusCode};
use serde_json::Value;

use tfstate_backend::auth::{AuthPolicy, BasicAuth};
use tfstate_backend::engine::StateEngine;
use tfstate_backend::http::StateService;
use tfstate_backend::lock::LockInfo;
use tfstate_backend::metrics::SharedMetrics;
use tfstate_backend::store::{BlobStore, FjallStore, ListPage, MemoryStore, StoreError, StoreOp};

const TEST_STATE: &str =
    r#"{"version":4,"terraform_version":"1.2.3","serial":1,"lineage":"test-lineage"}"#;

fn service_with(store: Arc<dyn BlobStore>, policy: AuthPolicy) -> StateService {
    StateService::new(StateEngine::new(store, Arc::new(policy), SharedMetrics::new()))
}

fn memory_service(policy: AuthPolicy) -> StateService {
    service_with(Arc::new(MemoryStore::new()), policy)
}

fn request(method: &str, uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::from_bytes(method.as_bytes()).unwrap())
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

async fn send(service: &StateService, req: Request<Full<Bytes>>) -> (StatusCode, Bytes) {
    let resp: Response<Full<Bytes>> = service.handle_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn lock_body(id: &str) -> Bytes {
    Bytes::from(LockInfo::new(id).to_vec().unwrap())
}

async fn listing_counts(service: &StateService) -> (usize, usize) {
    let (status, body) = send(service, request("GET", "/states", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);
    let listing: Value = serde_json::from_slice(&body).unwrap();
    (
        listing["states"].as_array().unwrap().len(),
        listing["locks"].as_array().unwrap().len(),
    )
}

async fn run_protocol_sequence(service: StateService) {
    assert_eq!(listing_counts(&service).await, (0, 0));

    let (status, body) = send(&service, request("POST", "/states/test", TEST_STATE)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (status, body) = send(&service, request("GET", "/states/test", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(TEST_STATE.as_bytes()));

    // same state through its canonical name
    let (status, body) = send(
        &service,
        request("GET", "/states/test.tfstate", Bytes::new()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(TEST_STATE.as_bytes()));

    let (status, body) = send(&service, request("UNLOCK", "/states/test", lock_body("test"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, "attempting to unlock but resource not locked");

    let (status, body) = send(&service, request("LOCK", "/states/test", lock_body("test"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, lock_body("test"));

    let (status, body) = send(&service, request("LOCK", "/states/test", lock_body("invalid"))).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body, lock_body("test"));

    assert_eq!(listing_counts(&service).await, (1, 1));

    let (status, body) = send(&service, request("UNLOCK", "/states/test", lock_body("other"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let holder: LockInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(holder.id, "test");

    let (status, body) = send(&service, request("UNLOCK", "/states/test", lock_body("test"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, lock_body("test"));

    let (status, _) = send(&service, request("DELETE", "/states/test", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&service, request("GET", "/states/test", Bytes::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(listing_counts(&service).await, (0, 0));
}

#[tokio::test]
async fn test_protocol_sequence_memory() {
    run_protocol_sequence(memory_service(AuthPolicy::Allow)).await;
}

#[tokio::test]
async fn test_protocol_sequence_fjall() {
    let dir = tempfile::tempdir().unwrap();
    let store = FjallStore::new(dir.path().to_path_buf(), None).unwrap();
    run_protocol_sequence(service_with(Arc::new(store), AuthPolicy::Allow)).await;
}

#[tokio::test]
async fn test_listing_entries() {
    let service = memory_service(AuthPolicy::Allow);
    send(&service, request("PUT", "/states/s1", "abc")).await;
    send(&service, request("LOCK", "/states/s1", lock_body("l1"))).await;

    let (_, body) = send(&service, request("GET", "/states/", Bytes::new())).await;
    let listing: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["states"][0]["id"], "states/s1.tfstate");
    assert_eq!(listing["states"][0]["size"], 3);
    assert!(listing["states"][0]["uploaded"].as_str().unwrap().ends_with('Z'));
    assert_eq!(listing["locks"][0]["id"], "locks/s1.tfstate");
}

#[tokio::test]
async fn test_force_unlock_with_empty_body() {
    let service = memory_service(AuthPolicy::Allow);

    let (status, body) = send(&service, request("UNLOCK", "/states/net", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    send(&service, request("LOCK", "/states/net", lock_body("A"))).await;
    let (status, _) = send(&service, request("UNLOCK", "/states/net", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&service, request("LOCK", "/states/net", lock_body("B"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_unlock_body() {
    let service = memory_service(AuthPolicy::Allow);
    send(&service, request("LOCK", "/states/net", lock_body("A"))).await;

    let (status, _) = send(&service, request("UNLOCK", "/states/net", "{oops")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_missing_state() {
    let service = memory_service(AuthPolicy::Allow);
    let (status, _) = send(&service, request("DELETE", "/states/ghost", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_routes() {
    let service = memory_service(AuthPolicy::Allow);
    for (method, uri) in [
        ("GET", "/"),
        ("GET", "/states/-bad"),
        ("GET", "/states/a/b"),
        ("PATCH", "/states/a"),
        ("POST", "/states"),
    ] {
        let (status, _) = send(&service, request(method, uri, Bytes::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
    }
}

#[tokio::test]
async fn test_health_skips_auth() {
    let service = memory_service(AuthPolicy::Deny);
    let (status, body) = send(&service, request("GET", "/health", Bytes::new())).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_deny_all_rejects_everything() {
    let store = Arc::new(MemoryStore::new());
    let service = service_with(store.clone(), AuthPolicy::Deny);

    for (method, uri, body) in [
        ("GET", "/states", Bytes::new()),
        ("GET", "/states/net", Bytes::new()),
        ("POST", "/states/net", Bytes::from_static(b"{}")),
        ("DELETE", "/states/net", Bytes::new()),
        ("LOCK", "/states/net", lock_body("A")),
        ("UNLOCK", "/states/net", lock_body("A")),
        ("UNLOCK", "/states/net", Bytes::new()),
    ] {
        let (status, body) = send(&service, request(method, uri, body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(body, "Unauthorized");
    }
    assert!(store.is_empty());
}

fn basic(user: &str, pass: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    format!("Basic {encoded}")
}

#[tokio::test]
async fn test_basic_auth() {
    let policy = AuthPolicy::Basic(BasicAuth::new("terraform".into(), "s3cret".into()));
    let service = memory_service(policy);

    let resp = service
        .handle_request(request("GET", "/states", Bytes::new()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"tfstate\""
    );

    let mut req = request("POST", "/states/net", TEST_STATE);
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic("terraform", "wrong").parse().unwrap(),
    );
    let (status, body) = send(&service, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Unauthorized");

    let mut req = request("POST", "/states/net", TEST_STATE);
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic("terraform", "s3cret").parse().unwrap(),
    );
    let (status, _) = send(&service, req).await;
    assert_eq!(status, StatusCode::OK);

    let mut req = request("GET", "/states/net", Bytes::new());
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic("terraform", "s3cret").parse().unwrap(),
    );
    let (status, body) = send(&service, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, TEST_STATE);
}

/// Request body that fails on the first read, like a client that hangs up.
struct BrokenBody;

impl Body for BrokenBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(std::io::Error::other("connection reset"))))
    }
}

fn broken_request(method: &str, uri: &str) -> Request<BrokenBody> {
    Request::builder()
        .method(Method::from_bytes(method.as_bytes()).unwrap())
        .uri(uri)
        .body(BrokenBody)
        .unwrap()
}

#[tokio::test]
async fn test_deny_all_rejects_before_reading_body() {
    let service = memory_service(AuthPolicy::Deny);
    for method in ["POST", "PUT", "LOCK", "UNLOCK"] {
        let resp = service
            .handle_request(broken_request(method, "/states/net"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{method}");
    }

    let big = Bytes::from(vec![b'x'; 64]);
    let service = memory_service(AuthPolicy::Deny).with_max_body_size(8);
    let (status, _) = send(&service, request("POST", "/states/net", big)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unreadable_body_is_bad_request() {
    let service = memory_service(AuthPolicy::Allow);
    let resp = service
        .handle_request(broken_request("POST", "/states/net"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_body_size_limit() {
    let store = Arc::new(MemoryStore::new());
    let service = service_with(store.clone(), AuthPolicy::Allow).with_max_body_size(16);

    let (status, _) = send(&service, request("POST", "/states/net", vec![b'x'; 17])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(store.is_empty());

    let (status, _) = send(&service, request("POST", "/states/net", vec![b'x'; 16])).await;
    assert_eq!(status, StatusCode::OK);
}

/// Store whose every call fails.
#[derive(Debug)]
struct BrokenStore;

fn io_error(op: StoreOp, key: &str) -> StoreError {
    StoreError::new(op, key, std::io::Error::other("disk unavailable"))
}

#[async_trait]
impl BlobStore for BrokenStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(io_error(StoreOp::Get, key))
    }

    async fn put(&self, key: &str, _data: Bytes) -> Result<(), StoreError> {
        Err(io_error(StoreOp::Put, key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Err(io_error(StoreOp::Delete, key))
    }

    async fn list(&self, prefix: &str, _limit: usize) -> Result<ListPage, StoreError> {
        Err(io_error(StoreOp::List, prefix))
    }
}

#[tokio::test]
async fn test_storage_failure_is_empty_500() {
    let service = service_with(Arc::new(BrokenStore), AuthPolicy::Allow);
    for (method, uri, body) in [
        ("GET", "/states", Bytes::new()),
        ("GET", "/states/net", Bytes::new()),
        ("POST", "/states/net", Bytes::from_static(TEST_STATE.as_bytes())),
        ("DELETE", "/states/net", Bytes::new()),
        ("LOCK", "/states/net", lock_body("A")),
        ("UNLOCK", "/states/net", lock_body("A")),
        ("UNLOCK", "/states/net", Bytes::new()),
    ] {
        let (status, body) = send(&service, request(method, uri, body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{method} {uri}");
        assert!(body.is_empty(), "{method} {uri}");
    }
}
