//! End-to-end behaviour of the HTTP front door with real Wasmtime guests

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

use wasmgate::config::Config;
use wasmgate::error::{Error, Result};
use wasmgate::model::{Action, Method, ModuleConfig, Project};
use wasmgate::repository::{ActionRepository, InMemoryRepository, ProjectRepository};
use wasmgate::sandbox::WasmtimeRuntime;
use wasmgate::server::{build_router, AppState, OWNER_HEADER};
use wasmgate::storage::{MemoryStorage, ModuleStorage};

const PLATFORM_HOST: &str = "example.com";

/// Guest that writes `body` as its response and returns `exit_code`
fn respond_wat(body: &str, exit_code: i32) -> String {
    format!(
        r#"(module
            (import "wasmgate" "output_write" (func $output_write (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "{data}")
            (func (export "handler") (result i32)
                (call $output_write (i32.const 0) (i32.const {len}))
                (i32.const {exit_code})))"#,
        data = body.replace('\\', "\\\\").replace('"', "\\\""),
        len = body.len(),
        exit_code = exit_code,
    )
}

/// In-memory repository whose writes can be made to fail
#[derive(Default)]
struct FlakyRepository {
    inner: InMemoryRepository,
    fail_module_path: AtomicBool,
    fail_project_delete: AtomicBool,
}

fn refuse(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(Error::Database(sqlx::Error::PoolTimedOut));
    }
    Ok(())
}

#[async_trait]
impl ProjectRepository for FlakyRepository {
    async fn create(&self, project: &Project) -> Result<()> {
        ProjectRepository::create(&self.inner, project).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        ProjectRepository::get_by_id(&self.inner, id).await
    }

    async fn get_by_owner_id(&self, owner_id: Uuid) -> Result<Vec<Project>> {
        self.inner.get_by_owner_id(owner_id).await
    }

    async fn get_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>> {
        self.inner.get_by_subdomain(subdomain).await
    }

    async fn update_name(&self, id: Uuid, name: &str) -> Result<()> {
        self.inner.update_name(id, name).await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        refuse(&self.fail_project_delete)?;
        ProjectRepository::delete_by_id(&self.inner, id).await
    }
}

#[async_trait]
impl ActionRepository for FlakyRepository {
    async fn create(&self, action: &Action) -> Result<()> {
        ActionRepository::create(&self.inner, action).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>> {
        ActionRepository::get_by_id(&self.inner, id).await
    }

    async fn get_by_project_id(&self, project_id: Uuid) -> Result<Vec<Action>> {
        self.inner.get_by_project_id(project_id).await
    }

    async fn count_by_project_id(&self, project_id: Uuid) -> Result<i64> {
        self.inner.count_by_project_id(project_id).await
    }

    async fn update_info(
        &self,
        id: Uuid,
        name: &str,
        path: &str,
        methods: &[Method],
        config: &ModuleConfig,
    ) -> Result<()> {
        self.inner.update_info(id, name, path, methods, config).await
    }

    async fn update_order(&self, ids: &[Uuid]) -> Result<()> {
        self.inner.update_order(ids).await
    }

    async fn update_module_path(&self, id: Uuid, module_path: &str) -> Result<()> {
        refuse(&self.fail_module_path)?;
        self.inner.update_module_path(id, module_path).await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        ActionRepository::delete_by_id(&self.inner, id).await
    }
}

/// Log output collected from a scoped subscriber
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    app: Router,
    repo: Arc<FlakyRepository>,
    storage: Arc<MemoryStorage>,
    owner: Uuid,
}

impl Harness {
    fn new() -> Self {
        let config = Config::default();
        let repo = Arc::new(FlakyRepository::default());
        let storage = Arc::new(MemoryStorage::new());
        let runtime = Arc::new(WasmtimeRuntime::new(&config.sandbox).unwrap());
        let state = AppState::new(&config, repo.clone(), repo.clone(), storage.clone(), runtime).unwrap();

        Harness {
            app: build_router(state, config.server.max_module_bytes),
            repo,
            storage,
            owner: Uuid::new_v4(),
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn api(&self, method: &str, uri: &str, body: Body) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", PLATFORM_HOST)
            .header(OWNER_HEADER, self.owner.to_string())
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        self.send(request).await
    }

    async fn create_project(&self, name: &str) -> Project {
        let body = serde_json::json!({ "name": name }).to_string();
        let response = self.api("POST", "/api/projects", Body::from(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        serde_json::from_slice(&read_body(response).await).unwrap()
    }

    async fn create_action(&self, project: &Project, path: &str, methods: &[&str]) -> Action {
        let body = serde_json::json!({ "name": "action", "path": path, "methods": methods });
        let response = self
            .api(
                "POST",
                &format!("/api/projects/{}/actions", project.id),
                Body::from(body.to_string()),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        serde_json::from_slice(&read_body(response).await).unwrap()
    }

    async fn upload(&self, action: &Action, module: impl Into<Body>) -> Response {
        self.api(
            "POST",
            &format!(
                "/api/projects/{}/actions/{}/module",
                action.project_id, action.id
            ),
            module.into(),
        )
        .await
    }

    async fn call(&self, host: &str, method: &str, path: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("host", host)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }
}

fn host_of(project: &Project) -> String {
    format!("{}.{}", project.subdomain, PLATFORM_HOST)
}

async fn read_body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_action_without_module_is_not_implemented() {
    let h = Harness::new();
    let project = h.create_project("Pending").await;
    h.create_action(&project, "/hello", &["GET"]).await;

    let response = h.call(&host_of(&project), "GET", "/hello").await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_guest_response_is_applied() {
    let h = Harness::new();
    let project = h.create_project("Demo").await;
    let action = h.create_action(&project, "/hello", &["GET"]).await;

    let wat = respond_wat(
        r#"{"statusCode":201,"headers":{"X-Test":["a","b"]},"body":"ok"}"#,
        0,
    );
    assert_eq!(h.upload(&action, wat).await.status(), StatusCode::OK);

    let response = h.call(&host_of(&project), "GET", "/hello").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let values: Vec<_> = response.headers().get_all("x-test").iter().collect();
    assert_eq!(values, vec!["a", "b"]);
    assert_eq!(read_body(response).await, b"ok");
}

#[tokio::test]
async fn test_second_call_uses_cached_module() {
    let h = Harness::new();
    let project = h.create_project("Cached").await;
    let action = h.create_action(&project, "/", &["GET"]).await;
    h.upload(&action, respond_wat(r#"{"body":"hi"}"#, 0)).await;

    for _ in 0..3 {
        let response = h.call(&host_of(&project), "GET", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.storage.download_count(), 1);
}

#[tokio::test]
async fn test_unknown_subdomain_is_not_found() {
    let h = Harness::new();
    let response = h.call("nobody-zzzz.example.com", "GET", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_replaced_module_takes_effect() {
    let h = Harness::new();
    let project = h.create_project("Replace").await;
    let action = h.create_action(&project, "/v", &["GET"]).await;
    let host = host_of(&project);

    h.upload(&action, respond_wat(r#"{"statusCode":200,"body":"v1"}"#, 0)).await;
    let response = h.call(&host, "GET", "/v").await;
    assert_eq!(read_body(response).await, b"v1");

    h.upload(&action, respond_wat(r#"{"statusCode":202,"body":"v2"}"#, 0)).await;
    let response = h.call(&host, "GET", "/v").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(read_body(response).await, b"v2");
}

#[tokio::test]
async fn test_failed_replace_does_not_serve_old_module() {
    let h = Harness::new();
    let project = h.create_project("HalfReplace").await;
    let action = h.create_action(&project, "/v", &["GET"]).await;
    let host = host_of(&project);

    h.upload(&action, respond_wat(r#"{"body":"v1"}"#, 0)).await;
    assert_eq!(read_body(h.call(&host, "GET", "/v").await).await, b"v1");

    // The blob is overwritten before the record update fails
    h.repo.fail_module_path.store(true, Ordering::SeqCst);
    let response = h.upload(&action, respond_wat(r#"{"body":"v2"}"#, 0)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(read_body(h.call(&host, "GET", "/v").await).await, b"v2");
}

#[tokio::test]
async fn test_failing_guest_is_internal_error() {
    let h = Harness::new();
    let project = h.create_project("Broken").await;
    let action = h.create_action(&project, "/fail", &["POST"]).await;
    h.upload(&action, respond_wat("{}", 1)).await;

    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let response = h.call(&host_of(&project), "POST", "/fail").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(read_body(response).await.is_empty());

    let logs = logs.contents();
    assert!(logs.contains("Invocation failed"), "logs: {}", logs);
    assert!(logs.contains(&format!("action_id={}", action.id)), "logs: {}", logs);
    assert!(logs.contains("guest exited with code 1"), "logs: {}", logs);
}

#[tokio::test]
async fn test_method_and_path_matching() {
    let h = Harness::new();
    let project = h.create_project("Routes").await;
    let first = h.create_action(&project, "/users/:id", &["GET"]).await;
    let second = h.create_action(&project, "/users/me", &["GET", "DELETE"]).await;
    h.upload(&first, respond_wat(r#"{"body":"by id"}"#, 0)).await;
    h.upload(&second, respond_wat(r#"{"body":"me"}"#, 0)).await;
    let host = host_of(&project);

    // Earlier action wins on overlap
    let response = h.call(&host, "GET", "/users/me").await;
    assert_eq!(read_body(response).await, b"by id");

    let response = h.call(&host, "DELETE", "/Users/ME/").await;
    assert_eq!(read_body(response).await, b"me");

    let response = h.call(&host, "HEAD", "/users/me").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = h.call(&host, "GET", "/posts").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Swap the order and the other action wins
    let body = serde_json::json!({ "ids": [second.id, first.id] }).to_string();
    let response = h
        .api(
            "POST",
            &format!("/api/projects/{}/actions/order", project.id),
            Body::from(body),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = h.call(&host, "GET", "/users/me").await;
    assert_eq!(read_body(response).await, b"me");
}

#[tokio::test]
async fn test_non_subdomain_hosts_pass_through() {
    let h = Harness::new();
    let project = h.create_project("Health").await;
    let action = h.create_action(&project, "/health", &["GET"]).await;
    h.upload(&action, respond_wat(r#"{"statusCode":418}"#, 0)).await;

    for host in ["example.com", "a.b.example.com", "127.0.0.1:4251"] {
        let response = h.call(host, "GET", "/health").await;
        assert_eq!(response.status(), StatusCode::OK, "host {}", host);
    }

    let response = h.call(&host_of(&project), "GET", "/health").await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn test_upload_rejects_unusable_modules() {
    let h = Harness::new();
    let project = h.create_project("Uploads").await;
    let action = h.create_action(&project, "/", &["GET"]).await;

    let response = h.upload(&action, "not wasm at all").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h.upload(&action, r#"(module (func (export "main")))"#).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Still no module attached
    let response = h.call(&host_of(&project), "GET", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_projects_are_scoped_to_owner() {
    let h = Harness::new();
    let project = h.create_project("Private").await;

    let request = Request::builder()
        .uri(format!("/api/projects/{}", project.id))
        .header("host", PLATFORM_HOST)
        .header(OWNER_HEADER, Uuid::new_v4().to_string())
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/api/projects")
        .header("host", PLATFORM_HOST)
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let response = h.api("GET", "/api/projects", Body::empty()).await;
    let projects: Vec<Project> = serde_json::from_slice(&read_body(response).await).unwrap();
    assert_eq!(projects, vec![project]);
}

#[tokio::test]
async fn test_rename_keeps_subdomain() {
    let h = Harness::new();
    let project = h.create_project("Before").await;

    let body = serde_json::json!({ "name": "  After  " }).to_string();
    let response = h
        .api("PUT", &format!("/api/projects/{}", project.id), Body::from(body))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let renamed: Project = serde_json::from_slice(&read_body(response).await).unwrap();
    assert_eq!(renamed.name, "After");
    assert_eq!(renamed.subdomain, project.subdomain);

    let body = serde_json::json!({ "name": "no/slashes" }).to_string();
    let response = h
        .api("PUT", &format!("/api/projects/{}", project.id), Body::from(body))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_project_cascades() {
    let h = Harness::new();
    let project = h.create_project("Doomed").await;
    let action = h.create_action(&project, "/", &["GET"]).await;
    h.upload(&action, respond_wat(r#"{"body":"alive"}"#, 0)).await;
    let host = host_of(&project);
    assert_eq!(h.call(&host, "GET", "/").await.status(), StatusCode::OK);

    let response = h
        .api("DELETE", &format!("/api/projects/{}", project.id), Body::empty())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(h.call(&host, "GET", "/").await.status(), StatusCode::NOT_FOUND);
    let module_path = Action::module_path_for(h.owner, project.id, action.id);
    assert!(h.storage.download("modules", &module_path).await.is_err());
}

#[tokio::test]
async fn test_failed_project_delete_keeps_modules() {
    let h = Harness::new();
    let project = h.create_project("Sturdy").await;
    let action = h.create_action(&project, "/", &["GET"]).await;
    h.upload(&action, respond_wat(r#"{"body":"alive"}"#, 0)).await;

    h.repo.fail_project_delete.store(true, Ordering::SeqCst);
    let response = h
        .api("DELETE", &format!("/api/projects/{}", project.id), Body::empty())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = h.call(&host_of(&project), "GET", "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, b"alive");
}

#[tokio::test]
async fn test_delete_action_removes_route() {
    let h = Harness::new();
    let project = h.create_project("Shrink").await;
    let action = h.create_action(&project, "/gone", &["GET"]).await;
    h.upload(&action, respond_wat(r#"{"body":"here"}"#, 0)).await;
    let host = host_of(&project);
    assert_eq!(h.call(&host, "GET", "/gone").await.status(), StatusCode::OK);

    let response = h
        .api(
            "DELETE",
            &format!("/api/projects/{}/actions/{}", project.id, action.id),
            Body::empty(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.call(&host, "GET", "/gone").await.status(), StatusCode::NOT_FOUND);
}
