use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::error::SolverError;
use crate::scraper::{CookieData, Solver, USER_AGENT};

#[derive(Default)]
pub struct Stats {
    pub requests: AtomicU64,
    pub success: AtomicU64,
    pub errors: AtomicU64,
}

pub struct AppState {
    pub solver: Arc<dyn Solver>,
    pub started: Instant,
    pub stats: Stats,
    pub default_max_timeout: Duration,
}

impl AppState {
    pub fn new(solver: Arc<dyn Solver>, default_max_timeout: Duration) -> Self {
        AppState {
            solver,
            started: Instant::now(),
            stats: Stats::default(),
            default_max_timeout,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1", post(solve))
        .route("/health", get(health))
        .route("/", get(index))
        .with_state(state)
}

#[derive(Deserialize, ToSchema)]
pub struct SolveRequest {
    pub url: Option<String>,
    #[serde(rename = "maxTimeout")]
    pub max_timeout: Option<u64>,
    // Accepted for API compatibility, currently ignored.
    #[allow(dead_code)]
    #[schema(value_type = Option<Object>)]
    pub session: Option<serde_json::Value>,
    #[allow(dead_code)]
    pub cmd: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub url: String,
    pub status: u16,
    pub response: String,
    pub cookies: Vec<CookieData>,
    pub user_agent: String,
}

#[derive(Serialize, ToSchema)]
pub struct SolveResponse {
    pub status: String,
    pub message: String,
    pub solution: Option<Solution>,
    #[serde(rename = "startTimestamp")]
    pub start_timestamp: i64,
    #[serde(rename = "endTimestamp")]
    pub end_timestamp: i64,
    pub version: String,
    #[serde(rename = "hasSSd")]
    pub has_ssd: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
    pub solution: Option<Solution>,
}

/// Solve one URL: lease a pooled browser, navigate, wait the
/// challenge out, return HTML + cookies. The scrape races a
/// wall-clock timeout; on expiry only the response returns early,
/// the in-flight browser work still finishes and releases its lease.
#[utoipa::path(
    post,
    path = "/v1",
    request_body = SolveRequest,
    responses(
        (status = 200, description = "Challenge solved", body = SolveResponse),
        (status = 400, description = "Missing url", body = ErrorResponse),
        (status = 500, description = "Scrape failed or timed out", body = ErrorResponse)
    ),
    tag = "solver"
)]
pub async fn solve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SolveRequest>,
) -> Response {
    let start_ts = Utc::now().timestamp_millis();
    state.stats.requests.fetch_add(1, Ordering::Relaxed);

    let url = match req.url.as_deref().filter(|u| !u.is_empty()) {
        Some(u) => u.to_string(),
        None => {
            state.stats.errors.fetch_add(1, Ordering::Relaxed);
            return error_response(StatusCode::BAD_REQUEST, &SolverError::MissingUrl);
        }
    };

    let max_timeout = req
        .max_timeout
        .map(Duration::from_millis)
        .unwrap_or(state.default_max_timeout);

    debug!("📨 Request: {}", url.chars().take(80).collect::<String>());

    let solver = state.solver.clone();
    let target = url.clone();
    let task = tokio::task::spawn_blocking(move || solver.solve(&target));

    let outcome = match tokio::time::timeout(max_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SolverError::Browser(join_err.to_string())),
        Err(_) => Err(SolverError::Timeout),
    };

    match outcome {
        Ok(payload) => {
            state.stats.success.fetch_add(1, Ordering::Relaxed);
            let end_ts = Utc::now().timestamp_millis();
            debug!("✅ Success in {}ms", payload.elapsed_ms);
            (
                StatusCode::OK,
                Json(SolveResponse {
                    status: "ok".to_string(),
                    message: "Success".to_string(),
                    solution: Some(Solution {
                        url: payload.url,
                        status: 200,
                        response: payload.html,
                        cookies: payload.cookies,
                        user_agent: USER_AGENT.to_string(),
                    }),
                    start_timestamp: start_ts,
                    end_timestamp: end_ts,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    has_ssd: payload.has_ssd,
                }),
            )
                .into_response()
        }
        Err(e) => {
            state.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!("❌ Request failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

fn error_response(code: StatusCode, err: &SolverError) -> Response {
    (
        code,
        Json(ErrorResponse {
            status: "error".to_string(),
            message: err.to_string(),
            solution: None,
        }),
    )
        .into_response()
}

#[derive(Serialize, ToSchema)]
pub struct MemoryInfo {
    pub used: String,
    pub total: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub success: u64,
    pub errors: u64,
    pub recycles: u64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime: String,
    pub browsers: usize,
    pub active_browsers: usize,
    pub memory: MemoryInfo,
    pub stats: StatsSnapshot,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "solver"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (used_mb, total_mb) = memory_usage_mb();
    let pool = state.solver.occupancy();

    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime: format!("{}s", state.started.elapsed().as_secs()),
        browsers: pool.browsers,
        active_browsers: pool.active,
        memory: MemoryInfo {
            used: format!("{}MB", used_mb),
            total: format!("{}MB", total_mb),
        },
        stats: StatsSnapshot {
            total_requests: state.stats.requests.load(Ordering::Relaxed),
            success: state.stats.success.load(Ordering::Relaxed),
            errors: state.stats.errors.load(Ordering::Relaxed),
            recycles: state.solver.recycle_count(),
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let (used_mb, _) = memory_usage_mb();
    let pool = state.solver.occupancy();
    let requests = state.stats.requests.load(Ordering::Relaxed);
    let success = state.stats.success.load(Ordering::Relaxed);
    let success_rate = if requests > 0 {
        success * 100 / requests
    } else {
        0
    };

    Html(format!(
        "<h1>⚡ Silent Scraper v{}</h1>\
         <p><strong>Status:</strong> Running</p>\
         <p><strong>Memory:</strong> {}MB</p>\
         <p><strong>Browsers:</strong> {} ({} busy)</p>\
         <p><strong>Total Requests:</strong> {}</p>\
         <p><strong>Success Rate:</strong> {}%</p>",
        env!("CARGO_PKG_VERSION"),
        used_mb,
        pool.browsers,
        pool.active,
        requests,
        success_rate,
    ))
}

/// Process RSS and total system memory, in megabytes.
pub fn memory_usage_mb() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() / 1024 / 1024;
    let used = match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory() / 1024 / 1024).unwrap_or(0)
        }
        Err(_) => 0,
    };
    (used, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStatus;
    use crate::scraper::ScrapePayload;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct StubSolver {
        result: Mutex<Option<Result<ScrapePayload, SolverError>>>,
        calls: AtomicU64,
        delay: Duration,
    }

    impl StubSolver {
        fn with(result: Result<ScrapePayload, SolverError>) -> Arc<Self> {
            Arc::new(StubSolver {
                result: Mutex::new(Some(result)),
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
            })
        }
    }

    impl Solver for StubSolver {
        fn solve(&self, _url: &str) -> Result<ScrapePayload, SolverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(SolverError::Browser("stub exhausted".into())))
        }

        fn occupancy(&self) -> PoolStatus {
            PoolStatus {
                browsers: 2,
                active: 1,
            }
        }

        fn recycle_count(&self) -> u64 {
            3
        }
    }

    fn ok_payload() -> ScrapePayload {
        ScrapePayload {
            url: "https://example.test/catalog?ssd=1".to_string(),
            html: "<html></html>".to_string(),
            cookies: vec![],
            has_ssd: true,
            elapsed_ms: 5,
        }
    }

    fn app(solver: Arc<StubSolver>) -> Router {
        router(Arc::new(AppState::new(solver, Duration::from_secs(25))))
    }

    async fn post_v1(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn missing_url_is_rejected_without_leasing() {
        let solver = StubSolver::with(Ok(ok_payload()));
        let (status, body) = post_v1(app(solver.clone()), "{}").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "URL is required");
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_url_is_rejected_without_leasing() {
        let solver = StubSolver::with(Ok(ok_payload()));
        let (status, _) = post_v1(app(solver.clone()), r#"{"url":""}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_scrape_fills_the_ok_envelope() {
        let solver = StubSolver::with(Ok(ok_payload()));
        let (status, body) =
            post_v1(app(solver), r#"{"url":"https://example.test/catalog"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Success");
        assert_eq!(body["solution"]["response"], "<html></html>");
        assert_eq!(body["solution"]["status"], 200);
        assert_eq!(body["hasSSd"], true);
        assert!(body["startTimestamp"].as_i64().unwrap() <= body["endTimestamp"].as_i64().unwrap());
    }

    #[tokio::test]
    async fn navigation_failure_maps_to_500_envelope() {
        let solver = StubSolver::with(Err(SolverError::Navigation(
            "net::ERR_NAME_NOT_RESOLVED".into(),
        )));
        let (status, body) = post_v1(app(solver), r#"{"url":"https://example.test/"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("ERR_NAME_NOT_RESOLVED"));
        assert!(body["solution"].is_null());
    }

    #[tokio::test]
    async fn pool_exhaustion_maps_to_500_envelope() {
        let solver = StubSolver::with(Err(SolverError::PoolExhausted));
        let (status, body) = post_v1(app(solver), r#"{"url":"https://example.test/"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "No browsers available - all busy");
    }

    #[tokio::test]
    async fn slow_scrape_loses_the_timeout_race() {
        let solver = Arc::new(StubSolver {
            result: Mutex::new(Some(Ok(ok_payload()))),
            calls: AtomicU64::new(0),
            delay: Duration::from_millis(500),
        });
        let (status, body) = post_v1(
            app(solver),
            r#"{"url":"https://example.test/","maxTimeout":20}"#,
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Timeout");
    }

    #[tokio::test]
    async fn health_reports_pool_occupancy_and_counters() {
        let solver = StubSolver::with(Ok(ok_payload()));
        let app = app(solver);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["browsers"], 2);
        assert_eq!(body["activeBrowsers"], 1);
        assert_eq!(body["stats"]["recycles"], 3);
    }

    #[tokio::test]
    async fn index_renders_a_status_page() {
        let solver = StubSolver::with(Ok(ok_payload()));
        let app = app(solver);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("Silent Scraper"));
        assert!(page.contains("Browsers:"));
    }
}
