use std::{sync::Arc, time::Instant};

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrics::histogram;
use metrics_exporter_prometheus::PrometheusHandle;

use school_fees_blob::BlobStore;
use school_fees_storage::Database;

use crate::auth::TokenValidator;
use crate::events::ChangeHub;
use crate::{dashboard, events, fees, payments, telemetry, uploads};

/// Multipart framing on top of the receipt bytes.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    blobs: Arc<dyn BlobStore>,
    changes: ChangeHub,
    token_validator: TokenValidator,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    timezone: Tz,
    receipt_max_bytes: u64,
    events_heartbeat_secs: u64,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        blobs: Arc<dyn BlobStore>,
        token_secret: &[u8],
        timezone: Tz,
        receipt_max_bytes: u64,
        events_heartbeat_secs: u64,
    ) -> Self {
        Self {
            metrics,
            storage,
            blobs,
            changes: ChangeHub::new(),
            token_validator: TokenValidator::new(token_secret),
            clock: Arc::new(Utc::now),
            timezone,
            receipt_max_bytes,
            events_heartbeat_secs,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_replay_limit(mut self, replay_limit: i64) -> Self {
        self.changes = ChangeHub::new().with_replay_limit(replay_limit);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn changes(&self) -> &ChangeHub {
        &self.changes
    }

    pub fn token_validator(&self) -> &TokenValidator {
        &self.token_validator
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Current calendar day at the school.
    pub fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.timezone).date_naive()
    }

    pub fn receipt_max_bytes(&self) -> u64 {
        self.receipt_max_bytes
    }

    pub fn events_heartbeat(&self) -> u64 {
        self.events_heartbeat_secs
    }
}

pub fn app_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.receipt_max_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/fees", get(fees::list))
        .route("/fees/:id", get(fees::detail))
        .route("/payments", get(payments::list).post(payments::submit))
        .route("/payments/:id", get(payments::detail))
        .route("/payments/:id/verify", patch(payments::verify))
        .route(
            "/uploads",
            get(uploads::list)
                .post(uploads::upload)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/uploads/*pathname", delete(uploads::remove))
        .route("/dashboard/status", get(dashboard::status))
        .route("/events", get(events::stream))
        .route_layer(middleware::from_fn(track_duration))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn track_duration(matched: Option<MatchedPath>, request: Request, next: Next) -> Response {
    let route = matched
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    histogram!("api_request_duration_seconds", "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use rust_decimal::Decimal;
    use school_fees_blob::LocalBlobStore;
    use school_fees_storage::{NewFee, NewStudent};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::auth::{test_tokens, Role};

    pub const MAX_RECEIPT: u64 = 1024;

    pub struct TestApp {
        pub state: AppState,
        pub router: Router,
        pub blob_dir: tempfile::TempDir,
    }

    pub fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    pub async fn setup() -> TestApp {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let blob_dir = tempfile::tempdir().expect("tempdir");
        let blobs = LocalBlobStore::new(
            blob_dir.path(),
            &url::Url::parse("http://blobs.test/files").expect("url"),
        );

        let state = AppState::new(
            metrics,
            database,
            Arc::new(blobs),
            test_tokens::SECRET,
            chrono_tz::Asia::Manila,
            MAX_RECEIPT,
            25,
        )
        .with_clock(Arc::new(fixed_now));

        TestApp {
            router: app_router(state.clone()),
            state,
            blob_dir,
        }
    }

    pub fn token(role: Role, student_id: Option<i64>) -> String {
        test_tokens::mint(role, student_id, fixed_now().timestamp() + 3600)
    }

    pub fn staff() -> String {
        token(Role::Staff, None)
    }

    /// Inserts a student with one outstanding fee; returns `(student_id, fee_id)`.
    pub async fn seed_fee(state: &AppState, number: &str, amount: Decimal) -> (i64, i64) {
        let student = state
            .storage()
            .students()
            .insert(&NewStudent {
                student_number: number,
                full_name: "Test Student",
                grade_level: None,
                created_at: fixed_now(),
            })
            .await
            .expect("student");
        let fee = state
            .storage()
            .fees()
            .insert(&NewFee {
                student_id: student.id,
                fee_type: "tuition",
                amount,
                due_date: NaiveDate::from_ymd_opt(2024, 7, 1).expect("date"),
                created_at: fixed_now(),
            })
            .await
            .expect("fee");
        (student.id, fee.id)
    }

    pub async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };

        let response = router
            .clone()
            .oneshot(request)
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }
}
