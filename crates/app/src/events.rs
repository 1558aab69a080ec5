use std::{
    convert::Infallible,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, warn};

use school_fees_core::{ChangeEvent, StudentId, Topic, RESYNC_EVENT};

use crate::auth::Actor;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const BROADCAST_BUFFER: usize = 256;
const REPLAY_LIMIT: i64 = 1000;

/// Fan-out of committed changes to connected subscribers.
#[derive(Clone)]
pub struct ChangeHub {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    clients: Arc<AtomicUsize>,
    replay_limit: i64,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            sender,
            clients: Arc::new(AtomicUsize::new(0)),
            replay_limit: REPLAY_LIMIT,
        }
    }

    #[cfg(test)]
    pub fn with_replay_limit(mut self, replay_limit: i64) -> Self {
        self.replay_limit = replay_limit;
        self
    }

    /// Most changes replayed to a reconnecting subscriber.
    pub fn replay_limit(&self) -> i64 {
        self.replay_limit
    }

    pub fn publish(&self, event: ChangeEvent) {
        counter!("change_events_total", "kind" => event.kind.as_str()).increment(1);
        debug!(
            stage = "events",
            version = event.version,
            kind = event.kind.as_str(),
            "broadcasting change"
        );
        // No receivers is not an error.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Registers a subscriber. Subscribe before reading the replay backlog so
    /// nothing committed in between is lost.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: BroadcastStream::new(self.sender.subscribe()),
            filter,
            guard: ClientGuard::new(self.clients.clone()),
        }
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub topics: Vec<Topic>,
    pub student_id: Option<StudentId>,
}

impl EventFilter {
    fn allows(&self, event: &ChangeEvent) -> bool {
        event.touches_any(&self.topics)
            && self
                .student_id
                .map(|id| id == event.scope.student_id)
                .unwrap_or(true)
    }
}

pub struct Subscription {
    receiver: BroadcastStream<Arc<ChangeEvent>>,
    filter: EventFilter,
    guard: ClientGuard,
}

impl Subscription {
    /// Emits `backlog` first, then live events newer than the backlog.
    ///
    /// A `truncated` backlog leaves a gap the live feed cannot fill, so the
    /// stream opens with a resync event telling the client to drop its cache.
    pub fn into_stream(self, backlog: Vec<ChangeEvent>, truncated: bool) -> EventStream {
        let backlog: Vec<ChangeEvent> = backlog
            .into_iter()
            .filter(|event| self.filter.allows(event))
            .collect();
        let replayed_up_to = backlog.last().map(|event| event.version).unwrap_or(0);

        let resync = truncated.then(|| {
            Ok::<_, Infallible>(Event::default()
                .event(RESYNC_EVENT)
                .data(format!("{{\"replayedUpTo\":{replayed_up_to}}}")))
        });
        let backlog_stream = tokio_stream::iter(resync)
            .chain(tokio_stream::iter(backlog).filter_map(|event| to_sse(&event)));

        let filter = self.filter;
        let live_stream = self.receiver.filter_map(move |result| match result {
            Ok(event) if event.version > replayed_up_to && filter.allows(&event) => {
                to_sse(&event)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(stage = "events", error = %err, "subscriber lagged, events dropped");
                None
            }
        });

        EventStream {
            inner: Box::pin(backlog_stream.chain(live_stream)),
            _guard: self.guard,
        }
    }
}

fn to_sse(event: &ChangeEvent) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Ok(Event::default()
            .id(event.version.to_string())
            .event(event.kind.as_str())
            .data(data))),
        Err(err) => {
            warn!(stage = "events", error = %err, "failed to serialize change");
            None
        }
    }
}

pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
    _guard: ClientGuard,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_next(cx)
    }
}

struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>) -> Self {
        let value = clients.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("events_clients").set(value as f64);
        Self { clients }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let value = self
            .clients
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        gauge!("events_clients").set(value as f64);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    topics: Option<String>,
    #[serde(default)]
    since_version: Option<u64>,
}

pub async fn stream(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<EventStream>, ProblemResponse> {
    let topics = parse_topics(query.topics.as_deref())?;
    let since_version = headers
        .get("Last-Event-ID")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .or(query.since_version);

    let filter = EventFilter {
        topics,
        student_id: actor.student_id,
    };
    let subscription = state.changes().subscribe(filter.clone());

    let mut backlog = match since_version {
        Some(version) => {
            state
                .storage()
                .activity_log()
                .list_since(version, filter.student_id, state.changes().replay_limit() + 1)
                .await?
        }
        None => Vec::new(),
    };
    let limit = usize::try_from(state.changes().replay_limit()).unwrap_or(usize::MAX);
    let truncated = backlog.len() > limit;
    if truncated {
        backlog.truncate(limit);
        warn!(
            stage = "events",
            subject = %actor.subject,
            since_version,
            "replay window exceeded, asking subscriber to resync"
        );
    }
    debug!(
        stage = "events",
        subject = %actor.subject,
        since_version,
        replayed = backlog.len(),
        "subscriber connected"
    );

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(state.events_heartbeat()))
        .text("heartbeat");

    Ok(Sse::new(subscription.into_stream(backlog, truncated)).keep_alive(keep_alive))
}

fn parse_topics(raw: Option<&str>) -> Result<Vec<Topic>, ProblemResponse> {
    let mut topics = Vec::new();
    for item in raw.unwrap_or_default().split(',') {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        let topic = trimmed
            .parse::<Topic>()
            .map_err(|err| ProblemResponse::bad_request("invalid_topic", err.to_string()))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    if topics.is_empty() {
        topics.extend(Topic::ALL);
    }
    Ok(topics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use http_body_util::BodyExt;
    use rust_decimal::Decimal;
    use school_fees_core::{ChangeKind, ChangeScope};
    use serde_json::json;
    use tokio::time;
    use tower::ServiceExt;

    use crate::auth::Role;
    use crate::router::test_support::*;

    fn event(version: u64, student_id: StudentId) -> ChangeEvent {
        ChangeEvent {
            version,
            kind: ChangeKind::PaymentSubmitted,
            scope: ChangeScope {
                payment_id: version as i64,
                fee_id: 1,
                student_id,
            },
            at: fixed_now(),
        }
    }

    async fn next_text(response: &mut axum::response::Response) -> String {
        let frame = time::timeout(Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");
        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        String::from_utf8(data.to_vec()).expect("utf-8")
    }

    #[test]
    fn topics_default_to_all_and_reject_unknown_names() {
        assert_eq!(parse_topics(None).expect("default"), Topic::ALL.to_vec());
        assert_eq!(
            parse_topics(Some("payments, payments")).expect("dedup"),
            vec![Topic::Payments]
        );
        assert!(parse_topics(Some("grades")).is_err());
    }

    #[tokio::test]
    async fn live_stream_skips_replayed_versions_and_other_students() {
        let hub = ChangeHub::new();
        let subscription = hub.subscribe(EventFilter {
            topics: Topic::ALL.to_vec(),
            student_id: Some(5),
        });
        let mut stream = subscription.into_stream(vec![event(3, 5), event(4, 6)], false);

        hub.publish(event(3, 5));
        hub.publish(event(5, 6));
        hub.publish(event(6, 5));

        let mut ids = Vec::new();
        for _ in 0..2 {
            let item = time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("event in time")
                .expect("stream open");
            ids.push(item.is_ok());
        }
        assert_eq!(ids, vec![true, true]);
        assert_eq!(hub.clients.load(Ordering::SeqCst), 1);
        drop(stream);
        assert_eq!(hub.clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submission_is_pushed_to_connected_staff() {
        let app = setup().await;
        let (student_id, fee_id) = seed_fee(&app.state, "S-1", Decimal::new(500, 0)).await;

        let request = Request::builder()
            .uri("/events?topics=payments")
            .header("Authorization", format!("Bearer {}", staff()))
            .body(Body::empty())
            .unwrap();
        let mut response = app
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let student = token(Role::Student, Some(student_id));
        let (status, _) = send(
            &app.router,
            "POST",
            "/payments",
            Some(&student),
            Some(json!({
                "feeId": fee_id,
                "studentId": student_id,
                "amountPaid": "500",
                "paymentMethod": "cash"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let text = next_text(&mut response).await;
        assert!(text.contains("event: payment.submitted"), "{text}");
        assert!(text.contains("id: 1"), "{text}");
        assert!(text.contains(&format!("\"feeId\":{fee_id}")), "{text}");
    }

    #[tokio::test]
    async fn reconnecting_client_replays_missed_changes() {
        let app = setup().await;
        let (student_id, fee_id) = seed_fee(&app.state, "S-1", Decimal::new(500, 0)).await;
        let student = token(Role::Student, Some(student_id));
        for _ in 0..2 {
            let (status, _) = send(
                &app.router,
                "POST",
                "/payments",
                Some(&student),
                Some(json!({
                    "feeId": fee_id,
                    "studentId": student_id,
                    "amountPaid": 100,
                    "paymentMethod": "cash"
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let request = Request::builder()
            .uri(format!("/events?token={student}"))
            .header("Last-Event-ID", "1")
            .body(Body::empty())
            .unwrap();
        let mut response = app
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let text = next_text(&mut response).await;
        assert!(text.contains("id: 2"), "{text}");
        assert!(!text.contains("id: 1\n"), "{text}");
    }

    #[tokio::test]
    async fn truncated_replay_opens_with_resync() {
        let mut app = setup().await;
        app.state = app.state.clone().with_replay_limit(2);
        let router = crate::router::app_router(app.state.clone());
        let (student_id, fee_id) = seed_fee(&app.state, "S-1", Decimal::new(500, 0)).await;
        let student = token(Role::Student, Some(student_id));
        for _ in 0..3 {
            let (status, _) = send(
                &router,
                "POST",
                "/payments",
                Some(&student),
                Some(json!({
                    "feeId": fee_id,
                    "studentId": student_id,
                    "amountPaid": 100,
                    "paymentMethod": "cash"
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let request = Request::builder()
            .uri("/events?sinceVersion=0")
            .header("Authorization", format!("Bearer {}", staff()))
            .body(Body::empty())
            .unwrap();
        let mut response = router
            .oneshot(request)
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let first = next_text(&mut response).await;
        assert!(first.contains("event: resync"), "{first}");
        assert!(first.contains("\"replayedUpTo\":2"), "{first}");
        let second = next_text(&mut response).await;
        assert!(second.contains("id: 1"), "{second}");
    }
}
