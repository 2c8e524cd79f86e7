//! Runs API Integration Tests
//!
//! Jobs are captured by a manual dispatcher so each test decides when the
//! worker "picks up" a run.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

use orchestrator::actors::{MissionBus, MissionBusConfig};
use orchestrator::api::{self, ApiState};
use orchestrator::app_state::{AppState, AppStateParts};
use orchestrator::dispatch::{DispatchError, JobDispatcher, RunJob};
use orchestrator::events::EventLogConfig;
use orchestrator::limits::AdmissionPolicy;
use orchestrator::run::{Crew, CrewRecipe, InMemoryRunStore, RunOutcome, RunStore, ScriptedExecutor};
use shared_types::{RunEventKind, RunStatus};

#[derive(Default)]
struct ManualDispatcher {
    jobs: Mutex<Vec<RunJob>>,
    fail: bool,
}

impl ManualDispatcher {
    fn take(&self) -> Vec<RunJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }
}

impl JobDispatcher for ManualDispatcher {
    fn enqueue(
        &self,
        run_id: Uuid,
        crew_id: Uuid,
        prompt: String,
        inputs: serde_json::Map<String, Value>,
    ) -> Result<String, DispatchError> {
        if self.fail {
            return Err(DispatchError::Unavailable("worker pool is shut down".to_string()));
        }
        let job = RunJob::new(run_id, crew_id, prompt, inputs);
        let job_id = job.job_id.clone();
        self.jobs.lock().unwrap().push(job);
        Ok(job_id)
    }
}

struct TestApp {
    app: axum::Router,
    state: Arc<AppState>,
    store: InMemoryRunStore,
    dispatcher: Arc<ManualDispatcher>,
}

async fn setup_test_app(policy: AdmissionPolicy, fail_dispatch: bool) -> TestApp {
    let store = InMemoryRunStore::new();
    let (mission, _handle) = MissionBus::spawn(MissionBusConfig::default())
        .await
        .expect("Failed to spawn mission bus");
    let dispatcher = Arc::new(ManualDispatcher {
        jobs: Mutex::new(Vec::new()),
        fail: fail_dispatch,
    });

    let for_state = Arc::clone(&dispatcher);
    let state = Arc::new(AppState::from_parts(
        AppStateParts {
            store: Arc::new(store.clone()),
            executor: Arc::new(ScriptedExecutor::tokens(&["hi ", "there "], "hi there")),
            mission,
            event_log: EventLogConfig::default(),
            admission: policy,
        },
        move |_driver| for_state as Arc<dyn JobDispatcher>,
    ));

    let app = api::router().with_state(ApiState {
        app_state: Arc::clone(&state),
    });
    TestApp {
        app,
        state,
        store,
        dispatcher,
    }
}

async fn seed_crew(store: &InMemoryRunStore, org_id: Option<&str>) -> Crew {
    let crew = Crew {
        id: Uuid::new_v4(),
        org_id: org_id.map(str::to_string),
        name: "Research".to_string(),
        recipe: CrewRecipe::default(),
    };
    store.put_crew(&crew).await.expect("Failed to seed crew");
    crew
}

fn start_run_request(crew_id: Uuid, body: Value) -> Request<Body> {
    start_run_request_with(crew_id, body, &[])
}

fn start_run_request_with(crew_id: Uuid, body: Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/crews/{crew_id}/runs"))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: String) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

fn run_id_of(body: &Value) -> Uuid {
    body["id"]
        .as_str()
        .expect("run id missing")
        .parse()
        .expect("run id is not a uuid")
}

#[tokio::test]
async fn test_health() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let (status, body) = json_response(&t.app, get("/health".to_string())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_start_run_returns_queued_run_and_dispatches_it() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let crew = seed_crew(&t.store, Some("acme")).await;

    let (status, body) = json_response(
        &t.app,
        start_run_request(
            crew.id,
            json!({"prompt": "hello", "inputs": {"ticket": 7}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["prompt"], "hello");
    assert_eq!(body["crew_id"], crew.id.to_string());
    assert_eq!(body["total_tokens"], 0);
    assert!(body["started_at"].is_null());

    let run_id = run_id_of(&body);
    let jobs = t.dispatcher.take();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].run_id, run_id);
    assert_eq!(jobs[0].crew_id, crew.id);
    assert_eq!(jobs[0].prompt, "hello");
    assert_eq!(jobs[0].inputs["ticket"], 7);

    let (status, body) = json_response(&t.app, get(format!("/runs/{run_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let (_, quota) = json_response(&t.app, get("/quota/acme/runs".to_string())).await;
    assert_eq!(quota["count"], 1);
}

#[tokio::test]
async fn test_start_run_unknown_crew_is_404() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let (status, body) = json_response(
        &t.app,
        start_run_request(Uuid::new_v4(), json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CREW_NOT_FOUND");
    assert!(t.dispatcher.take().is_empty());
}

#[tokio::test]
async fn test_start_run_rejects_empty_prompt() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let crew = seed_crew(&t.store, None).await;
    let (status, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_start_run_is_rate_limited_per_crew() {
    let policy = AdmissionPolicy {
        run_start_rate_per_minute: 1,
        run_start_burst: 2,
        run_quota_per_day: 100,
    };
    let t = setup_test_app(policy, false).await;
    let crew = seed_crew(&t.store, Some("acme")).await;

    for _ in 0..2 {
        let (status, _) =
            json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
    assert_eq!(body["message"], "rate_limited");
    assert_eq!(body["retryable"], true);
    assert_eq!(t.store.runs().len(), 2);

    // Another crew has its own bucket.
    let other = seed_crew(&t.store, Some("acme")).await;
    let (status, _) =
        json_response(&t.app, start_run_request(other.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_client_identity_headers_do_not_bypass_rate_limit() {
    let policy = AdmissionPolicy {
        run_start_rate_per_minute: 1,
        run_start_burst: 2,
        run_quota_per_day: 100,
    };
    let t = setup_test_app(policy, false).await;
    let crew = seed_crew(&t.store, Some("acme")).await;

    let mut admitted = 0;
    for i in 0..20 {
        let actor = format!("caller-{i}");
        let (status, _) = json_response(
            &t.app,
            start_run_request_with(
                crew.id,
                json!({"prompt": "go"}),
                &[("x-actor-id", actor.as_str())],
            ),
        )
        .await;
        if status == StatusCode::ACCEPTED {
            admitted += 1;
        } else {
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(t.state.rate_limiter.len(), 1);
}

#[tokio::test]
async fn test_start_run_enforces_org_quota() {
    let policy = AdmissionPolicy {
        run_quota_per_day: 1,
        ..AdmissionPolicy::default()
    };
    let t = setup_test_app(policy, false).await;
    let crew = seed_crew(&t.store, Some("acme")).await;

    let (status, _) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
    assert_eq!(body["message"], "quota_exceeded:runs");
    assert_eq!(t.store.runs().len(), 1);

    // The rejected call still counted.
    let (_, quota) = json_response(&t.app, get("/quota/acme/runs".to_string())).await;
    assert_eq!(quota["count"], 2);
}

#[tokio::test]
async fn test_crew_without_org_skips_quota() {
    let policy = AdmissionPolicy {
        run_quota_per_day: 0,
        ..AdmissionPolicy::default()
    };
    let t = setup_test_app(policy, false).await;
    let crew = seed_crew(&t.store, None).await;

    let (status, _) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_dispatch_failure_is_retryable_and_run_stays_queued() {
    let t = setup_test_app(AdmissionPolicy::default(), true).await;
    let crew = seed_crew(&t.store, None).await;

    let (status, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "DISPATCH_UNAVAILABLE");
    assert_eq!(body["retryable"], true);

    let runs = t.store.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Queued);
    assert!(t.state.cancellations.is_empty());
}

#[tokio::test]
async fn test_cancel_of_undispatched_run_finishes_it() {
    let t = setup_test_app(AdmissionPolicy::default(), true).await;
    let crew = seed_crew(&t.store, None).await;

    let (status, _) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "go"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let run_id = t.store.runs()[0].id;

    let (status, body) = json_response(&t.app, post(format!("/runs/{run_id}/cancel"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelled");

    let (_, body) = json_response(&t.app, get(format!("/runs/{run_id}"))).await;
    assert_eq!(body["status"], "cancelled");
    assert!(body["finished_at"].is_string());

    let kinds: Vec<RunEventKind> = t
        .state
        .events
        .snapshot(run_id)
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![RunEventKind::Status(RunStatus::Cancelled), RunEventKind::Done]
    );
    assert!(t.state.cancellations.is_empty());

    let (status, body) = json_response(&t.app, post(format!("/runs/{run_id}/cancel"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RUN_TERMINAL");
}

#[tokio::test]
async fn test_get_unknown_run_is_404() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let (status, body) = json_response(&t.app, get(format!("/runs/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RUN_NOT_FOUND");
}

#[tokio::test]
async fn test_queued_run_to_succeeded_end_to_end() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let crew = seed_crew(&t.store, None).await;

    let (_, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "hello"}))).await;
    let run_id = run_id_of(&body);
    let (_, body) = json_response(&t.app, get(format!("/runs/{run_id}"))).await;
    assert_eq!(body["status"], "queued");

    let job = t.dispatcher.take().pop().expect("job was dispatched");
    let outcome = t.state.driver.drive(job).await;
    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            output: "hi there".to_string()
        }
    );

    let kinds: Vec<RunEventKind> = t
        .state
        .events
        .snapshot(run_id)
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            RunEventKind::Status(RunStatus::Running),
            RunEventKind::Token("hi ".to_string()),
            RunEventKind::Token("there ".to_string()),
            RunEventKind::Status(RunStatus::Succeeded),
            RunEventKind::Done,
        ]
    );

    let (_, body) = json_response(&t.app, get(format!("/runs/{run_id}"))).await;
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["total_tokens"], 2);
    assert!(body["started_at"].is_string());
    assert!(body["finished_at"].is_string());

    let (_, metrics) = json_response(&t.app, get("/metrics/runs".to_string())).await;
    assert_eq!(metrics["started"][0]["count"], 1);
    assert_eq!(metrics["finished"][0]["status"], "succeeded");
}

#[tokio::test]
async fn test_cancel_queued_run_then_conflict() {
    let t = setup_test_app(AdmissionPolicy::default(), false).await;
    let crew = seed_crew(&t.store, None).await;

    let (_, body) =
        json_response(&t.app, start_run_request(crew.id, json!({"prompt": "hello"}))).await;
    let run_id = run_id_of(&body);

    let (status, body) = json_response(&t.app, post(format!("/runs/{run_id}/cancel"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelling");

    let job = t.dispatcher.take().pop().expect("job was dispatched");
    assert_eq!(t.state.driver.drive(job).await, RunOutcome::Cancelled);

    let (_, body) = json_response(&t.app, get(format!("/runs/{run_id}"))).await;
    assert_eq!(body["status"], "cancelled");
    assert!(body["started_at"].is_null());
    assert!(t.state.cancellations.is_empty());

    let (status, body) = json_response(&t.app, post(format!("/runs/{run_id}/cancel"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RUN_TERMINAL");

    let (status, _) =
        json_response(&t.app, post(format!("/runs/{}/cancel", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_worker_pool_drives_run_to_completion() {
    use orchestrator::app_state::StackConfig;

    let store = InMemoryRunStore::new();
    let crew = seed_crew(&store, Some("acme")).await;
    let state = Arc::new(
        AppState::start(
            StackConfig::default(),
            Arc::new(store.clone()),
            Arc::new(ScriptedExecutor::tokens(&["hi ", "there "], "hi there")),
            &tokio::runtime::Handle::current(),
        )
        .await
        .expect("Failed to start stack"),
    );
    let app = api::router().with_state(ApiState {
        app_state: Arc::clone(&state),
    });

    let (status, body) =
        json_response(&app, start_run_request(crew.id, json!({"prompt": "hello"}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let run_id = run_id_of(&body);

    let mut view = Value::Null;
    for _ in 0..100 {
        let (_, body) = json_response(&app, get(format!("/runs/{run_id}"))).await;
        if body["status"] == "succeeded" {
            view = body;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(view["status"], "succeeded", "run never finished");
    assert_eq!(view["total_tokens"], 2);
    assert!(state.events.is_finished(run_id));

    state.shutdown().await;
    let (status, _) =
        json_response(&app, start_run_request(crew.id, json!({"prompt": "again"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
