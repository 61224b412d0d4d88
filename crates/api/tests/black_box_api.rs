use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{json, Value};

use vantage_api::app::services::{AppServices, Stores};
use vantage_api::config::AppConfig;
use vantage_auth::{JwtClaims, PrincipalId, Role};
use vantage_core::{CardId, Clock, FixedClock, TenantId, ThresholdId};
use vantage_infra::detection::{InMemoryRuleStore, RuleStore};
use vantage_infra::jobs::AcquireOptions;
use vantage_infra::outcomes::{StaticImpactSource, EVALUATION_FUNCTION};
use vantage_infra::pipeline::PIPELINE_FUNCTION;
use vantage_rules::{ComparisonOp, MonitoredObject, Severity, ThresholdConfig};

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(services: AppServices) -> Self {
        // Same router as prod over injected services, on an ephemeral port.
        let app = vantage_api::app::router(services, JWT_SECRET);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// In-memory services on a manual clock, with handles to seed rules and
/// measured impacts.
struct World {
    clock: Arc<FixedClock>,
    rules: Arc<InMemoryRuleStore>,
    impacts: Arc<StaticImpactSource>,
    services: AppServices,
    client: reqwest::Client,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
        let rules = InMemoryRuleStore::arc();
        let impacts = StaticImpactSource::arc();
        let stores = Stores {
            rules: rules.clone(),
            impacts: impacts.clone(),
            ..Stores::in_memory()
        };
        let services = AppServices::wire(stores, clock.clone(), &AppConfig::default());
        Self {
            clock,
            rules,
            impacts,
            services,
            client: reqwest::Client::new(),
        }
    }

    async fn spawn(&self) -> TestServer {
        TestServer::spawn(self.services.clone()).await
    }

    fn token(&self, tenant_id: TenantId, roles: &[&'static str]) -> String {
        mint_jwt(tenant_id, roles.iter().map(|r| Role::new(*r)).collect(), self.clock.now())
    }

    async fn seed_low_stock(&self, tenant_id: TenantId) {
        let obj = MonitoredObject::new(tenant_id, "sku", "SKU-42").with_metric("days_of_stock", 2.0);
        self.rules.upsert_object(&obj).await.unwrap();
        self.rules
            .upsert_threshold(&ThresholdConfig {
                id: ThresholdId::new(),
                tenant_id,
                metric: "days_of_stock".into(),
                operator: ComparisonOp::Lt,
                value: 5.0,
                unit: Some("days".into()),
                severity: Severity::Critical,
                enabled: true,
                object_type: None,
            })
            .await
            .unwrap();
    }

    async fn post(&self, srv: &TestServer, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .client
            .post(srv.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, srv: &TestServer, path: &str, token: &str) -> (StatusCode, Value) {
        let res = self.client.get(srv.url(path)).bearer_auth(token).send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }
}

fn mint_jwt(tenant_id: TenantId, roles: Vec<Role>, now: DateTime<Utc>) -> String {
    let claims = JwtClaims {
        sub: PrincipalId::new(),
        tenant_id,
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

#[tokio::test]
async fn health_is_public_everything_else_needs_a_token() {
    let w = World::new();
    let srv = w.spawn().await;

    let res = w.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = w.client.get(srv.url("/cards")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let res = w.client.get(srv.url("/cards")).bearer_auth("not-a-jwt").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pipeline_run_reports_chunks_and_detection() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();
    w.seed_low_stock(tenant).await;
    let token = w.token(tenant, &[Role::OPERATOR]);

    let (status, report) = w
        .post(
            &srv,
            "/pipeline/run",
            &token,
            json!({ "tenant_id": tenant, "start_date": "2024-01-01", "end_date": "2024-01-31" }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["success"], true);
    assert_eq!(report["facts"]["chunks"].as_array().unwrap().len(), 3);
    assert_eq!(report["detection"]["value"]["alerts_triggered"], 1);

    let (status, jobs) = w.get(&srv, "/jobs", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs["jobs"][0]["id"], report["job_id"]);
    assert_eq!(jobs["jobs"][0]["status"], "completed");
}

#[tokio::test]
async fn pipeline_run_while_locked_is_a_conflict() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();
    let end = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();

    let held = w
        .services
        .registry
        .acquire_lock(PIPELINE_FUNCTION, tenant, AcquireOptions::default().with_grain_date(end))
        .await
        .unwrap();
    assert!(held.is_acquired());

    let token = w.token(tenant, &[Role::ADMIN]);
    let (status, body) = w
        .post(&srv, "/pipeline/run", &token, json!({ "tenant_id": tenant, "end_date": "2024-01-07" }))
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_running");
    assert_eq!(body["lock_key"], held.lock_key().as_str());
}

#[tokio::test]
async fn overlapping_outcome_evaluation_is_a_conflict() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();

    let held = w
        .services
        .registry
        .acquire_lock(
            EVALUATION_FUNCTION,
            tenant,
            AcquireOptions::default().with_grain_date(w.clock.today()),
        )
        .await
        .unwrap();
    assert!(held.is_acquired());

    let token = w.token(tenant, &[Role::SCHEDULER]);
    let (status, body) = w.post(&srv, "/outcomes/evaluate", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_running");
    assert_eq!(body["lock_key"], held.lock_key().as_str());

    // Detection for the same tenant uses its own lock and still runs.
    let (status, _) = w.post(&srv, "/rules/detect", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = w.get(&srv, "/jobs", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn body_tenant_must_match_token_unless_scheduler() {
    let w = World::new();
    let srv = w.spawn().await;
    let (home, other) = (TenantId::new(), TenantId::new());

    let operator = w.token(home, &[Role::OPERATOR]);
    let (status, body) = w.post(&srv, "/pipeline/run", &operator, json!({ "tenant_id": other })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let scheduler = w.token(home, &[Role::SCHEDULER]);
    let (status, report) = w.post(&srv, "/pipeline/run", &scheduler, json!({ "tenant_id": other })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["tenant_id"], json!(other));
}

#[tokio::test]
async fn viewer_reads_but_cannot_write() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();
    let viewer = w.token(tenant, &[Role::VIEWER]);

    let (status, _) = w.get(&srv, "/cards", &viewer).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = w.post(&srv, "/pipeline/run", &viewer, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let card = CardId::new();
    let (status, _) = w
        .post(&srv, &format!("/cards/{card}/decide"), &viewer, json!({ "action_type": "reorder" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let w = World::new();
    let srv = w.spawn().await;
    let token = w.token(TenantId::new(), &[Role::ADMIN]);

    let (status, body) = w.post(&srv, "/pipeline/run", &token, json!({ "skip_cdp": true })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");

    let (status, body) = w.post(&srv, "/cards/not-a-uuid/start", &token, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let (status, _) = w.get(&srv, "/alerts?status=exploded", &token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn alert_to_card_to_decision_to_outcome() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();
    w.seed_low_stock(tenant).await;
    let token = w.token(tenant, &[Role::OPERATOR]);

    let (status, report) = w.post(&srv, "/rules/detect", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["alerts_triggered"], 1);
    assert_eq!(report["cards_opened"], 1);

    // Same period again: deduplicated.
    let (_, report) = w.post(&srv, "/rules/detect", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(report["alerts_triggered"], 0);
    assert_eq!(report["duplicates_skipped"], 1);

    let (_, alerts) = w.get(&srv, "/alerts?status=active", &token).await;
    let alert_id = alerts[0]["id"].as_str().unwrap().to_string();
    let (status, alert) = w.post(&srv, &format!("/alerts/{alert_id}/acknowledge"), &token, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(alert["status"], "acknowledged");

    let (_, queue) = w.get(&srv, "/cards", &token).await;
    assert_eq!(queue.as_array().unwrap().len(), 1);
    let card_id = queue[0]["id"].as_str().unwrap().to_string();

    let (status, card) = w.post(&srv, &format!("/cards/{card_id}/start"), &token, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["status"], "IN_PROGRESS");

    let (status, card) = w
        .post(
            &srv,
            &format!("/cards/{card_id}/decide"),
            &token,
            json!({ "action_type": "reorder", "comment": "expedite" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["status"], "DECIDED");

    // Terminal: a second decision is refused.
    let (status, body) = w
        .post(&srv, &format!("/cards/{card_id}/decide"), &token, json!({ "action_type": "reorder" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");

    let decision: CardId = card_id.parse().unwrap();
    w.impacts.set(tenant, decision, card["predicted_impact"].as_f64().unwrap());

    let (status, report) = w.post(&srv, "/outcomes/evaluate", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["recorded"], 0);

    w.clock.advance(ChronoDuration::days(31));
    let token = w.token(tenant, &[Role::OPERATOR]);
    let (status, report) = w.post(&srv, "/outcomes/evaluate", &token, json!({ "tenant_id": tenant })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["recorded"], 1);

    let (status, stats) = w.get(&srv, "/outcomes/stats", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 1);
}

#[tokio::test]
async fn snoozed_cards_come_back_through_the_sweep() {
    let w = World::new();
    let srv = w.spawn().await;
    let tenant = TenantId::new();
    w.seed_low_stock(tenant).await;
    let token = w.token(tenant, &[Role::OPERATOR]);
    w.post(&srv, "/rules/detect", &token, json!({ "tenant_id": tenant })).await;

    let (_, queue) = w.get(&srv, "/cards", &token).await;
    let card_id = queue[0]["id"].as_str().unwrap().to_string();

    let (status, _) = w
        .post(&srv, &format!("/cards/{card_id}/snooze"), &token, json!({ "hours": 0, "reason": "later" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, card) = w
        .post(&srv, &format!("/cards/{card_id}/snooze"), &token, json!({ "hours": 2, "reason": "later" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["status"], "SNOOZED");
    let (_, queue) = w.get(&srv, "/cards", &token).await;
    assert!(queue.as_array().unwrap().is_empty());

    w.clock.advance(ChronoDuration::hours(3));
    let token = w.token(tenant, &[Role::OPERATOR]);
    let (status, body) = w.post(&srv, "/cards/resume-due", &token, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"].as_array().unwrap().len(), 1);

    let (_, queue) = w.get(&srv, "/cards", &token).await;
    assert_eq!(queue[0]["status"], "OPEN");
}
