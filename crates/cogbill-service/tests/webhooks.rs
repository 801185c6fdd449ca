//! Cog webhook integration tests.

mod common;

use axum::http::StatusCode;
use cogbill_core::{CorrelationId, UserId};
use cogbill_service::crypto::hmac_sha256_hex;
use common::{TestHarness, WorkerMode};
use serde_json::json;

fn prediction(id: &str, status: &str) -> serde_json::Value {
    match status {
        "succeeded" => json!({
            "id": id,
            "status": status,
            "output": ["https://cdn.example/a.wav"]
        }),
        "failed" => json!({ "id": id, "status": status, "error": "CUDA out of memory" }),
        _ => json!({ "id": id, "status": status }),
    }
}

#[tokio::test]
async fn webhook_completes_a_waiting_job() {
    let harness = TestHarness::with_mode(WorkerMode::Manual, |_| {});
    let user = UserId::generate();
    harness.fund(user, 5).await;

    let submit = async {
        harness
            .server
            .post("/v1/jobs")
            .add_header("x-api-key", harness.service_api_key.clone())
            .json(&TestHarness::generation_job(user, 1))
            .await
    };

    let deliver = async {
        let request = harness.next_submission().await;
        let id = request.id.to_string();

        let started = harness
            .server
            .post("/webhooks/cog")
            .json(&prediction(&id, "starting"))
            .await;
        started.assert_status_ok();
        let body: serde_json::Value = started.json();
        assert!(body.get("resolution").is_none());

        harness
            .server
            .post("/webhooks/cog")
            .json(&prediction(&id, "succeeded"))
            .await
    };

    let (response, delivered) = tokio::join!(submit, deliver);

    delivered.assert_status_ok();
    let body: serde_json::Value = delivered.json();
    assert_eq!(body["resolution"], "delivered");

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["outputs"][0], "https://cdn.example/a.wav");
    assert_eq!(harness.balance(user), 4);
}

#[tokio::test]
async fn failed_webhook_refunds_the_job() {
    let harness = TestHarness::with_mode(WorkerMode::Manual, |_| {});
    let user = UserId::generate();
    harness.fund(user, 5).await;

    let submit = async {
        harness
            .server
            .post("/v1/jobs")
            .add_header("x-api-key", harness.service_api_key.clone())
            .json(&TestHarness::generation_job(user, 1))
            .await
    };

    let deliver = async {
        let request = harness.next_submission().await;
        harness
            .server
            .post("/webhooks/cog")
            .json(&prediction(&request.id.to_string(), "failed"))
            .await
    };

    let (response, delivered) = tokio::join!(submit, deliver);

    delivered.assert_status_ok();
    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "job_failed");
    assert_eq!(body["error"]["details"]["refunded"], true);
    assert_eq!(harness.balance(user), 5);
}

#[tokio::test]
async fn repeated_webhook_is_a_duplicate() {
    let harness = TestHarness::new();
    let user = UserId::generate();
    harness.fund(user, 5).await;

    let response = harness
        .server
        .post("/v1/jobs")
        .add_header("x-api-key", harness.service_api_key.clone())
        .json(&TestHarness::generation_job(user, 1))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let id = body["correlation_id"].as_str().unwrap().to_string();

    let response = harness
        .server
        .post("/webhooks/cog")
        .json(&prediction(&id, "succeeded"))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["resolution"], "duplicate");
    assert_eq!(harness.balance(user), 4);
}

#[tokio::test]
async fn webhook_for_unknown_job_is_cached() {
    let harness = TestHarness::new();
    let id = CorrelationId::generate().to_string();

    let response = harness
        .server
        .post("/webhooks/cog")
        .json(&prediction(&id, "succeeded"))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["resolution"], "cached");
}

#[tokio::test]
async fn malformed_webhook_body_fails() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/webhooks/cog")
        .json(&json!({ "id": "not-a-ulid", "status": "succeeded" }))
        .await;

    response.assert_status_bad_request();
}

// ============================================================================
// Signatures
// ============================================================================

fn signed_harness() -> TestHarness {
    TestHarness::with_mode(WorkerMode::AutoSucceed, |config| {
        config.cog_webhook_secret = Some("whsec_test".into());
    })
}

#[tokio::test]
async fn webhook_without_signature_is_rejected_when_secret_is_set() {
    let harness = signed_harness();
    let id = CorrelationId::generate().to_string();

    let response = harness
        .server
        .post("/webhooks/cog")
        .json(&prediction(&id, "succeeded"))
        .await;

    response.assert_status_bad_request();
}

#[tokio::test]
async fn webhook_with_wrong_signature_is_rejected() {
    let harness = signed_harness();
    let id = CorrelationId::generate().to_string();

    let response = harness
        .server
        .post("/webhooks/cog")
        .add_header("x-cog-signature", "sha256=deadbeef")
        .json(&prediction(&id, "succeeded"))
        .await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn webhook_with_valid_signature_is_accepted() {
    let harness = signed_harness();
    let id = CorrelationId::generate().to_string();
    let body = serde_json::to_vec(&prediction(&id, "succeeded")).unwrap();
    let signature = hmac_sha256_hex("whsec_test", &body).unwrap();

    let response = harness
        .server
        .post("/webhooks/cog")
        .add_header("x-cog-signature", format!("sha256={signature}"))
        .add_header("content-type", "application/json")
        .bytes(body.into())
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["received"], true);
}
