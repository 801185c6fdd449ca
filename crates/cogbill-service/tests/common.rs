//! Common test utilities for cogbill integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use tokio::sync::{mpsc, Mutex};

use cogbill_core::{CreditType, JobResult, UserId};
use cogbill_engine::{
    CogRequest, CogWorker, Dispatcher, GrantRequest, JobCorrelator, JobTimeouts, Ledger,
    LedgerOptions, SubmitError,
};
use cogbill_service::{create_router, AppState, ServiceConfig};
use cogbill_store::MemoryStore;

/// How the fake cog worker answers submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Accept and resolve successfully right away, as if the webhook came in.
    AutoSucceed,
    /// Accept and stay silent; the test posts the webhook itself.
    Manual,
    /// Refuse every submission.
    Reject,
}

/// A cog worker that never leaves the process.
pub struct FakeWorker {
    mode: WorkerMode,
    correlator: JobCorrelator,
    submissions: mpsc::UnboundedSender<CogRequest>,
}

#[async_trait]
impl CogWorker for FakeWorker {
    async fn submit(&self, request: CogRequest) -> Result<(), SubmitError> {
        let _ = self.submissions.send(request.clone());

        match self.mode {
            WorkerMode::AutoSucceed => {
                let correlator = self.correlator.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    correlator.resolve(
                        request.id,
                        JobResult::Succeeded {
                            outputs: serde_json::json!(["https://cdn.example/out.png"]),
                        },
                    );
                });
                Ok(())
            }
            WorkerMode::Manual => Ok(()),
            WorkerMode::Reject => Err(SubmitError::Rejected("503 Service Unavailable".into())),
        }
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The ledger behind the server, for seeding and assertions.
    pub ledger: Ledger,
    /// The service API key for upstream requests.
    pub service_api_key: String,
    /// The admin API key for grants.
    pub admin_api_key: String,
    /// Every request the fake worker received.
    pub submissions: Mutex<mpsc::UnboundedReceiver<CogRequest>>,
}

impl TestHarness {
    /// Create a harness whose worker answers every job successfully.
    pub fn new() -> Self {
        Self::with_mode(WorkerMode::AutoSucceed, |_| {})
    }

    /// Create a harness with a given worker mode and config tweaks.
    pub fn with_mode(mode: WorkerMode, configure: impl FnOnce(&mut ServiceConfig)) -> Self {
        let service_api_key = "test-service-key".to_string();
        let admin_api_key = "test-admin-key".to_string();

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            admin_api_key: Some(admin_api_key.clone()),
            job_timeouts: JobTimeouts::uniform(Duration::from_secs(5)),
            ..ServiceConfig::default()
        };
        configure(&mut config);

        let ledger = Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default());
        let correlator = JobCorrelator::new(config.correlator_grace());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FakeWorker {
            mode,
            correlator: correlator.clone(),
            submissions: tx,
        };
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            correlator,
            Arc::new(worker),
            config.dispatch_options(),
        );

        let state = AppState::new(dispatcher, config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            ledger,
            service_api_key,
            admin_api_key,
            submissions: Mutex::new(rx),
        }
    }

    /// Give `user_id` a never-expiring promo batch of `amount` credits.
    pub async fn fund(&self, user_id: UserId, amount: i64) {
        self.ledger
            .grant(GrantRequest {
                user_id,
                credit_type: CreditType::Promo,
                amount,
                starts_at: None,
                expires_at: None,
                period: None,
                stripe_line_item_id: None,
            })
            .await
            .expect("Failed to fund user");
    }

    /// Current balance of `user_id`.
    pub fn balance(&self, user_id: UserId) -> i64 {
        self.ledger
            .balance(user_id, chrono::Utc::now())
            .expect("Failed to read balance")
    }

    /// Wait for the next submission the fake worker receives.
    pub async fn next_submission(&self) -> CogRequest {
        let mut rx = self.submissions.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("No submission arrived")
            .expect("Worker channel closed")
    }

    /// A generation job body for `user_id`.
    pub fn generation_job(user_id: UserId, num_outputs: u32) -> serde_json::Value {
        serde_json::json!({
            "user_id": user_id,
            "spec": {
                "kind": "generation",
                "prompt": "a lighthouse at dusk",
                "num_outputs": num_outputs,
                "width": 512,
                "height": 512
            }
        })
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
