//! Job Dispatch Pipeline.
//!
//! [`Dispatcher::submit`] is the one entry point bot and HTTP handlers call
//! to run a job: price it, debit it, hand it to a cog worker, and block
//! until the webhook reports back or the per-kind timeout fires.
//!
//! Everything after the advisory balance check runs in a spawned task. The
//! caller's cancellation token (or simply dropping the `submit` future)
//! only detaches the caller; the job keeps running and its outcome,
//! including any refund, is persisted for [`Dispatcher::job`]. Job tasks
//! are tracked so [`Dispatcher::shutdown_and_wait`] can let every one of
//! them settle before the process exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cogbill_core::{
    BillingError, CorrelationId, Job, JobKind, JobResult, JobSpec, JobStatus, PricingConfig,
    UserId, WebhookEvent, WebhookEventType,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::correlator::{CorrelatorError, JobCorrelator, Resolution, WaitError, Waiter};
use crate::ledger::Ledger;
use crate::worker::{CogRequest, CogWorker, SubmitError};

/// Default generation timeout.
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;

/// Default upscale timeout.
const DEFAULT_UPSCALE_TIMEOUT_SECS: u64 = 120;

/// Default voiceover timeout.
const DEFAULT_VOICEOVER_TIMEOUT_SECS: u64 = 180;

/// How long to wait for each kind of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    /// Image generation.
    pub generation: Duration,
    /// Image upscale.
    pub upscale: Duration,
    /// Voiceover.
    pub voiceover: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            generation: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
            upscale: Duration::from_secs(DEFAULT_UPSCALE_TIMEOUT_SECS),
            voiceover: Duration::from_secs(DEFAULT_VOICEOVER_TIMEOUT_SECS),
        }
    }
}

impl JobTimeouts {
    /// The same timeout for every kind.
    #[must_use]
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            generation: timeout,
            upscale: timeout,
            voiceover: timeout,
        }
    }

    /// Timeout for `kind`.
    #[must_use]
    pub const fn for_kind(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Generation => self.generation,
            JobKind::Upscale => self.upscale,
            JobKind::Voiceover => self.voiceover,
        }
    }
}

/// When a debited job is given its credits back.
///
/// A job the worker never accepted is always refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPolicy {
    /// Refund when no result arrived before the timeout.
    pub on_timeout: bool,
    /// Refund when the worker reported a failure.
    pub on_failure: bool,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            on_timeout: true,
            on_failure: true,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Job pricing.
    pub pricing: PricingConfig,
    /// Per-kind wait bounds.
    pub timeouts: JobTimeouts,
    /// Refund decisions.
    pub refunds: RefundPolicy,
    /// Public URL of the webhook receiver, sent with every submission.
    pub webhook_url: String,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            pricing: PricingConfig::default(),
            timeouts: JobTimeouts::default(),
            refunds: RefundPolicy::default(),
            webhook_url: "http://localhost:8080/webhooks/cog".into(),
        }
    }
}

/// A completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    /// Correlation ID of the job.
    pub correlation_id: CorrelationId,
    /// Kind of job.
    pub kind: JobKind,
    /// Credits charged.
    pub cost: i64,
    /// Worker outputs.
    pub outputs: serde_json::Value,
}

/// Errors returned by [`Dispatcher::submit`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The user cannot afford the job. Nothing was debited.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance.
        balance: i64,
        /// Job cost.
        required: i64,
    },

    /// The job spec is malformed.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The ledger store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The worker never accepted the job.
    #[error("worker did not accept job {correlation_id}: {reason}")]
    SubmissionFailed {
        /// The job.
        correlation_id: CorrelationId,
        /// Why the submission failed.
        reason: String,
        /// Whether the cost was given back.
        refunded: bool,
    },

    /// No result arrived in time.
    #[error("job {correlation_id} timed out after {after:?}")]
    TimedOut {
        /// The job.
        correlation_id: CorrelationId,
        /// The timeout that fired.
        after: Duration,
        /// Whether the cost was given back.
        refunded: bool,
    },

    /// The worker reported a failure.
    #[error("job {correlation_id} failed: {reason}")]
    Failed {
        /// The job.
        correlation_id: CorrelationId,
        /// Reason reported by the worker.
        reason: String,
        /// Whether the cost was given back.
        refunded: bool,
    },

    /// The caller stopped waiting; the job is still running.
    #[error("caller detached from job {correlation_id}")]
    Detached {
        /// The job, for a later [`Dispatcher::job`] lookup.
        correlation_id: CorrelationId,
    },

    /// The correlator refused the job ID.
    #[error(transparent)]
    Correlation(#[from] CorrelatorError),

    /// The job task died.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the job's cost was refunded.
    #[must_use]
    pub const fn refunded(&self) -> bool {
        match self {
            Self::SubmissionFailed { refunded, .. }
            | Self::TimedOut { refunded, .. }
            | Self::Failed { refunded, .. } => *refunded,
            _ => false,
        }
    }

    /// The job this error is about, if one was created.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::SubmissionFailed { correlation_id, .. }
            | Self::TimedOut { correlation_id, .. }
            | Self::Failed { correlation_id, .. }
            | Self::Detached { correlation_id } => Some(*correlation_id),
            _ => None,
        }
    }
}

impl From<BillingError> for DispatchError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            BillingError::StorageTransaction(message) => Self::Storage(message),
            other => Self::InvalidJob(other.to_string()),
        }
    }
}

impl From<cogbill_store::StoreError> for DispatchError {
    fn from(err: cogbill_store::StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

struct Inner {
    ledger: Ledger,
    correlator: JobCorrelator,
    worker: Arc<dyn CogWorker>,
    options: DispatchOptions,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// The job dispatch pipeline.
///
/// Cheap to clone; clones share the ledger, correlator and worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("options", &self.inner.options)
            .field("in_flight", &self.inner.correlator.len())
            .field("tasks", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        correlator: JobCorrelator,
        worker: Arc<dyn CogWorker>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                correlator,
                worker,
                options,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// The ledger jobs are paid from.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// The correlator webhooks resolve.
    #[must_use]
    pub fn correlator(&self) -> &JobCorrelator {
        &self.inner.correlator
    }

    /// Dispatcher options.
    #[must_use]
    pub fn options(&self) -> &DispatchOptions {
        &self.inner.options
    }

    /// Stop waiting on every in-flight job.
    ///
    /// Jobs still waiting are recorded as failed and refunded according to
    /// [`RefundPolicy::on_failure`]. That happens on the job tasks; use
    /// [`Dispatcher::shutdown_and_wait`] to block until they are done.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
    }

    /// [`Dispatcher::shutdown`], then wait until every job task has
    /// recorded its outcome.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        tracing::info!(tasks = self.inner.tracker.len(), "Waiting for job tasks");
        self.inner.tracker.wait().await;
    }

    /// Number of job tasks still running, detached ones included.
    #[must_use]
    pub fn running_jobs(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Price of `spec` under the configured pricing.
    #[must_use]
    pub fn quote(&self, spec: &JobSpec) -> i64 {
        self.inner.options.pricing.job_cost(spec)
    }

    /// Run a job for `user_id` and wait for its outputs.
    ///
    /// # Errors
    ///
    /// - `DispatchError::InvalidJob` for a malformed spec.
    /// - `DispatchError::InsufficientCredits` if the user cannot pay.
    /// - `DispatchError::SubmissionFailed`, `TimedOut` or `Failed` when the
    ///   job did not produce outputs; each says whether it was refunded.
    /// - `DispatchError::Detached` if `cancel` fired first.
    /// - `DispatchError::Storage` if the ledger store kept failing.
    pub async fn submit(
        &self,
        user_id: UserId,
        spec: JobSpec,
        cancel: CancellationToken,
    ) -> Result<JobReceipt, DispatchError> {
        let kind = spec.kind();
        if let Err(reason) = spec.validate() {
            tracing::error!(
                user_id = %user_id,
                kind = kind.as_str(),
                reason = %reason,
                "Rejected malformed job spec"
            );
            return Err(DispatchError::InvalidJob(reason));
        }

        let cost = self.quote(&spec);
        let balance = self.inner.ledger.balance(user_id, Utc::now())?;
        if balance < cost {
            tracing::debug!(
                user_id = %user_id,
                balance,
                cost,
                "Pre-check: insufficient credits"
            );
            return Err(DispatchError::InsufficientCredits {
                balance,
                required: cost,
            });
        }

        let correlation_id = CorrelationId::generate();
        let span = tracing::info_span!(
            "job",
            correlation_id = %correlation_id,
            user_id = %user_id,
            kind = kind.as_str(),
            cost
        );
        let inner = Arc::clone(&self.inner);
        let job = self.inner.tracker.spawn(
            async move { inner.run(correlation_id, user_id, spec, cost).await }.instrument(span),
        );

        tokio::select! {
            biased;
            joined = job => joined.unwrap_or_else(|e| {
                tracing::error!(correlation_id = %correlation_id, error = %e, "Job task failed");
                Err(DispatchError::Internal(e.to_string()))
            }),
            () = cancel.cancelled() => {
                tracing::info!(correlation_id = %correlation_id, "Caller detached from job");
                Err(DispatchError::Detached { correlation_id })
            }
        }
    }

    /// Look up a job record.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Storage` if the store read fails.
    pub fn job(&self, correlation_id: &CorrelationId) -> Result<Option<Job>, DispatchError> {
        Ok(self.inner.ledger.store().get_job(correlation_id)?)
    }

    /// Route a webhook delivery to the waiting job.
    ///
    /// Returns `None` for non-terminal events.
    pub fn deliver(&self, event: &WebhookEvent) -> Option<Resolution> {
        let result = event.terminal_result()?;
        let resolution = self.inner.correlator.resolve(event.correlation_id, result);
        tracing::debug!(
            correlation_id = %event.correlation_id,
            event_type = ?event.event_type,
            resolution = ?resolution,
            "Delivered webhook"
        );
        Some(resolution)
    }
}

impl Inner {
    async fn run(
        &self,
        correlation_id: CorrelationId,
        user_id: UserId,
        spec: JobSpec,
        cost: i64,
    ) -> Result<JobReceipt, DispatchError> {
        let kind = spec.kind();
        let debit = self.ledger.debit(user_id, cost).await?;
        let mut job = Job::new(correlation_id, user_id, kind, cost, debit.allocations);

        let waiter = match self.correlator.register(correlation_id) {
            Ok(waiter) => waiter,
            Err(e) => {
                tracing::error!(error = %e, "Correlation ID collision");
                self.refund(&mut job, "correlation failed").await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.ledger.store().put_job(&job) {
            tracing::error!(error = %e, "Failed to record job");
            drop(waiter);
            self.refund(&mut job, "job record could not be written").await;
            return Err(e.into());
        }

        let request = CogRequest {
            id: correlation_id,
            kind,
            input: spec.worker_input(),
            webhook: self.options.webhook_url.clone(),
            webhook_events_filter: WebhookEventType::ALL.to_vec(),
        };
        match self.worker.submit(request).await {
            Ok(()) => tracing::info!("Dispatched job"),
            Err(SubmitError::Unknown(reason)) => {
                // The worker may be running it; the webhook or the timeout decides.
                tracing::warn!(reason = %reason, "Submission outcome unknown, waiting for webhook");
            }
            Err(SubmitError::Rejected(reason)) => {
                drop(waiter);
                tracing::warn!(reason = %reason, "Worker did not accept job");
                let refunded = self.refund(&mut job, "submission failed").await;
                job.failure = Some(reason.clone());
                job.transition(JobStatus::Failed);
                self.persist(&job);
                return Err(DispatchError::SubmissionFailed {
                    correlation_id,
                    reason,
                    refunded,
                });
            }
        }

        job.transition(JobStatus::Dispatched);
        self.persist(&job);

        self.finish(job, waiter).await
    }

    async fn finish(&self, mut job: Job, waiter: Waiter) -> Result<JobReceipt, DispatchError> {
        let correlation_id = job.correlation_id;
        let timeout = self.options.timeouts.for_kind(job.kind);

        match self.correlator.wait(waiter, timeout, &self.shutdown).await {
            Ok(JobResult::Succeeded { outputs }) => {
                job.outputs = Some(outputs.clone());
                job.transition(JobStatus::Completed);
                self.persist(&job);
                tracing::info!("Job completed");
                Ok(JobReceipt {
                    correlation_id,
                    kind: job.kind,
                    cost: job.cost,
                    outputs,
                })
            }
            Ok(JobResult::Failed { reason }) => {
                tracing::warn!(reason = %reason, "Worker reported failure");
                let refunded =
                    self.options.refunds.on_failure && self.refund(&mut job, "job failed").await;
                job.failure = Some(reason.clone());
                job.transition(JobStatus::Failed);
                self.persist(&job);
                Err(DispatchError::Failed {
                    correlation_id,
                    reason,
                    refunded,
                })
            }
            Err(WaitError::TimedOut) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "Job timed out");
                let refunded =
                    self.options.refunds.on_timeout && self.refund(&mut job, "job timed out").await;
                job.transition(JobStatus::TimedOut);
                self.persist(&job);
                Err(DispatchError::TimedOut {
                    correlation_id,
                    after: timeout,
                    refunded,
                })
            }
            Err(WaitError::Cancelled) => {
                let reason = "dispatcher shut down before the job finished".to_string();
                tracing::warn!("Abandoning job on shutdown");
                let refunded =
                    self.options.refunds.on_failure && self.refund(&mut job, "shutdown").await;
                job.failure = Some(reason.clone());
                job.transition(JobStatus::Failed);
                self.persist(&job);
                Err(DispatchError::Failed {
                    correlation_id,
                    reason,
                    refunded,
                })
            }
        }
    }

    /// Give the job's cost back. Returns whether it worked.
    async fn refund(&self, job: &mut Job, reason: &str) -> bool {
        match self.ledger.refund(job.user_id, &job.debit, reason).await {
            Ok(_) => {
                job.refunded = true;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, reason, "Refund failed");
                false
            }
        }
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = self.ledger.store().put_job(job) {
            tracing::error!(
                status = ?job.status,
                error = %e,
                "Failed to record job state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cogbill_core::{CogPrediction, PredictionStatus};
    use cogbill_store::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::ledger::test_support::{fast_options, seed};

    #[derive(Clone)]
    enum Script {
        Succeed(serde_json::Value),
        Fail(&'static str),
        Silent,
        Reject,
        LostAck,
    }

    struct ScriptedWorker {
        correlator: JobCorrelator,
        script: Script,
        delay: Duration,
        submissions: Mutex<Vec<CogRequest>>,
    }

    #[async_trait]
    impl CogWorker for ScriptedWorker {
        async fn submit(&self, request: CogRequest) -> Result<(), SubmitError> {
            self.submissions.lock().unwrap().push(request.clone());
            let result = match self.script.clone() {
                Script::Reject => {
                    return Err(SubmitError::Rejected("503 Service Unavailable".into()));
                }
                Script::LostAck => {
                    return Err(SubmitError::Unknown("operation timed out".into()));
                }
                Script::Silent => return Ok(()),
                Script::Succeed(outputs) => JobResult::Succeeded { outputs },
                Script::Fail(reason) => JobResult::Failed {
                    reason: reason.into(),
                },
            };
            let correlator = self.correlator.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                correlator.resolve(request.id, result);
            });
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        worker: Arc<ScriptedWorker>,
        user: UserId,
    }

    fn fixture(script: Script, delay: Duration, refunds: RefundPolicy) -> Fixture {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), fast_options());
        let correlator = JobCorrelator::default();
        let worker = Arc::new(ScriptedWorker {
            correlator: correlator.clone(),
            script,
            delay,
            submissions: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new(
            ledger,
            correlator,
            worker.clone(),
            DispatchOptions {
                timeouts: JobTimeouts::uniform(Duration::from_millis(100)),
                refunds,
                webhook_url: "https://bill.example/webhooks/cog".into(),
                ..DispatchOptions::default()
            },
        );
        let user = UserId::generate();
        seed(dispatcher.ledger(), user, &[(10, 30)]);
        Fixture {
            dispatcher,
            worker,
            user,
        }
    }

    fn two_images() -> JobSpec {
        JobSpec::Generation {
            prompt: "a lighthouse at dusk".into(),
            num_outputs: 2,
            width: 512,
            height: 512,
            model: None,
        }
    }

    fn balance(fixture: &Fixture) -> i64 {
        fixture
            .dispatcher
            .ledger()
            .balance(fixture.user, Utc::now())
            .unwrap()
    }

    async fn wait_for_status(dispatcher: &Dispatcher, id: CorrelationId, status: JobStatus) -> Job {
        for _ in 0..200 {
            if let Some(job) = dispatcher.job(&id).unwrap() {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn successful_job_is_debited_and_recorded() {
        let fx = fixture(
            Script::Succeed(json!(["https://cdn.example/1.png", "https://cdn.example/2.png"])),
            Duration::from_millis(5),
            RefundPolicy::default(),
        );

        let receipt = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.cost, 2);
        assert_eq!(receipt.kind, JobKind::Generation);
        assert_eq!(balance(&fx), 8);

        let job = fx.dispatcher.job(&receipt.correlation_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.outputs, Some(receipt.outputs));
        assert!(!job.refunded);

        let submissions = fx.worker.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].id, receipt.correlation_id);
        assert_eq!(submissions[0].webhook, "https://bill.example/webhooks/cog");
        assert_eq!(
            submissions[0].webhook_events_filter,
            vec![
                WebhookEventType::Start,
                WebhookEventType::Output,
                WebhookEventType::Completed
            ]
        );
    }

    #[tokio::test]
    async fn insufficient_balance_fails_fast() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());
        let spec = JobSpec::Generation {
            prompt: "too big".into(),
            num_outputs: 4,
            width: 1024,
            height: 1024,
            model: None,
        };

        let err = fx
            .dispatcher
            .submit(fx.user, spec, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DispatchError::InsufficientCredits {
                balance: 10,
                required: 16
            }
        );
        assert_eq!(balance(&fx), 10);
        assert!(fx.worker.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_spec_is_rejected() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());
        let err = fx
            .dispatcher
            .submit(
                fx.user,
                JobSpec::Upscale {
                    image_url: "https://cdn.example/a.png".into(),
                    scale: 3,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidJob(_)));
        assert_eq!(balance(&fx), 10);
    }

    #[tokio::test]
    async fn timeout_is_refunded_by_default() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TimedOut { refunded: true, .. }));
        assert_eq!(balance(&fx), 10);

        let id = err.correlation_id().unwrap();
        let job = fx.dispatcher.job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::TimedOut);
        assert!(job.refunded);

        // A webhook after the timeout changes nothing.
        let late = WebhookEvent::from_prediction(CogPrediction {
            id,
            status: PredictionStatus::Succeeded,
            output: Some(json!(["late.png"])),
            error: None,
        });
        assert_eq!(fx.dispatcher.deliver(&late), Some(Resolution::Duplicate));
        assert_eq!(balance(&fx), 10);
    }

    #[tokio::test]
    async fn timeout_without_refund_keeps_the_debit() {
        let fx = fixture(
            Script::Silent,
            Duration::ZERO,
            RefundPolicy {
                on_timeout: false,
                on_failure: true,
            },
        );

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TimedOut { refunded: false, .. }));
        assert_eq!(balance(&fx), 8);
    }

    #[tokio::test]
    async fn worker_failure_is_surfaced_and_refunded() {
        let fx = fixture(
            Script::Fail("CUDA out of memory"),
            Duration::from_millis(5),
            RefundPolicy::default(),
        );

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            DispatchError::Failed {
                reason, refunded, ..
            } => {
                assert_eq!(reason, "CUDA out of memory");
                assert!(refunded);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(balance(&fx), 10);

        let job = fx.dispatcher.job(&err.correlation_id().unwrap()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure.as_deref(), Some("CUDA out of memory"));
    }

    #[tokio::test]
    async fn rejected_submission_is_always_refunded() {
        let fx = fixture(
            Script::Reject,
            Duration::ZERO,
            RefundPolicy {
                on_timeout: false,
                on_failure: false,
            },
        );

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::SubmissionFailed { refunded: true, .. }));
        assert_eq!(balance(&fx), 10);
        assert_eq!(
            fx.dispatcher
                .correlator()
                .state(err.correlation_id().unwrap()),
            Some(crate::EntryState::Cancelled)
        );
    }

    #[tokio::test]
    async fn lost_acknowledgement_still_waits_for_the_webhook() {
        let fx = fixture(Script::LostAck, Duration::ZERO, RefundPolicy::default());
        let dispatcher = fx.dispatcher.clone();
        let worker = Arc::clone(&fx.worker);
        tokio::spawn(async move {
            let id = loop {
                if let Some(request) = worker.submissions.lock().unwrap().first() {
                    break request.id;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            let event = WebhookEvent::from_prediction(CogPrediction {
                id,
                status: PredictionStatus::Succeeded,
                output: Some(json!(["https://cdn.example/ran.png"])),
                error: None,
            });
            dispatcher.deliver(&event);
        });

        let receipt = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.outputs, json!(["https://cdn.example/ran.png"]));
        assert_eq!(balance(&fx), 8);
        let job = fx.dispatcher.job(&receipt.correlation_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(!job.refunded);
    }

    #[tokio::test]
    async fn lost_acknowledgement_without_webhook_times_out() {
        let fx = fixture(Script::LostAck, Duration::ZERO, RefundPolicy::default());

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::TimedOut { refunded: true, .. }));
        assert_eq!(balance(&fx), 10);
    }

    #[tokio::test]
    async fn detached_caller_does_not_cancel_the_job() {
        let fx = fixture(
            Script::Succeed(json!(["https://cdn.example/done.png"])),
            Duration::from_millis(40),
            RefundPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), cancel)
            .await
            .unwrap_err();
        let DispatchError::Detached { correlation_id } = err else {
            panic!("expected detach, got {err:?}");
        };

        let job = wait_for_status(&fx.dispatcher, correlation_id, JobStatus::Completed).await;
        assert_eq!(job.outputs, Some(json!(["https://cdn.example/done.png"])));
        assert_eq!(balance(&fx), 8);
    }

    #[tokio::test]
    async fn dropping_the_submit_future_does_not_cancel_the_job() {
        let fx = fixture(
            Script::Succeed(json!(["https://cdn.example/kept.png"])),
            Duration::from_millis(40),
            RefundPolicy::default(),
        );

        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            fx.dispatcher
                .submit(fx.user, two_images(), CancellationToken::new()),
        )
        .await;
        assert!(outcome.is_err());

        let id = loop {
            if let Some(request) = fx.worker.submissions.lock().unwrap().first() {
                break request.id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        wait_for_status(&fx.dispatcher, id, JobStatus::Completed).await;
        assert_eq!(balance(&fx), 8);
    }

    #[tokio::test]
    async fn shutdown_abandons_waiting_jobs() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());
        let dispatcher = fx.dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            dispatcher.shutdown();
        });

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Failed { refunded: true, .. }));
        assert_eq!(balance(&fx), 10);
    }

    #[tokio::test]
    async fn shutdown_and_wait_settles_detached_jobs() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = fx
            .dispatcher
            .submit(fx.user, two_images(), cancel)
            .await
            .unwrap_err();
        let DispatchError::Detached { correlation_id } = err else {
            panic!("expected detach, got {err:?}");
        };
        assert_eq!(balance(&fx), 8);
        assert_eq!(fx.dispatcher.running_jobs(), 1);

        fx.dispatcher.shutdown_and_wait().await;

        assert_eq!(fx.dispatcher.running_jobs(), 0);
        let job = fx.dispatcher.job(&correlation_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.refunded);
        assert_eq!(balance(&fx), 10);
    }

    #[tokio::test]
    async fn non_terminal_webhooks_are_not_delivered() {
        let fx = fixture(Script::Silent, Duration::ZERO, RefundPolicy::default());
        let event = WebhookEvent::from_prediction(CogPrediction {
            id: CorrelationId::generate(),
            status: PredictionStatus::Processing,
            output: None,
            error: None,
        });
        assert_eq!(fx.dispatcher.deliver(&event), None);
        assert!(fx.dispatcher.correlator().is_empty());
    }
}
