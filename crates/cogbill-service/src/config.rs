//! Service configuration.

use std::time::Duration;

use cogbill_cog::CogEndpoints;
use cogbill_core::PricingConfig;
use cogbill_engine::{DispatchOptions, JobTimeouts, RefundPolicy};

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/cogbill").
    pub data_dir: String,

    /// Service API key for upstream callers (bot, web frontend).
    pub service_api_key: Option<String>,

    /// Admin API key for grants.
    pub admin_api_key: Option<String>,

    /// Cog worker base URLs, one per job kind.
    pub cog_endpoints: CogEndpoints,

    /// Bearer token sent to the cog workers, if they sit behind a proxy.
    pub cog_bearer_token: Option<String>,

    /// Public URL of `POST /webhooks/cog`, sent with every submission.
    pub cog_webhook_url: String,

    /// Shared secret for `x-cog-signature` verification (optional).
    pub cog_webhook_secret: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds, for every route except job submission.
    pub request_timeout_seconds: u64,

    /// Per-kind job wait bounds.
    pub job_timeouts: JobTimeouts,

    /// How long a finished correlator entry is kept around.
    pub correlator_grace_seconds: u64,

    /// Refund decisions for jobs that did not deliver.
    pub refunds: RefundPolicy,

    /// Pricing configuration.
    pub pricing: PricingConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cog_base_url = env_or("COG_BASE_URL", "http://localhost:5000");
        let cog_endpoints = CogEndpoints {
            generation: env_or("COG_GENERATION_URL", &cog_base_url),
            upscale: env_or("COG_UPSCALE_URL", &cog_base_url),
            voiceover: env_or("COG_VOICEOVER_URL", &cog_base_url),
        };

        Self {
            listen_addr: env_or("LISTEN_ADDR", &defaults.listen_addr),
            data_dir: env_or("DATA_DIR", &defaults.data_dir),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            cog_endpoints,
            cog_bearer_token: std::env::var("COG_BEARER_TOKEN").ok(),
            cog_webhook_url: env_or("COG_WEBHOOK_URL", &defaults.cog_webhook_url),
            cog_webhook_secret: std::env::var("COG_WEBHOOK_SECRET").ok(),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            job_timeouts: JobTimeouts {
                generation: env_seconds("GENERATION_TIMEOUT_SECONDS")
                    .unwrap_or(defaults.job_timeouts.generation),
                upscale: env_seconds("UPSCALE_TIMEOUT_SECONDS")
                    .unwrap_or(defaults.job_timeouts.upscale),
                voiceover: env_seconds("VOICEOVER_TIMEOUT_SECONDS")
                    .unwrap_or(defaults.job_timeouts.voiceover),
            },
            correlator_grace_seconds: env_parse("CORRELATOR_GRACE_SECONDS")
                .unwrap_or(defaults.correlator_grace_seconds),
            refunds: RefundPolicy {
                on_timeout: env_parse("REFUND_ON_TIMEOUT").unwrap_or(defaults.refunds.on_timeout),
                on_failure: env_parse("REFUND_ON_FAILURE").unwrap_or(defaults.refunds.on_failure),
            },
            pricing: PricingConfig {
                generation_credits_per_image: env_parse("GENERATION_CREDITS_PER_IMAGE")
                    .unwrap_or(defaults.pricing.generation_credits_per_image),
                upscale_credits_2x: env_parse("UPSCALE_CREDITS_2X")
                    .unwrap_or(defaults.pricing.upscale_credits_2x),
                upscale_credits_4x: env_parse("UPSCALE_CREDITS_4X")
                    .unwrap_or(defaults.pricing.upscale_credits_4x),
                voiceover_chars_per_credit: env_parse("VOICEOVER_CHARS_PER_CREDIT")
                    .unwrap_or(defaults.pricing.voiceover_chars_per_credit),
            },
        }
    }

    /// Dispatcher options derived from this configuration.
    #[must_use]
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            pricing: self.pricing.clone(),
            timeouts: self.job_timeouts,
            refunds: self.refunds,
            webhook_url: self.cog_webhook_url.clone(),
        }
    }

    /// Correlator grace period.
    #[must_use]
    pub const fn correlator_grace(&self) -> Duration {
        Duration::from_secs(self.correlator_grace_seconds)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_seconds(key: &str) -> Option<Duration> {
    env_parse(key).map(Duration::from_secs)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/cogbill".into(),
            service_api_key: None,
            admin_api_key: None,
            cog_endpoints: CogEndpoints::single("http://localhost:5000"),
            cog_bearer_token: None,
            cog_webhook_url: "http://localhost:8080/webhooks/cog".into(),
            cog_webhook_secret: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            job_timeouts: JobTimeouts::default(),
            correlator_grace_seconds: 300,
            refunds: RefundPolicy::default(),
            pricing: PricingConfig::default(),
        }
    }
}
