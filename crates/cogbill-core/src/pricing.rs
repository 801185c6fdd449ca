//! Pricing configuration for cogbill.
//!
//! Job cost is a pure function of the job parameters so callers can show a
//! price before submitting.

use serde::{Deserialize, Serialize};

use crate::JobSpec;

/// Pixel area covered by one generation credit (512 x 512).
pub const BASE_PIXEL_AREA: u64 = 512 * 512;

/// Pricing for all job kinds, in credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Credits per generated image at [`BASE_PIXEL_AREA`].
    pub generation_credits_per_image: i64,

    /// Credits per upscale at 2x.
    pub upscale_credits_2x: i64,

    /// Credits per upscale at 4x.
    pub upscale_credits_4x: i64,

    /// Characters of voiceover text covered by one credit.
    pub voiceover_chars_per_credit: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            generation_credits_per_image: 1,
            upscale_credits_2x: 1,
            upscale_credits_4x: 2,
            voiceover_chars_per_credit: 100,
        }
    }
}

impl PricingConfig {
    /// Calculate the cost of a job.
    ///
    /// Minimum cost is 1 credit for any job. Generation scales with the
    /// output count and with the pixel area, rounded up to whole base areas.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn job_cost(&self, spec: &JobSpec) -> i64 {
        let cost = match spec {
            JobSpec::Generation {
                num_outputs,
                width,
                height,
                ..
            } => {
                let area = u64::from(*width) * u64::from(*height);
                let units = area.div_ceil(BASE_PIXEL_AREA).max(1) as i64;
                i64::from(*num_outputs) * units * self.generation_credits_per_image
            }
            JobSpec::Upscale { scale, .. } => {
                if *scale >= 4 {
                    self.upscale_credits_4x
                } else {
                    self.upscale_credits_2x
                }
            }
            JobSpec::Voiceover { text, .. } => {
                let chars = text.chars().count() as u64;
                chars.div_ceil(self.voiceover_chars_per_credit.max(1)) as i64
            }
        };
        cost.max(1)
    }
}
