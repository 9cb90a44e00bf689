//! Image/query verification contract.
//!
//! The actual models (CLIP-style alignment, captioning) are collaborators;
//! the engine owns the serialization mutex and the threshold policy around
//! their scores.

use std::sync::{Arc, Mutex, PoisonError};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Outcome of one verification call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    /// Image/text alignment score in `[0, 1]`.
    pub clip_score: f64,
    /// Caption/query overlap score in `[0, 1]`.
    pub blip_score: f64,
    /// Weighted combination of the sub-scores.
    pub combined_score: f64,
    /// Generated caption, possibly empty.
    pub caption: String,
    /// The verifier's own accept decision at its configured thresholds.
    pub accepted: bool,
    /// Short machine-readable reason for the decision.
    pub reason: String,
}

/// A two-stage image/query verifier.
///
/// Implementations are not assumed reentrant; the engine serializes calls
/// through one mutex per verifier instance.
pub trait Verifier: Send + Sync {
    /// Stage 1: score a downloaded candidate against the query (strict
    /// thresholds).
    fn verify(&self, image: &DynamicImage, query: &str) -> anyhow::Result<Verification>;

    /// Stage 2: score the composed ad against the query (relaxed thresholds;
    /// overlays and gradients depress scores).
    fn verify_composed(&self, image: &DynamicImage, query: &str) -> anyhow::Result<Verification>;
}

/// Serializes calls into a (non-reentrant) verifier and moves the blocking
/// inference off the async runtime.
#[derive(Clone)]
pub(crate) struct VerifierGate {
    verifier: Arc<dyn Verifier>,
    lock: Arc<Mutex<()>>,
}

impl VerifierGate {
    pub(crate) fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self {
            verifier,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) async fn verify(
        &self,
        image: Arc<DynamicImage>,
        query: String,
    ) -> anyhow::Result<Verification> {
        self.call(image, query, false).await
    }

    pub(crate) async fn verify_composed(
        &self,
        image: Arc<DynamicImage>,
        query: String,
    ) -> anyhow::Result<Verification> {
        self.call(image, query, true).await
    }

    async fn call(
        &self,
        image: Arc<DynamicImage>,
        query: String,
        composed: bool,
    ) -> anyhow::Result<Verification> {
        let verifier = self.verifier.clone();
        let lock = self.lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if composed {
                verifier.verify_composed(&image, &query)
            } else {
                verifier.verify(&image, &query)
            }
        })
        .await
        .map_err(|err| anyhow::anyhow!("verifier task join error: {err:#}"))?
    }
}
