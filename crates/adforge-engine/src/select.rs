//! Stage-1 candidate selection: download, validate, verify, persist one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use adforge_core::config::{QualityConfig, VerifyConfig};
use image::DynamicImage;
use sha2::{Digest, Sha256};

use crate::dedup::DedupSet;
use crate::fetch::ImageFetcher;
use crate::providers::Candidate;
use crate::score::CandidateScorer;
use crate::validate::validate_image;
use crate::verify::{Verification, VerifierGate};

const DOWNLOAD_ATTEMPTS: u32 = 2;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// A persisted, accepted candidate.
#[derive(Debug, Clone)]
pub(crate) struct Selection {
    pub(crate) path: PathBuf,
    pub(crate) source_url: String,
    pub(crate) provider: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) byte_size: u64,
    pub(crate) digest: String,
    pub(crate) verification: Option<Verification>,
}

struct BestCandidate {
    image: Arc<DynamicImage>,
    candidate: Candidate,
    digest: String,
    byte_size: u64,
    verification: Verification,
}

/// Walks score-ranked candidates until one passes the gates.
///
/// Individual candidate failures only mean "try the next one"; the selector
/// never errors to its caller — no acceptable image is an ordinary `None`.
pub(crate) struct CandidateSelector {
    pub(crate) fetcher: Arc<dyn ImageFetcher>,
    pub(crate) dedup: Arc<DedupSet>,
    pub(crate) verifier: Option<VerifierGate>,
    pub(crate) scorer: Arc<CandidateScorer>,
    pub(crate) quality: QualityConfig,
    pub(crate) verify_cfg: VerifyConfig,
}

impl CandidateSelector {
    /// Pick, persist, and return the best acceptable candidate. The artifact
    /// lands beside `dest_stem` with a `.png` extension when it carries
    /// alpha, `.jpg` otherwise.
    pub(crate) async fn select(
        &self,
        candidates: Vec<Candidate>,
        query: &str,
        dest_stem: &Path,
    ) -> Option<Selection> {
        let ranked = self.scorer.rank(candidates);
        let total = ranked.len();

        let mut best: Option<BestCandidate> = None;
        let mut best_combined = f64::NEG_INFINITY;
        let mut examined = 0usize;

        for candidate in ranked {
            if self.verifier.is_some() && examined >= self.verify_cfg.max_verify_candidates {
                tracing::info!(
                    examined,
                    best = best_combined,
                    "verify budget exhausted, falling back to best candidate"
                );
                break;
            }

            let Some(bytes) = self.fetch_with_retry(&candidate.url).await else {
                continue;
            };
            if bytes.len() < self.quality.min_file_bytes {
                continue;
            }

            let digest = hex_digest(&bytes);
            if !self.dedup.add_if_absent(&digest) {
                tracing::debug!(url = %candidate.url, "duplicate content digest, skipping");
                continue;
            }

            let byte_size = bytes.len() as u64;
            let image = match tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
                .await
            {
                Ok(Ok(image)) => Arc::new(image),
                Ok(Err(err)) => {
                    tracing::debug!(url = %candidate.url, "decode failed: {err:#}");
                    continue;
                }
                Err(err) => {
                    tracing::debug!("decode task join error: {err:#}");
                    continue;
                }
            };

            if let Err(rejection) = validate_image(&image, &self.quality) {
                tracing::debug!(url = %candidate.url, ?rejection, "candidate failed validation");
                continue;
            }

            let Some(gate) = self.verifier.as_ref().filter(|_| !query.is_empty()) else {
                // No verifier wired (or no query text): first valid image wins.
                return self
                    .persist(image, candidate, digest, byte_size, None, dest_stem)
                    .await;
            };

            examined += 1;
            let verification = match gate.verify(image.clone(), query.to_string()).await {
                Ok(v) => v,
                Err(err) => {
                    if self.verify_cfg.accept_on_model_failure {
                        tracing::warn!("verifier failed, accepting candidate: {err:#}");
                        return self
                            .persist(
                                image,
                                candidate,
                                digest,
                                byte_size,
                                Some(Verification {
                                    accepted: true,
                                    reason: "model_failure_accept".into(),
                                    ..Default::default()
                                }),
                                dest_stem,
                            )
                            .await;
                    }
                    tracing::warn!("verifier failed, rejecting candidate: {err:#}");
                    continue;
                }
            };

            tracing::info!(
                candidate = examined,
                clip = verification.clip_score,
                combined = verification.combined_score,
                "stage-1 verification"
            );

            if verification.clip_score >= self.verify_cfg.clip_accept {
                return self
                    .persist(image, candidate, digest, byte_size, Some(verification), dest_stem)
                    .await;
            }
            if verification.clip_score < self.verify_cfg.clip_reject {
                continue;
            }
            if verification.combined_score >= self.verify_cfg.combined_accept {
                return self
                    .persist(image, candidate, digest, byte_size, Some(verification), dest_stem)
                    .await;
            }

            if verification.combined_score > best_combined {
                best_combined = verification.combined_score;
                best = Some(BestCandidate {
                    image,
                    candidate,
                    digest,
                    byte_size,
                    verification,
                });
            }

            if examined >= self.verify_cfg.min_candidates_before_best
                && best_combined > self.verify_cfg.combined_reject
            {
                let best = best.take()?;
                tracing::info!(
                    examined,
                    combined = best_combined,
                    "using best-so-far candidate"
                );
                return self
                    .persist(
                        best.image,
                        best.candidate,
                        best.digest,
                        best.byte_size,
                        Some(best.verification),
                        dest_stem,
                    )
                    .await;
            }
        }

        if let Some(best) = best {
            if best_combined >= self.verify_cfg.combined_reject {
                tracing::info!(combined = best_combined, "using best candidate at loop end");
                return self
                    .persist(
                        best.image,
                        best.candidate,
                        best.digest,
                        best.byte_size,
                        Some(best.verification),
                        dest_stem,
                    )
                    .await;
            }
            tracing::warn!(
                combined = best_combined,
                threshold = self.verify_cfg.combined_reject,
                "best candidate below reject threshold"
            );
        }

        tracing::warn!(candidates = total, "no candidate passed selection");
        None
    }

    async fn fetch_with_retry(&self, url: &str) -> Option<Vec<u8>> {
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.fetcher.fetch(url).await {
                Ok(Some(bytes)) => return Some(bytes),
                Ok(None) => return None,
                Err(err) => {
                    tracing::debug!(url, attempt, "download failed: {err:#}");
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }
        None
    }

    async fn persist(
        &self,
        image: Arc<DynamicImage>,
        candidate: Candidate,
        digest: String,
        byte_size: u64,
        verification: Option<Verification>,
        dest_stem: &Path,
    ) -> Option<Selection> {
        let (width, height) = (image.width(), image.height());
        let stem = dest_stem.to_path_buf();
        let saved = tokio::task::spawn_blocking(move || save_image(&image, &stem)).await;
        match saved {
            Ok(Ok(path)) => {
                tracing::info!(
                    width,
                    height,
                    provider = %candidate.provider,
                    "candidate persisted"
                );
                Some(Selection {
                    path,
                    source_url: candidate.url,
                    provider: candidate.provider,
                    width,
                    height,
                    byte_size,
                    digest,
                    verification,
                })
            }
            Ok(Err(err)) => {
                tracing::warn!("persist failed: {err:#}");
                None
            }
            Err(err) => {
                tracing::warn!("persist task join error: {err:#}");
                None
            }
        }
    }
}

/// Write `.png` when alpha is present, `.jpg` (quality 95) otherwise.
pub(crate) fn save_image(image: &DynamicImage, dest_stem: &Path) -> anyhow::Result<PathBuf> {
    if image.color().has_alpha() {
        let path = dest_stem.with_extension("png");
        image.save_with_format(&path, image::ImageFormat::Png)?;
        Ok(path)
    } else {
        let path = dest_stem.with_extension("jpg");
        let file = std::fs::File::create(&path)?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 95);
        image.to_rgb8().write_with_encoder(encoder)?;
        Ok(path)
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
