//! Cheap metadata-only scoring used to rank candidates before any download.

use std::collections::HashMap;

use crate::providers::Candidate;

const TRUSTED_DOMAINS: &[(&str, f64)] = &[
    ("shutterstock.com", 0.9),
    ("istockphoto.com", 0.9),
    ("gettyimages.com", 0.9),
    ("adobe.com", 0.85),
    ("unsplash.com", 0.85),
    ("pexels.com", 0.8),
    ("freepik.com", 0.7),
    ("pngtree.com", 0.7),
    ("amazon.com", 0.6),
    ("ebay.com", 0.5),
];

const PENALTY_PATTERNS: &[&str] = &[
    "thumb",
    "small",
    "icon",
    "tiny",
    "mini",
    "preview",
    "placeholder",
    "loading",
    "spinner",
];

/// Scores candidates from URL and declared metadata alone. Higher is better.
pub(crate) struct CandidateScorer {
    provider_bonus: HashMap<String, f64>,
}

impl CandidateScorer {
    /// `providers` in priority order: the first earns the largest bonus.
    pub(crate) fn new(providers: &[String]) -> Self {
        let provider_bonus = providers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), 3.0_f64.min(providers.len() as f64) - idx as f64))
            .map(|(name, bonus)| (name, bonus.max(0.0)))
            .collect();
        Self { provider_bonus }
    }

    pub(crate) fn score(&self, candidate: &Candidate) -> f64 {
        let mut score = 0.0;
        let url = candidate.url.to_lowercase();

        // Format preference: lossless beats lossy.
        if url.contains(".png") {
            score += 10.0;
        } else if url.contains(".webp") {
            score += 5.0;
        }

        for (domain, trust) in TRUSTED_DOMAINS {
            if url.contains(domain) {
                score += trust * 10.0;
                break;
            }
        }

        if candidate.width > 0 && candidate.height > 0 {
            let mpx = (candidate.width as f64 * candidate.height as f64) / 1_000_000.0;
            score += (mpx * 5.0).min(20.0);
        }

        if PENALTY_PATTERNS.iter().any(|p| url.contains(p)) {
            score -= 15.0;
        }

        score += self
            .provider_bonus
            .get(&candidate.provider)
            .copied()
            .unwrap_or(0.0);

        score
    }

    /// Candidates sorted best-first; stable, so provider order breaks ties.
    pub(crate) fn rank(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.sort_by(|a, b| {
            self.score(b)
                .partial_cmp(&self.score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}
