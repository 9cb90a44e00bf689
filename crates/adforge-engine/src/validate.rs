//! Gates applied to decoded candidate images before any verification spend.

use std::collections::HashSet;

use adforge_core::config::QualityConfig;
use image::DynamicImage;

/// Why a decoded candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    TooSmall,
    BadAspect,
    LowContrast,
    TooFewColors,
}

const SAMPLE_EDGE: u32 = 128;

/// Check the decoded image against the configured quality gates.
pub(crate) fn validate_image(img: &DynamicImage, cfg: &QualityConfig) -> Result<(), Rejection> {
    let (width, height) = (img.width(), img.height());
    if width < cfg.min_width || height < cfg.min_height {
        return Err(Rejection::TooSmall);
    }

    let aspect = width as f64 / height as f64;
    if aspect < cfg.min_aspect || aspect > cfg.max_aspect {
        return Err(Rejection::BadAspect);
    }

    // Near-solid detection works on a bounded sample so huge downloads do
    // not dominate the row budget.
    let sample = if width > SAMPLE_EDGE || height > SAMPLE_EDGE {
        img.thumbnail(SAMPLE_EDGE, SAMPLE_EDGE).to_rgb8()
    } else {
        img.to_rgb8()
    };

    if channel_std_dev(&sample) < cfg.min_std_dev {
        return Err(Rejection::LowContrast);
    }
    if distinct_colors(&sample) < cfg.min_unique_colors {
        return Err(Rejection::TooFewColors);
    }
    Ok(())
}

fn channel_std_dev(img: &image::RgbImage) -> f64 {
    let raw = img.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    let n = raw.len() as f64;
    let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = raw
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt()
}

fn distinct_colors(img: &image::RgbImage) -> usize {
    let mut seen: HashSet<[u8; 3]> = HashSet::new();
    for pixel in img.pixels() {
        seen.insert(pixel.0);
    }
    seen.len()
}
