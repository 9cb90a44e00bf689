//! Background conditioning: the removal model contract, the sanity gate the
//! engine wraps around any model, and a model-free default conditioner.

use std::sync::{Arc, Mutex, PoisonError};

use adforge_core::config::BackgroundConfig;
use image::{DynamicImage, RgbaImage};

/// Alpha above this counts as a retained pixel in all mask metrics.
const ALPHA_KEPT: u8 = 10;

/// A background-removal model. Implementations need not be reentrant; the
/// engine serializes calls through one process-wide mutex.
pub trait BackgroundConditioner: Send + Sync {
    /// Produce an RGBA rendition of `image` with background pixels made
    /// transparent.
    fn remove(&self, image: &DynamicImage) -> anyhow::Result<RgbaImage>;
}

/// Whether removal should be attempted for this query at all. Scene-like
/// queries (a highway, a crowd) keep their background.
pub(crate) fn should_attempt(query: &str, cfg: &BackgroundConfig) -> bool {
    let low = query.to_lowercase();
    !cfg.scene_keywords.iter().any(|kw| low.contains(kw.as_str()))
}

#[derive(Debug)]
pub(crate) struct ConditionOutcome {
    /// True when the caller should stick with the unconditioned image.
    pub(crate) use_original: bool,
    /// The accepted conditioned image, present iff `use_original` is false.
    pub(crate) output: Option<RgbaImage>,
    pub(crate) retained_ratio: f64,
}

/// Sanity-check a removal result against the configured gates.
///
/// Rejections fall back to the original image: removal that kept almost
/// nothing (unless it is small-but-coherent), removal that kept everything,
/// or a retained object that is tiny or mostly hollow.
pub(crate) fn gate_removal(
    result: RgbaImage,
    source_pixels: u64,
    cfg: &BackgroundConfig,
) -> ConditionOutcome {
    let kept = result.pixels().filter(|p| p.0[3] > ALPHA_KEPT).count() as u64;
    let ratio = kept as f64 / source_pixels.max(1) as f64;

    if ratio < cfg.min_retention {
        if ratio >= 0.01 && coherent(&result, cfg.min_fill_ratio) {
            return ConditionOutcome {
                use_original: false,
                output: Some(result),
                retained_ratio: ratio,
            };
        }
        tracing::debug!(ratio, "removal too aggressive, keeping original");
        return ConditionOutcome {
            use_original: true,
            output: None,
            retained_ratio: ratio,
        };
    }

    if ratio > cfg.max_retention {
        tracing::debug!(ratio, "removal changed nothing, keeping original");
        return ConditionOutcome {
            use_original: true,
            output: None,
            retained_ratio: ratio,
        };
    }

    if let Some((bbox_area, _)) = mask_bbox(&result) {
        let canvas = (result.width() as u64 * result.height() as u64).max(1);
        if (bbox_area as f64) / (canvas as f64) < cfg.min_object_ratio {
            tracing::debug!(ratio, "retained object too small, keeping original");
            return ConditionOutcome {
                use_original: true,
                output: None,
                retained_ratio: ratio,
            };
        }
    }

    ConditionOutcome {
        use_original: false,
        output: Some(result),
        retained_ratio: ratio,
    }
}

/// Bounding box of retained pixels: `(area, filled-pixel count)`.
fn mask_bbox(img: &RgbaImage) -> Option<(u64, u64)> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut filled = 0u64;

    for (x, y, p) in img.enumerate_pixels() {
        if p.0[3] > ALPHA_KEPT {
            filled += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if filled == 0 {
        return None;
    }
    let area = (max_x - min_x + 1) as u64 * (max_y - min_y + 1) as u64;
    Some((area, filled))
}

fn coherent(img: &RgbaImage, min_fill_ratio: f64) -> bool {
    match mask_bbox(img) {
        Some((area, filled)) => (filled as f64 / area.max(1) as f64) >= min_fill_ratio,
        None => false,
    }
}

/// Serializes conditioner calls and applies the sanity gate.
#[derive(Clone)]
pub(crate) struct ConditionerGate {
    conditioner: Arc<dyn BackgroundConditioner>,
    lock: Arc<Mutex<()>>,
    cfg: BackgroundConfig,
}

impl ConditionerGate {
    pub(crate) fn new(conditioner: Arc<dyn BackgroundConditioner>, cfg: BackgroundConfig) -> Self {
        Self {
            conditioner,
            lock: Arc::new(Mutex::new(())),
            cfg,
        }
    }

    /// Run removal under the process-wide model mutex. Any model error falls
    /// back to the original image.
    pub(crate) async fn condition(&self, image: Arc<DynamicImage>) -> ConditionOutcome {
        let conditioner = self.conditioner.clone();
        let lock = self.lock.clone();
        let cfg = self.cfg.clone();
        let source_pixels = image.width() as u64 * image.height() as u64;

        let result = tokio::task::spawn_blocking(move || {
            let removed = {
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                conditioner.remove(&image)?
            };
            anyhow::Ok(gate_removal(removed, source_pixels, &cfg))
        })
        .await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!("background removal failed, keeping original: {err:#}");
                ConditionOutcome {
                    use_original: true,
                    output: None,
                    retained_ratio: 0.0,
                }
            }
            Err(err) => {
                tracing::warn!("background removal join error: {err:#}");
                ConditionOutcome {
                    use_original: true,
                    output: None,
                    retained_ratio: 0.0,
                }
            }
        }
    }
}

/// Model-free conditioner: flood-fills from the image border over pixels
/// close to the dominant border color and clears their alpha. Works for the
/// flat studio backgrounds typical of product shots; anything busier gets
/// rejected by the sanity gate and falls back to the original.
pub struct BorderFloodConditioner {
    tolerance: u32,
}

impl BorderFloodConditioner {
    /// `tolerance` is the maximum squared per-channel color distance treated
    /// as background.
    pub fn new(tolerance: u32) -> Self {
        Self { tolerance }
    }
}

impl Default for BorderFloodConditioner {
    fn default() -> Self {
        Self::new(2_500)
    }
}

fn color_distance_sq(a: [u8; 4], b: [u8; 3]) -> u32 {
    let dr = a[0] as i32 - b[0] as i32;
    let dg = a[1] as i32 - b[1] as i32;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

impl BackgroundConditioner for BorderFloodConditioner {
    fn remove(&self, image: &DynamicImage) -> anyhow::Result<RgbaImage> {
        let mut rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("empty image");
        }

        // Dominant border color, coarsely quantized.
        let mut counts: std::collections::HashMap<[u8; 3], u32> = std::collections::HashMap::new();
        let mut border = Vec::new();
        for x in 0..width {
            border.push((x, 0));
            border.push((x, height - 1));
        }
        for y in 0..height {
            border.push((0, y));
            border.push((width - 1, y));
        }
        for &(x, y) in &border {
            let p = rgba.get_pixel(x, y).0;
            let key = [p[0] & 0xf0, p[1] & 0xf0, p[2] & 0xf0];
            *counts.entry(key).or_insert(0) += 1;
        }
        let background = counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(c, _)| [c[0] | 0x08, c[1] | 0x08, c[2] | 0x08])
            .unwrap_or([255, 255, 255]);

        // Flood fill from border pixels that match the background color.
        let mut visited = vec![false; (width * height) as usize];
        let mut stack: Vec<(u32, u32)> = border
            .into_iter()
            .filter(|&(x, y)| color_distance_sq(rgba.get_pixel(x, y).0, background) <= self.tolerance)
            .collect();

        while let Some((x, y)) = stack.pop() {
            let idx = (y * width + x) as usize;
            if visited[idx] {
                continue;
            }
            visited[idx] = true;

            let p = rgba.get_pixel_mut(x, y);
            if color_distance_sq(p.0, background) > self.tolerance {
                continue;
            }
            p.0[3] = 0;

            if x > 0 {
                stack.push((x - 1, y));
            }
            if x + 1 < width {
                stack.push((x + 1, y));
            }
            if y > 0 {
                stack.push((x, y - 1));
            }
            if y + 1 < height {
                stack.push((x, y + 1));
            }
        }

        Ok(rgba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BackgroundConfig {
        BackgroundConfig::default()
    }

    fn mask(width: u32, height: u32, kept: impl Fn(u32, u32) -> bool) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            if kept(x, y) {
                image::Rgba([200, 50, 50, 255])
            } else {
                image::Rgba([0, 0, 0, 0])
            }
        })
    }

    #[test]
    fn scene_keywords_skip_removal() {
        let cfg = cfg();
        assert!(should_attempt("red sneakers", &cfg));
        assert!(!should_attempt("sneakers on a Highway", &cfg));
        assert!(!should_attempt("cozy interior lamp", &cfg));
    }

    #[test]
    fn healthy_mask_is_accepted() {
        // Centered solid square, ~25% retention.
        let result = mask(100, 100, |x, y| (25..75).contains(&x) && (25..75).contains(&y));
        let out = gate_removal(result, 100 * 100, &cfg());
        assert!(!out.use_original);
        assert!((out.retained_ratio - 0.25).abs() < 0.01);
    }

    #[test]
    fn keeping_everything_falls_back() {
        let result = mask(100, 100, |_, _| true);
        let out = gate_removal(result, 100 * 100, &cfg());
        assert!(out.use_original);
    }

    #[test]
    fn keeping_almost_nothing_falls_back() {
        let result = mask(100, 100, |x, y| x < 2 && y < 2);
        let out = gate_removal(result, 100 * 100, &cfg());
        assert!(out.use_original);
    }

    #[test]
    fn small_but_coherent_object_is_kept() {
        // 4% retention: below min_retention but >= 1% and solidly filled.
        let result = mask(100, 100, |x, y| (40..60).contains(&x) && (40..60).contains(&y));
        let out = gate_removal(result, 100 * 100, &cfg());
        assert!(!out.use_original);
    }

    #[test]
    fn hollow_sparse_mask_falls_back() {
        // Two distant dots: ratio ~0.02%, bbox huge and hollow.
        let result = mask(100, 100, |x, y| (x, y) == (0, 0) || (x, y) == (99, 99));
        let out = gate_removal(result, 100 * 100, &cfg());
        assert!(out.use_original);
    }

    #[test]
    fn border_flood_clears_flat_background() {
        // Red square on a white background.
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(80, 80, |x, y| {
            if (20..60).contains(&x) && (20..60).contains(&y) {
                image::Rgb([200, 30, 30])
            } else {
                image::Rgb([250, 250, 250])
            }
        }));

        let out = BorderFloodConditioner::default().remove(&img).unwrap();
        assert_eq!(out.get_pixel(0, 0).0[3], 0);
        assert_eq!(out.get_pixel(40, 40).0[3], 255);

        let gated = gate_removal(out, 80 * 80, &cfg());
        assert!(!gated.use_original);
    }
}
