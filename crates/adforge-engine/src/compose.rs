//! Compositor contract, ad templates, the built-in geometric compositor,
//! and placeholder synthesis.

use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage, imageops};
use sha2::{Digest, Sha256};

/// Layout parameters for one ad variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdTemplate {
    /// Template name, recorded in logs.
    pub name: &'static str,
    /// Output canvas size.
    pub canvas: (u32, u32),
    /// Maximum size the product image is scaled into.
    pub product_max: (u32, u32),
    /// Top edge of the product placement.
    pub product_y: u32,
    /// Horizontal anchor: centered when `None`, else a left offset.
    pub product_x: Option<u32>,
    /// Height of the accent band along the bottom.
    pub band_height: u32,
}

const TEMPLATE_CENTERED: AdTemplate = AdTemplate {
    name: "centered",
    canvas: (1080, 1080),
    product_max: (650, 650),
    product_y: 220,
    product_x: None,
    band_height: 200,
};

const TEMPLATE_LEFT_ALIGNED: AdTemplate = AdTemplate {
    name: "left_aligned",
    canvas: (1080, 1080),
    product_max: (500, 500),
    product_y: 280,
    product_x: Some(60),
    band_height: 240,
};

const TEMPLATE_BANNER: AdTemplate = AdTemplate {
    name: "banner",
    canvas: (1080, 1080),
    product_max: (720, 540),
    product_y: 140,
    product_x: None,
    band_height: 320,
};

const TEMPLATE_CYCLE: [&AdTemplate; 3] =
    [&TEMPLATE_CENTERED, &TEMPLATE_LEFT_ALIGNED, &TEMPLATE_BANNER];

/// Cyclic template selection: row `idx` gets `cycle[idx mod len]`.
pub fn template_for(idx: usize) -> &'static AdTemplate {
    TEMPLATE_CYCLE[idx % TEMPLATE_CYCLE.len()]
}

/// Row text passed through to the compositor.
#[derive(Debug, Clone, Default)]
pub struct AdFields {
    /// Ad title / body text.
    pub title: String,
    /// Monetary mention ("50% off"), may be empty.
    pub monetary: String,
    /// Call to action ("buy now"), may be empty.
    pub cta: String,
    /// Dominant color name from the row, may be empty.
    pub color: String,
}

/// One composition request.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    /// The selected (unconditioned) product image.
    pub product_path: PathBuf,
    /// Background-removed alternate, when conditioning succeeded.
    pub conditioned_path: Option<PathBuf>,
    /// Force the unconditioned image even when an alternate exists.
    pub use_original: bool,
    /// Row text fields.
    pub fields: AdFields,
    /// Extension-less output stem; the compositor appends the extension
    /// matching the format it emits.
    pub output: PathBuf,
    /// Selected layout.
    pub template: AdTemplate,
}

/// Renders the final ad. Pixel-level recipes are collaborator territory.
pub trait Compositor: Send + Sync {
    /// Compose one ad and return the written path: `<output>.png` when the
    /// composition carries an alpha channel, `<output>.jpg` otherwise.
    /// Overwrites idempotently.
    fn compose(&self, request: &ComposeRequest) -> anyhow::Result<PathBuf>;
}

fn named_color(name: &str) -> Option<Rgb<u8>> {
    let rgb = match name.trim().to_lowercase().as_str() {
        "red" => [220, 20, 60],
        "blue" => [0, 102, 204],
        "green" => [34, 139, 34],
        "yellow" => [255, 193, 7],
        "orange" => [255, 102, 0],
        "pink" => [255, 105, 180],
        "purple" => [128, 0, 128],
        "black" => [45, 45, 45],
        "white" => [255, 255, 255],
        "brown" => [139, 69, 19],
        "grey" | "gray" => [128, 128, 128],
        _ => return None,
    };
    Some(Rgb(rgb))
}

/// Geometric default compositor: flat canvas, letterboxed product, accent
/// band tinted by the row's dominant color. Text overlay recipes belong to a
/// real compositor collaborator.
pub struct BasicCompositor;

impl BasicCompositor {
    fn canvas_colors(fields: &AdFields) -> (Rgb<u8>, Rgb<u8>) {
        let accent = named_color(&fields.color).unwrap_or(Rgb([100, 100, 100]));
        // Soft tint of the accent for the backdrop.
        let backdrop = Rgb([
            200u8.saturating_add(accent.0[0] / 16),
            200u8.saturating_add(accent.0[1] / 16),
            200u8.saturating_add(accent.0[2] / 16),
        ]);
        (backdrop, accent)
    }
}

impl Compositor for BasicCompositor {
    fn compose(&self, request: &ComposeRequest) -> anyhow::Result<PathBuf> {
        let template = &request.template;
        let source = if !request.use_original {
            request
                .conditioned_path
                .as_deref()
                .unwrap_or(&request.product_path)
        } else {
            &request.product_path
        };
        let product = image::open(source)?;

        let (backdrop, accent) = Self::canvas_colors(&request.fields);
        let (cw, ch) = template.canvas;
        let mut canvas = RgbaImage::from_pixel(
            cw,
            ch,
            Rgba([backdrop.0[0], backdrop.0[1], backdrop.0[2], 255]),
        );

        // Accent band along the bottom, where a text compositor would land
        // the discount and call-to-action.
        let band_top = ch.saturating_sub(template.band_height);
        for y in band_top..ch {
            for x in 0..cw {
                canvas.put_pixel(x, y, Rgba([accent.0[0], accent.0[1], accent.0[2], 255]));
            }
        }

        let (max_w, max_h) = template.product_max;
        let scaled = product.resize(max_w, max_h, imageops::FilterType::Triangle);
        let x = match template.product_x {
            Some(x) => x,
            None => (cw.saturating_sub(scaled.width())) / 2,
        };
        imageops::overlay(&mut canvas, &scaled, x as i64, template.product_y as i64);

        // The canvas is fully opaque, so this compositor always lands on the
        // JPEG branch of the extension rule.
        let path = request.output.with_extension("jpg");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::File::create(&path)?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 95);
        DynamicImage::ImageRgba8(canvas)
            .to_rgb8()
            .write_with_encoder(encoder)?;
        Ok(path)
    }
}

/// Deterministic fallback canvas for rows where no candidate survived.
///
/// Derived from the query fingerprint so identical queries produce identical
/// placeholders; the row text still lands on it through the normal compose
/// step.
pub fn placeholder_image(query: &str, width: u32, height: u32) -> DynamicImage {
    // Same normalization as the query fingerprint, so identical queries get
    // identical placeholders.
    let normalized = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let seed = Sha256::digest(normalized.as_bytes());
    let base = [seed[0], seed[1], seed[2]];

    let img = RgbImage::from_fn(width.max(1), height.max(1), |x, y| {
        let fx = x as f64 / width.max(1) as f64;
        let fy = y as f64 / height.max(1) as f64;
        let shade = |c: u8, f: f64| (60.0 + (c as f64 / 255.0) * 140.0 * f) as u8;
        Rgb([
            shade(base[0], 0.5 + fx / 2.0),
            shade(base[1], 0.5 + fy / 2.0),
            shade(base[2], 0.5 + (fx + fy) / 4.0),
        ])
    });
    DynamicImage::ImageRgb8(img)
}
