//! Path-embedded image transformations.
//!
//! A transformation is rendered as a comma-separated segment placed between
//! the transform base URL and the object key:
//!
//! ```text
//! https://img.example.com/w_400,h_300,c_fill,q_auto,f_auto/products/sku-1/front.jpg
//! ```

use std::fmt;

/// How to fit the image into the requested box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crop {
    Fill,
    Fit,
    Scale,
    Thumb,
}

impl Crop {
    fn as_str(&self) -> &'static str {
        match self {
            Crop::Fill => "fill",
            Crop::Fit => "fit",
            Crop::Scale => "scale",
            Crop::Thumb => "thumb",
        }
    }
}

/// Resize, quality and format parameters applied when the image is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageTransform {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: Option<Crop>,
    /// Fixed quality 1-100; `None` lets the server pick.
    pub quality: Option<u8>,
    pub auto_quality: bool,
    pub auto_format: bool,
    pub auto_dpr: bool,
}

impl ImageTransform {
    /// Delivery defaults for product pages: automatic format, quality and
    /// device pixel ratio, filled to the box when both sides are given.
    pub fn optimized(width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            width,
            height,
            crop: (width.is_some() && height.is_some()).then_some(Crop::Fill),
            quality: None,
            auto_quality: true,
            auto_format: true,
            auto_dpr: true,
        }
    }

    /// Tiny low-quality rendition used as a blurred loading placeholder.
    pub fn blur_placeholder() -> Self {
        Self {
            width: Some(20),
            height: Some(20),
            crop: Some(Crop::Fill),
            quality: Some(50),
            ..Default::default()
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Render the path segment, e.g. `w_400,h_300,c_fill,q_auto,f_auto`.
    pub fn segment(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(w) = self.width {
            parts.push(format!("w_{}", w));
        }
        if let Some(h) = self.height {
            parts.push(format!("h_{}", h));
        }
        if let Some(crop) = self.crop {
            parts.push(format!("c_{}", crop.as_str()));
        }
        match self.quality {
            Some(q) => parts.push(format!("q_{}", q.clamp(1, 100))),
            None if self.auto_quality => parts.push("q_auto".to_string()),
            None => {}
        }
        if self.auto_format {
            parts.push("f_auto".to_string());
        }
        if self.auto_dpr {
            parts.push("dpr_auto".to_string());
        }
        parts.join(",")
    }
}

impl fmt::Display for ImageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segment())
    }
}

/// `{base}/{segment}/{key}`, or `{base}/{key}` for the identity transform.
pub fn transform_url(base: &str, key: &str, transform: &ImageTransform) -> String {
    let base = base.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if transform.is_identity() {
        format!("{}/{}", base, key)
    } else {
        format!("{}/{}/{}", base, transform.segment(), key)
    }
}
