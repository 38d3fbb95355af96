/// Per-model capability data the request builder and hydration need. The
/// provider exposes many more models; anything not special-cased here gets
/// the default size and quality sets.
pub const GPT_IMAGE_1: &str = "gpt-image-1";

pub const DEFAULT_SIZES: &[&str] = &["1024x1024", "1024x1792", "1792x1024"];
pub const DEFAULT_QUALITIES: &[&str] = &["standard", "hd"];

pub const GPT_IMAGE_1_SIZES: &[&str] = &["1024x1024", "1024x1536", "1536x1024"];

pub const FLUX_SIZES: &[&str] = &[
    "2752x1536",
    "1536x2752",
    "2048x2048",
    "3136x1344",
    "2496x1664",
    "1664x2496",
    "1856x2304",
    "2304x1856",
    "1344x3136",
];

pub fn available_sizes(model_id: &str) -> &'static [&'static str] {
    if model_id == GPT_IMAGE_1 {
        return GPT_IMAGE_1_SIZES;
    }
    if model_id.to_lowercase().contains("flux") {
        return FLUX_SIZES;
    }
    DEFAULT_SIZES
}

pub fn available_qualities(_model_id: &str) -> &'static [&'static str] {
    DEFAULT_QUALITIES
}

/// gpt-image-1 names its quality tiers differently; everything else takes
/// the quality verbatim.
pub fn wire_quality(model_id: &str, quality: &str) -> String {
    if model_id == GPT_IMAGE_1 && quality == "hd" {
        "high".to_string()
    } else {
        quality.to_string()
    }
}

/// The background parameter is only meaningful for gpt-image-1.
pub fn supports_background(model_id: &str) -> bool {
    model_id == GPT_IMAGE_1
}
