use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::DriftError;
use crate::models;

pub const DEFAULT_API_BASE: &str = "https://api.voidai.app/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    Auto,
    Opaque,
    Transparent,
}

impl Background {
    pub fn as_str(&self) -> &'static str {
        match self {
            Background::Auto => "auto",
            Background::Opaque => "opaque",
            Background::Transparent => "transparent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Moderation {
    Auto,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

/// Parameters for one generation call. Optional fields are omitted from
/// the wire body when unset; `background` is additionally dropped for
/// models that do not understand it.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub prompt: String,
    /// "WxH"; must come from the model's supported set. Default 1024x1024.
    pub size: String,
    /// Images per request. Default 1.
    pub quantity: u32,
    /// "standard" or "hd"; mapped to the model's wire vocabulary. Default
    /// "standard".
    pub quality: String,
    pub negative_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub background: Option<Background>,
    pub moderation: Option<Moderation>,
    pub output_format: Option<OutputFormat>,
    /// 0-100, only meaningful alongside a compressed `output_format`.
    pub output_compression: Option<u8>,
}

impl GenerationOptions {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            size: "1024x1024".to_string(),
            quantity: 1,
            quality: "standard".to_string(),
            negative_prompt: None,
            temperature: None,
            background: None,
            moderation: None,
            output_format: None,
            output_compression: None,
        }
    }
}

/// Parameters for one edit call; the binary attachments travel separately
/// as staged [`SourceImage`]s.
#[derive(Debug, Clone)]
pub struct EditOptions {
    pub model: String,
    pub prompt: String,
    pub background: Option<Background>,
}

/// A user-supplied file staged for an edit request. Session-only, never
/// persisted.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct GenerationResponse {
    pub data: Vec<ImagePayload>,
    pub created: i64,
    pub model: String,
}

/// One result item: a hosted URL, an inline base64 payload, or (from a
/// misbehaving provider) neither.
#[derive(Debug, Deserialize)]
pub struct ImagePayload {
    pub url: Option<String>,
    pub b64_json: Option<String>,
}

/// Thin client for the generation and edit endpoints. Authentication is a
/// bearer token per request; no retry, no timeout beyond the transport's.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    http: Client,
    base_url: String,
}

impl Default for GenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn generate(
        &self,
        options: &GenerationOptions,
        api_key: &str,
    ) -> Result<GenerationResponse, DriftError> {
        let body = build_generation_body(options);
        debug!(model = %options.model, n = options.quantity, "dispatching generation request");
        let response = self
            .http
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let response = assert_ok(response).await?;
        Ok(response.json().await?)
    }

    pub async fn edit(
        &self,
        options: &EditOptions,
        sources: &[SourceImage],
        api_key: &str,
    ) -> Result<GenerationResponse, DriftError> {
        let mut form = Form::new()
            .text("prompt", options.prompt.clone())
            .text("model", options.model.clone());
        for source in sources {
            let part = Part::bytes(source.bytes.clone())
                .file_name(source.name.clone())
                .mime_str(&source.mime_type)?;
            form = form.part("image", part);
        }
        if let Some(background) = options.background {
            if models::supports_background(&options.model) {
                form = form.text("background", background.as_str());
            }
        }
        debug!(model = %options.model, attachments = sources.len(), "dispatching edit request");
        let response = self
            .http
            .post(format!("{}/images/edits", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        let response = assert_ok(response).await?;
        Ok(response.json().await?)
    }
}

fn build_generation_body(options: &GenerationOptions) -> serde_json::Value {
    let mut body = json!({
        "model": options.model,
        "prompt": options.prompt,
        "size": options.size,
        "n": options.quantity,
        "quality": models::wire_quality(&options.model, &options.quality),
    });
    if let Some(negative) = options.negative_prompt.as_deref() {
        if !negative.trim().is_empty() {
            body["negative_prompt"] = json!(negative);
        }
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(background) = options.background {
        if models::supports_background(&options.model) {
            body["background"] = json!(background);
        }
    }
    if let Some(moderation) = options.moderation {
        body["moderation"] = json!(moderation);
    }
    if let Some(format) = options.output_format {
        body["output_format"] = json!(format);
    }
    if let Some(compression) = options.output_compression {
        body["output_compression"] = json!(compression.min(100));
    }
    body
}

async fn assert_ok(response: reqwest::Response) -> Result<reqwest::Response, DriftError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(DriftError::RemoteRejected { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_holds_only_set_fields() {
        let options = GenerationOptions::new("flux", "a quiet harbor");
        let body = build_generation_body(&options);
        assert_eq!(body["model"], "flux");
        assert_eq!(body["n"], 1);
        assert_eq!(body["quality"], "standard");
        assert!(body.get("negative_prompt").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("background").is_none());
    }

    #[test]
    fn hd_quality_is_rewritten_for_gpt_image_1() {
        let mut options = GenerationOptions::new(models::GPT_IMAGE_1, "p");
        options.quality = "hd".to_string();
        let body = build_generation_body(&options);
        assert_eq!(body["quality"], "high");
    }

    #[test]
    fn background_is_dropped_for_models_without_support() {
        let mut options = GenerationOptions::new("flux", "p");
        options.background = Some(Background::Transparent);
        assert!(build_generation_body(&options).get("background").is_none());

        options.model = models::GPT_IMAGE_1.to_string();
        let body = build_generation_body(&options);
        assert_eq!(body["background"], "transparent");
    }

    #[test]
    fn blank_negative_prompt_is_omitted() {
        let mut options = GenerationOptions::new("flux", "p");
        options.negative_prompt = Some("   ".to_string());
        assert!(
            build_generation_body(&options)
                .get("negative_prompt")
                .is_none()
        );
    }

    #[test]
    fn output_compression_is_clamped() {
        let mut options = GenerationOptions::new("flux", "p");
        options.output_format = Some(OutputFormat::Webp);
        options.output_compression = Some(200);
        let body = build_generation_body(&options);
        assert_eq!(body["output_format"], "webp");
        assert_eq!(body["output_compression"], 100);
    }

    #[test]
    fn response_items_may_carry_url_or_inline_payload() {
        let raw = r#"{
            "data": [{"url": "https://img.example/a.png"}, {"b64_json": "aGk="}],
            "created": 1700000000,
            "model": "gpt-image-1"
        }"#;
        let response: GenerationResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data.len(), 2);
        assert_eq!(
            response.data[0].url.as_deref(),
            Some("https://img.example/a.png")
        );
        assert_eq!(response.data[1].b64_json.as_deref(), Some("aGk="));
    }
}
