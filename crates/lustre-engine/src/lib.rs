use std::env;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageReader;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

pub mod session;

pub use session::{ComparisonView, NewUpload, Overlay, SessionStore};

const DEFAULT_API_BASE: &str = "https://api.venice.ai/api/v1";
const DESCRIBE_MODEL: &str = "qwen-2.5-vl";
const DESCRIBE_TEMPERATURE: f64 = 0.7;
const DESCRIBE_MAX_TOKENS: u64 = 400;
const DESCRIBE_INSTRUCTION: &str = "First give a short, concise title (3-5 words) for this image, \
    then write a detailed prompt with which I can replicate this image with an AI image generator. \
    Format your response exactly like this - Title: [title] Prompt: [detailed prompt]";

/// Wire request for the upscale/enhance endpoint. Field names follow the
/// service's JSON contract, not ours.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleRequest {
    pub image_b64: String,
    pub scale: u32,
    pub enhance: bool,
    pub creativity: f64,
    pub adherence: f64,
    pub prompt: String,
}

impl UpscaleRequest {
    pub fn wire_body(&self) -> Value {
        json!({
            "image": self.image_b64,
            "scale": self.scale,
            "enhance": self.enhance,
            "enhanceCreativity": self.creativity,
            "replication": self.adherence,
            "enhancePrompt": self.prompt,
        })
    }
}

/// Wire request for the vision description endpoint: one image as a data
/// URL plus the fixed title/prompt instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct DescribeRequest {
    pub image_data_url: String,
}

impl DescribeRequest {
    pub fn wire_body(&self) -> Value {
        json!({
            "model": DESCRIBE_MODEL,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": DESCRIBE_INSTRUCTION },
                    { "type": "image_url", "image_url": { "url": self.image_data_url } },
                ],
            }],
            "temperature": DESCRIBE_TEMPERATURE,
            "max_tokens": DESCRIBE_MAX_TOKENS,
            "stream": false,
        })
    }
}

/// Enhancement/upscale service. Success is the raw bytes of the result
/// image; failures carry a human-readable message mined from the body.
pub trait UpscaleApi: Send + Sync {
    fn upscale(&self, request: &UpscaleRequest) -> Result<Vec<u8>>;
}

/// Vision description service. Success is the first choice's message
/// content, unparsed; [`extract_prompt`] pulls the reproduction prompt out.
pub trait DescribeApi: Send + Sync {
    fn describe(&self, request: &DescribeRequest) -> Result<String>;
}

pub struct HttpUpscaleClient {
    api_base: String,
    http: HttpClient,
}

impl HttpUpscaleClient {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env(),
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpUpscaleClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpscaleApi for HttpUpscaleClient {
    fn upscale(&self, request: &UpscaleRequest) -> Result<Vec<u8>> {
        let api_key = require_api_key()?;
        let endpoint = format!("{}/image/upscale", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&request.wire_body())
            .send()
            .with_context(|| format!("upscale request failed ({endpoint})"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(api_error_message(status.as_u16(), &body));
        }
        let bytes = response
            .bytes()
            .context("failed reading upscale response bytes")?
            .to_vec();
        if bytes.is_empty() {
            bail!("upscale response was empty");
        }
        Ok(bytes)
    }
}

pub struct HttpDescribeClient {
    api_base: String,
    http: HttpClient,
}

impl HttpDescribeClient {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env(),
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpDescribeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DescribeApi for HttpDescribeClient {
    fn describe(&self, request: &DescribeRequest) -> Result<String> {
        let api_key = require_api_key()?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&request.wire_body())
            .send()
            .with_context(|| format!("describe request failed ({endpoint})"))?;

        let status = response.status();
        let body = response
            .text()
            .context("failed reading describe response body")?;
        if !status.is_success() {
            bail!(api_error_message(status.as_u16(), &body));
        }

        let payload: Value =
            serde_json::from_str(&body).context("describe service returned invalid JSON")?;
        let content = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            bail!("describe response contained no content");
        }
        Ok(content.to_string())
    }
}

fn api_base_from_env() -> String {
    non_empty_env("VENICE_API_BASE")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn require_api_key() -> Result<String> {
    non_empty_env("VENICE_API_KEY")
        .ok_or_else(|| anyhow::anyhow!("Configuration error: VENICE_API_KEY not set"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Best-effort error message from a non-2xx body: structured JSON
/// `message`/`detail`/`error` fields, else the raw text, else the status.
pub fn api_error_message(status_code: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        for field in ["message", "detail", "error"] {
            if let Some(text) = parsed.get(field).and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return format!("API error {status_code}: {}", truncate_text(trimmed, 512));
    }
    format!("API error {status_code}")
}

/// Pulls the reproduction prompt out of a `Title: ... Prompt: ...` response.
/// The marker is matched case-insensitively anywhere in the text; when it is
/// absent the whole content is used verbatim.
pub fn extract_prompt(content: &str) -> String {
    const MARKER: &[u8] = b"prompt:";
    let found = content
        .as_bytes()
        .windows(MARKER.len())
        .position(|window| window.eq_ignore_ascii_case(MARKER));
    match found {
        Some(index) => content[index + MARKER.len()..].trim().to_string(),
        None => content.trim().to_string(),
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Self-describing data URL for the describe endpoint. The MIME type is
/// sniffed from the content, never from a file extension.
pub fn to_data_url(bytes: &[u8]) -> Result<String> {
    let format = image::guess_format(bytes).context("unrecognized image format")?;
    Ok(format!(
        "data:{};base64,{}",
        format.to_mime_type(),
        BASE64.encode(bytes)
    ))
}

/// Header-only dimension probe; corrupt or non-image data is an error, not
/// a panic.
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed sniffing image format")?
        .into_dimensions()
        .context("failed reading image dimensions")
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
