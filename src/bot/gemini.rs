//! Gemini API client: chat, image understanding and image generation.

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bot::message::Turn;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

/// A text answer plus the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub tokens: u32,
}

pub struct GeneratedImage {
    pub data: Vec<u8>,
    /// Text the model returned alongside the image, if any.
    pub caption: Option<String>,
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api { status: u16, message: String },
    Parse(String),
    /// The prompt or answer was blocked by safety filters.
    Blocked(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api { status, message } => write!(f, "API error {status}: {message}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Blocked(reason) => write!(f, "Blocked by Gemini ({reason})"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataOut,
    },
}

#[derive(Serialize)]
struct InlineDataOut {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<&'static str>,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
    #[serde(rename = "inlineData")]
    inline_data: Option<InlineData>,
    /// Thought summaries are not part of the answer.
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Debug)]
struct InlineData {
    data: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, GEMINI_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { api_key, base_url, client }
    }

    /// Continue a conversation: `history` (oldest first) followed by `prompt`.
    pub async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        history: &[Turn],
        prompt: &str,
    ) -> Result<Reply, Error> {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|t| Content {
                role: Some(t.role.as_str()),
                parts: vec![Part::Text { text: &t.text }],
            })
            .collect();
        contents.push(Content {
            role: Some("user"),
            parts: vec![Part::Text { text: prompt }],
        });

        let request = GenerateRequest {
            contents,
            system_instruction: system_prompt.map(|s| Content {
                role: None,
                parts: vec![Part::Text { text: s }],
            }),
            generation_config: None,
        };

        debug!("💬 Gemini {} ({} history turns)", model, history.len());
        let parsed = self.call(model, &request).await?;
        extract_text(parsed)
    }

    /// Ask about an image.
    pub async fn describe_image(
        &self,
        model: &str,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<Reply, Error> {
        info!("👁️ Describing image ({} bytes, {})", image.len(), mime_type);

        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::Inline {
                        inline_data: InlineDataOut {
                            mime_type: mime_type.to_string(),
                            data: base64::engine::general_purpose::STANDARD.encode(image),
                        },
                    },
                    Part::Text { text: prompt },
                ],
            }],
            system_instruction: None,
            generation_config: None,
        };

        let parsed = self.call(model, &request).await?;
        extract_text(parsed)
    }

    /// Generate an image from a text prompt.
    pub async fn generate_image(&self, model: &str, prompt: &str) -> Result<GeneratedImage, Error> {
        info!("🎨 Generating image: {}", prompt);

        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part::Text { text: prompt }],
            }],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            }),
        };

        let parsed = self.call(model, &request).await?;
        let image = extract_image(parsed)?;
        info!("🎨 Image generated: {} bytes", image.data.len());
        Ok(image)
    }

    async fn call(&self, model: &str, request: &GenerateRequest<'_>) -> Result<GenerateResponse, Error> {
        let url = format!("{}/{}:generateContent", self.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("failed to read response: {e}")))?;

        debug!("Gemini response status: {status}");
        parse_response(status.as_u16(), &body)
    }
}

fn parse_response(status: u16, body: &str) -> Result<GenerateResponse, Error> {
    let parsed: Result<GenerateResponse, _> = serde_json::from_str(body);

    if !(200..300).contains(&status) {
        let message = match parsed {
            Ok(GenerateResponse { error: Some(e), .. }) => e.message,
            _ => body.chars().take(300).collect(),
        };
        return Err(Error::Api { status, message });
    }

    let parsed = parsed.map_err(|e| Error::Parse(e.to_string()))?;
    if let Some(error) = parsed.error {
        return Err(Error::Api { status, message: error.message });
    }
    Ok(parsed)
}

/// Take the first candidate, or explain why there is none.
fn first_candidate(parsed: GenerateResponse) -> Result<(CandidateContent, u32), Error> {
    let tokens = parsed.usage_metadata.map(|u| u.total_token_count).unwrap_or(0);

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(Error::Blocked(reason));
    }

    let candidate = parsed
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or(Error::Empty)?;

    match candidate.content {
        Some(content) => Ok((content, tokens)),
        None => match candidate.finish_reason.as_deref() {
            Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => {
                Err(Error::Blocked(candidate.finish_reason.unwrap_or_default()))
            }
            _ => Err(Error::Empty),
        },
    }
}

fn extract_text(parsed: GenerateResponse) -> Result<Reply, Error> {
    let (content, tokens) = first_candidate(parsed)?;

    let text: String = content
        .parts
        .iter()
        .filter(|p| !p.thought)
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(Error::Empty);
    }
    Ok(Reply { text, tokens })
}

fn extract_image(parsed: GenerateResponse) -> Result<GeneratedImage, Error> {
    let (content, _) = first_candidate(parsed)?;

    let mut caption: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    for part in &content.parts {
        if let Some(ref inline) = part.inline_data {
            if data.is_none() {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&inline.data)
                    .map_err(|e| Error::Parse(format!("failed to decode base64: {e}")))?;
                data = Some(bytes);
            }
        } else if let Some(ref text) = part.text
            && !part.thought
            && !text.trim().is_empty()
        {
            caption.get_or_insert_with(String::new).push_str(text.trim());
        }
    }

    match data {
        Some(data) => Ok(GeneratedImage { data, caption }),
        None => Err(Error::Empty),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::message::Turn;

    #[test]
    fn test_text_parts_are_joined() {
        let body = r#"{
            "candidates": [{"content": {"parts": [
                {"text": "thinking...", "thought": true},
                {"text": "Hello, "},
                {"text": "world"}
            ]}}],
            "usageMetadata": {"totalTokenCount": 42}
        }"#;
        let reply = extract_text(parse_response(200, body).unwrap()).unwrap();
        assert_eq!(reply, Reply { text: "Hello, world".to_string(), tokens: 42 });
    }

    #[test]
    fn test_missing_usage_counts_zero_tokens() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "ok"}]}}]}"#;
        let reply = extract_text(parse_response(200, body).unwrap()).unwrap();
        assert_eq!(reply.tokens, 0);
    }

    #[test]
    fn test_blocked_prompt() {
        let body = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let err = extract_text(parse_response(200, body).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Blocked(ref r) if r == "SAFETY"));
    }

    #[test]
    fn test_blocked_candidate() {
        let body = r#"{"candidates": [{"finishReason": "SAFETY"}]}"#;
        let err = extract_text(parse_response(200, body).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
    }

    #[test]
    fn test_no_candidates_is_empty() {
        let err = extract_text(parse_response(200, "{}").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Empty));
    }

    #[test]
    fn test_api_error_message_surfaces() {
        let body = r#"{"error": {"code": 400, "message": "API key not valid"}}"#;
        let err = parse_response(400, body).err().unwrap();
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_json_error_body() {
        let err = parse_response(502, "<html>Bad Gateway</html>").err().unwrap();
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_extract_image_with_caption() {
        // "PNG" base64-encoded
        let body = r#"{"candidates": [{"content": {"parts": [
            {"text": "Here is your fox."},
            {"inlineData": {"mimeType": "image/png", "data": "UE5H"}}
        ]}}]}"#;
        let image = extract_image(parse_response(200, body).unwrap()).unwrap();
        assert_eq!(image.data, b"PNG");
        assert_eq!(image.caption.as_deref(), Some("Here is your fox."));
    }

    #[test]
    fn test_extract_image_without_image_is_empty() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "I can't draw that."}]}}]}"#;
        assert!(matches!(extract_image(parse_response(200, body).unwrap()), Err(Error::Empty)));
    }

    #[test]
    fn test_request_serialization() {
        let history = vec![Turn::user("hi"), Turn::model("hello")];
        let request = GenerateRequest {
            contents: history
                .iter()
                .map(|t| Content { role: Some(t.role.as_str()), parts: vec![Part::Text { text: &t.text }] })
                .collect(),
            system_instruction: Some(Content { role: None, parts: vec![Part::Text { text: "be brief" }] }),
            generation_config: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert!(json["systemInstruction"].get("role").is_none());
        assert!(json.get("generationConfig").is_none());
    }
}
