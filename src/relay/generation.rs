//! Client for the remote generation API.
//!
//! The relay only needs one call: upload an audio window and get back the parts of the
//! first candidate. [`GenerationApi`] is the seam the relay session depends on, so tests
//! and alternative backends can stand in for [`GeminiClient`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::chunker::AudioChunk;
use super::messages::ReplyFragment;
use super::retry::RateLimitSignal;
use crate::config::GenerationConfig;

const USER_AGENT: &str = concat!("voice-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum GenerationError {
    /// HTTP 429; the only retryable condition
    #[error("rate limited by the generation API")]
    RateLimited,

    #[error("generation API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Connection failures and timeouts. Not retried.
    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unusable generation reply: {0}")]
    Decode(String),
}

impl RateLimitSignal for GenerationError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, GenerationError::RateLimited)
    }
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Upload one chunk and return the reply parts in API order.
    async fn generate(&self, chunk: &AudioChunk) -> Result<Vec<ReplyFragment>, GenerationError>;
}

// Request/response bodies of `models/{model}:generateContent`

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestPart<'a> {
    inline_data: RequestInlineData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestInlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<ResponseInlineData>,
}

#[derive(Debug, Deserialize)]
struct ResponseInlineData {
    data: String,
}

impl GenerateContentResponse {
    /// Flatten the first candidate into fragments. A part may carry both text and audio;
    /// text goes first.
    pub(crate) fn into_fragments(self) -> Result<Vec<ReplyFragment>, GenerationError> {
        let parts = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();

        let mut fragments = Vec::with_capacity(parts.len());
        for part in parts {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                fragments.push(ReplyFragment::Text(text));
            }
            if let Some(inline) = part.inline_data {
                let audio = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|e| GenerationError::Decode(format!("inline audio: {}", e)))?;
                fragments.push(ReplyFragment::AudioBytes(Bytes::from(audio)));
            }
        }
        Ok(fragments)
    }
}

/// `generateContent` over HTTPS.
pub struct GeminiClient {
    http: Client,
    endpoint: String,
    api_key: String,
    mime_type: String,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: Self::endpoint(&config.base_url, &config.model),
            api_key: config.api_key.clone(),
            mime_type: config.mime_type.clone(),
        })
    }

    fn endpoint(base_url: &str, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model
        )
    }

    fn request_body<'a>(&'a self, chunk: &AudioChunk) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart {
                    inline_data: RequestInlineData {
                        mime_type: &self.mime_type,
                        data: BASE64.encode(&chunk.data),
                    },
                }],
            }],
        }
    }
}

#[async_trait]
impl GenerationApi for GeminiClient {
    async fn generate(&self, chunk: &AudioChunk) -> Result<Vec<ReplyFragment>, GenerationError> {
        debug!(
            chunk = chunk.ordinal,
            bytes = chunk.len(),
            "Uploading chunk to generation API"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(chunk))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
        body.into_fragments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use std::sync::Mutex;

    type Seen = web::Data<Mutex<Vec<(String, serde_json::Value)>>>;

    /// Stand-in for `generateContent`; the model name in the path picks the outcome.
    async fn fake_generate(
        req: HttpRequest,
        body: web::Json<serde_json::Value>,
        seen: Seen,
    ) -> HttpResponse {
        let key = req
            .headers()
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        seen.lock().unwrap().push((key, body.into_inner()));

        let path = req.path();
        if path.ends_with("/limited:generateContent") {
            HttpResponse::TooManyRequests().body("quota exceeded")
        } else if path.ends_with("/broken:generateContent") {
            HttpResponse::InternalServerError().body("backend exploded")
        } else if path.ends_with("/garbled:generateContent") {
            HttpResponse::Ok()
                .content_type("application/json")
                .body("{not json")
        } else {
            HttpResponse::Ok().json(serde_json::json!({
                "candidates": [{
                    "content": {"parts": [
                        {"text": "Hi there"},
                        {"inlineData": {"mimeType": "audio/wav", "data": "UklGRg=="}}
                    ]}
                }]
            }))
        }
    }

    fn start_fake_api() -> (String, Seen) {
        let seen: Seen = web::Data::new(Mutex::new(Vec::new()));
        let app_seen = seen.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_seen.clone())
                .default_service(web::to(fake_generate))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        (format!("http://{}", addr), seen)
    }

    fn client_for(base_url: &str, model: &str) -> GeminiClient {
        let mut config = AppConfig::default().generation;
        config.base_url = base_url.to_string();
        config.model = model.to_string();
        config.api_key = "test-key".to_string();
        config.request_timeout_secs = 5;
        GeminiClient::new(&config).unwrap()
    }

    fn sample_chunk() -> AudioChunk {
        AudioChunk {
            ordinal: 2,
            data: Bytes::from_static(b"abc"),
        }
    }

    #[actix_web::test]
    async fn test_generate_maps_http_outcomes() {
        let (base_url, seen) = start_fake_api();
        let chunk = sample_chunk();

        let fragments = client_for(&base_url, "gemini-2.5-flash")
            .generate(&chunk)
            .await
            .unwrap();
        assert_eq!(
            fragments,
            vec![
                ReplyFragment::Text("Hi there".to_string()),
                ReplyFragment::AudioBytes(Bytes::from_static(b"RIFF")),
            ]
        );

        let err = client_for(&base_url, "limited").generate(&chunk).await.unwrap_err();
        assert!(matches!(err, GenerationError::RateLimited));
        assert!(err.is_rate_limited());

        let err = client_for(&base_url, "broken").generate(&chunk).await.unwrap_err();
        match &err {
            GenerationError::Api { status, message } => {
                assert_eq!(*status, 500);
                assert_eq!(message, "backend exploded");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
        assert!(!err.is_rate_limited());

        let err = client_for(&base_url, "garbled").generate(&chunk).await.unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)));
        assert!(!err.is_rate_limited());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for (key, body) in seen.iter() {
            assert_eq!(key, "test-key");
            assert_eq!(
                *body,
                serde_json::json!({
                    "contents": [{
                        "role": "user",
                        "parts": [{"inlineData": {"mimeType": "audio/webm", "data": "YWJj"}}]
                    }]
                })
            );
        }
    }

    #[actix_web::test]
    async fn test_unreachable_api_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(&format!("http://{}", addr), "gemini-2.5-flash")
            .generate(&sample_chunk())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transport(_)));
        assert!(!err.is_rate_limited());
    }

    fn client() -> GeminiClient {
        let mut config = AppConfig::default().generation;
        config.base_url = "https://example.test/".to_string();
        config.api_key = "k".to_string();
        GeminiClient::new(&config).unwrap()
    }

    #[test]
    fn test_endpoint_and_request_body() {
        let client = client();
        assert_eq!(
            client.endpoint,
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );

        let chunk = AudioChunk {
            ordinal: 0,
            data: Bytes::from_static(b"abc"),
        };
        let body = serde_json::to_value(client.request_body(&chunk)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "contents": [{
                    "role": "user",
                    "parts": [{"inlineData": {"mimeType": "audio/webm", "data": "YWJj"}}]
                }]
            })
        );
    }

    #[test]
    fn test_reply_parts_become_fragments_in_order() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [
                    {"text": "Hello"},
                    {"inlineData": {"mimeType": "audio/wav", "data": "UklGRg=="}},
                    {"text": ""}
                ]}
            }, {
                "content": {"parts": [{"text": "ignored"}]}
            }]
        }"#;
        let response: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        let fragments = response.into_fragments().unwrap();
        assert_eq!(
            fragments,
            vec![
                ReplyFragment::Text("Hello".to_string()),
                ReplyFragment::AudioBytes(Bytes::from_static(b"RIFF")),
            ]
        );
    }

    #[test]
    fn test_empty_and_bad_replies() {
        let empty: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_fragments().unwrap().is_empty());

        let bad: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"data":"%%%"}}]}}]}"#,
        )
        .unwrap();
        let err = bad.into_fragments().unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_only_429_is_rate_limited() {
        assert!(GenerationError::RateLimited.is_rate_limited());
        assert!(!GenerationError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_rate_limited());
    }
}
