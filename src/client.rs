use crate::config::Config;
use crate::error::InferenceError;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Anything that can turn one text into another language.
///
/// The worker pool only depends on this trait, so tests can substitute a
/// deterministic implementation for the HTTP client.
pub trait Translator: Send + Sync + 'static {
    fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> impl Future<Output = Result<String, InferenceError>> + Send;
}

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// English name for the language codes we commonly see; falls back to the code.
fn language_name(code: &str) -> &str {
    match code {
        "de" => "German",
        "en" => "English",
        "fr" => "French",
        "it" => "Italian",
        "es" => "Spanish",
        "nl" => "Dutch",
        "pl" => "Polish",
        "pt" => "Portuguese",
        "cs" => "Czech",
        "da" => "Danish",
        "sv" => "Swedish",
        "hu" => "Hungarian",
        _ => code,
    }
}

/// Build the default system prompt for a single translation
fn build_system_prompt(source_language: &str, target_language: &str) -> String {
    format!(
        r#"You are a professional translator for product catalogue data.
Translate the user's text from {} to {}.

### Rules:
- Reply with the translation only, no explanations or quotes
- Preserve HTML tags, placeholders, numbers, units and line breaks exactly
- Do not translate brand names, model numbers or SKUs
- Keep the tone and length close to the original"#,
        language_name(source_language),
        language_name(target_language)
    )
}

/// Build the user prompt. The `/no_think` suffix disables reasoning output on Qwen3 models.
fn build_user_prompt(text: &str, source_language: &str, target_language: &str) -> String {
    format!(
        "Translate from {} to {}:\n\n{} /no_think",
        language_name(source_language),
        language_name(target_language),
        text
    )
}

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").unwrap())
}

/// Strip reasoning blocks and a surrounding code fence from model output.
pub fn clean_response(raw: &str) -> String {
    let without_think = think_block().replace_all(raw, "");
    let trimmed = without_think.trim();

    let unfenced = match trimmed.strip_prefix("```") {
        Some(rest) => {
            // Drop the optional language tag on the opening fence line
            let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
            body.strip_suffix("```").unwrap_or(body)
        }
        None => trimmed,
    };

    unfenced.trim().to_string()
}

/// HTTP client for the local inference endpoint.
pub struct InferenceClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.load_system_prompt()?,
            timeout: config.request_timeout,
        })
    }

    fn build_request(&self, text: &str, source_language: &str, target_language: &str) -> ChatRequest {
        let system = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| build_system_prompt(source_language, target_language));

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system,
                },
                Message {
                    role: "user".to_string(),
                    content: build_user_prompt(text, source_language, target_language),
                },
            ],
            temperature: 0.2,
            max_tokens: 8192,
            stream: false,
        }
    }

    fn classify_transport(&self, error: reqwest::Error) -> InferenceError {
        if error.is_timeout() {
            InferenceError::Timeout(self.timeout)
        } else if error.is_decode() {
            InferenceError::Malformed(error.to_string())
        } else {
            InferenceError::Connection(error.to_string())
        }
    }
}

impl Translator for InferenceClient {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, InferenceError> {
        let request = self.build_request(text, source_language, target_language);

        let mut builder = self
            .http
            .post(&self.api_url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(match status.as_u16() {
                429 => InferenceError::RateLimited,
                code if code >= 500 => InferenceError::Server { status: code, body },
                code => InferenceError::Client { status: code, body },
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.classify_transport(e))?;
        let chat: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| InferenceError::Malformed(format!("{}: {}", e, body)))?;

        let raw = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| InferenceError::Malformed("response contained no choices".to_string()))?;

        let translated = clean_response(&raw);
        if translated.is_empty() {
            return Err(InferenceError::Empty);
        }

        debug!(
            "Translated {} chars {} -> {}",
            text.chars().count(),
            source_language,
            target_language
        );
        Ok(translated)
    }
}
