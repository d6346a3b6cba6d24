//! OpenAI-compatible chat completion backend for the metered AI actions.

use crate::billing::gateway::{MeteredAction, OperationOutput, OperationRequest, PaidOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

const POLISH_SYSTEM_PROMPT: &str = "You are a professional corporate assistant. Polish the \
following task description to be clear, professional, and impactful. Remove fluff. Use bullet \
points if multiple items. Keep it concise.";

const REPORT_SYSTEM_PROMPT: &str = "You are an elite corporate report writer. Create visually \
appealing, well-structured reports with proper formatting, spacing, and emphasis. Use Markdown \
effectively for professional presentation.";

const EDIT_SYSTEM_PROMPT: &str = "You are an AI assistant helping to edit and improve a \
professional report. Follow the user's instructions to modify the report. Maintain the same \
formatting style (Markdown with emojis, bold text, headers) and the professional corporate tone. \
Always return the complete updated report in Markdown format and nothing else.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: String::new(),
            model: DEFAULT_MODEL.into(),
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Chat completion client implementing [`PaidOperation`].
///
/// Timeouts are enforced by the gateway, not here.
pub struct OpenAiOperation {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl OpenAiOperation {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            anyhow::bail!("OpenAI API key is not configured");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, http })
    }

    fn messages(request: &OperationRequest) -> anyhow::Result<Vec<ChatMessage>> {
        let (system, user) = match request.action {
            MeteredAction::PolishTask => (POLISH_SYSTEM_PROMPT, request.input.clone()),
            MeteredAction::GenerateReport => {
                let period = request.instruction.as_deref().unwrap_or("this period");
                (REPORT_SYSTEM_PROMPT, report_prompt(period, &request.input))
            }
            MeteredAction::EditReport => {
                let Some(instruction) = request.instruction.as_deref() else {
                    anyhow::bail!("report edit requires an instruction");
                };
                (
                    EDIT_SYSTEM_PROMPT,
                    format!(
                        "Here is the current report:\n\n{}\n\n---\n\nUser request: {instruction}\n\n\
                         Please apply the requested changes and return the updated report.",
                        request.input
                    ),
                )
            }
        };
        Ok(vec![
            ChatMessage {
                role: "system".into(),
                content: system.into(),
            },
            ChatMessage {
                role: "user".into(),
                content: user,
            },
        ])
    }
}

fn report_prompt(period: &str, tasks: &str) -> String {
    format!(
        "Generate a beautifully formatted, professional monthly activity report for the period: \
         **{period}**\n\n\
         Use Markdown with clear heading levels, **bold** key achievements and metrics, bullet \
         points and horizontal rules between sections.\n\n\
         Structure:\n\
         # {period} Report\n\
         ## Executive Summary\n\
         ## Key Achievements\n\
         ## Detailed Activities\n\
         ## Impact Analysis\n\
         ## Recommendations & Next Steps\n\n\
         Tone: professional, corporate, achievement-focused.\n\n\
         Tasks to include:\n{tasks}\n"
    )
}

#[async_trait]
impl PaidOperation for OpenAiOperation {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, request: &OperationRequest) -> anyhow::Result<OperationOutput> {
        if request.input.trim().is_empty() {
            anyhow::bail!("empty input for {}", request.action.key());
        }
        let body = ChatRequest {
            model: &self.config.model,
            messages: Self::messages(request)?,
            temperature: self.config.temperature,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat completion failed ({status}): {body}");
        }

        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty());

        match (content, request.action) {
            (Some(content), _) => Ok(OperationOutput { content }),
            // An empty polish keeps the user's own wording
            (None, MeteredAction::PolishTask) => Ok(OperationOutput {
                content: request.input.clone(),
            }),
            (None, action) => anyhow::bail!("empty completion for {}", action.key()),
        }
    }
}
