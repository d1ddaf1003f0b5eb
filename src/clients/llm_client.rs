//! 文档理解模型客户端
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的服务（自定义 base URL 和模型）
//! - 文档以 base64 `data:` URL 的形式随提示词一起发送

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::Engine as _;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExtractionModel, ModelOutput};
use crate::config::Config;
use crate::error::TaskError;
use crate::models::DocumentRef;

const SERVICE: &str = "model";

/// 模型客户端
///
/// 职责：
/// - 只处理单个文档的一次推理
/// - 返回原始文本和 token 用量，不解析 JSON
/// - 把 API 错误分类为暂时性 / 永久性
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
    request_timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            max_tokens: config.llm_max_tokens,
            request_timeout: config.request_timeout(),
        }
    }

    fn build_request(
        &self,
        doc: &DocumentRef,
        content: &[u8],
        prompt: &str,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, OpenAIError> {
        let parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: prompt.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: data_url(&upload_mime(doc), content),
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ];

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(parts))
            .build()?;

        CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![ChatCompletionRequestMessage::User(user_msg)])
            .temperature(0.0)
            .max_tokens(self.max_tokens)
            .build()
    }
}

#[async_trait]
impl ExtractionModel for LlmClient {
    async fn extract(
        &self,
        doc: &DocumentRef,
        content: &[u8],
        prompt: &str,
    ) -> Result<ModelOutput, TaskError> {
        if content.is_empty() {
            return Err(TaskError::invalid_input(format!("文档 {} 内容为空", doc.name)));
        }

        debug!(
            "[doc {}] 调用模型 {}，文档大小 {} 字节",
            doc.name,
            self.model_name,
            content.len()
        );

        let request = self
            .build_request(doc, content, prompt)
            .map_err(|e| TaskError::invalid_input(format!("构建请求失败: {}", e)))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| TaskError::timeout(SERVICE, self.request_timeout))?
            .map_err(|e| {
                warn!("[doc {}] 模型 API 调用失败: {}", doc.name, e);
                classify_openai_error(&e, self.request_timeout)
            })?;

        let raw_text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let (tokens_in, tokens_out) = response
            .usage
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));

        debug!(
            "[doc {}] 模型返回 {} 字符, tokens: {} in / {} out",
            doc.name,
            raw_text.len(),
            tokens_in,
            tokens_out
        );

        Ok(ModelOutput {
            raw_text,
            tokens_in,
            tokens_out,
        })
    }
}

/// 发送给模型的 MIME 类型；原生文档已经被导出为 PDF
fn upload_mime(doc: &DocumentRef) -> String {
    if doc.is_workspace_native() || doc.mime_type.is_empty() {
        "application/pdf".to_string()
    } else {
        doc.mime_type.clone()
    }
}

fn data_url(mime: &str, content: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(content)
    )
}

fn classify_openai_error(err: &OpenAIError, timeout: Duration) -> TaskError {
    match err {
        OpenAIError::ApiError(api) => classify_api_error(
            api.code.as_deref(),
            api.r#type.as_deref(),
            &api.message,
        ),
        OpenAIError::Reqwest(e) if e.is_timeout() => TaskError::timeout(SERVICE, timeout),
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) => classify_api_error(None, Some(status.as_str()), &e.to_string()),
            None => TaskError::network(SERVICE, e.to_string()),
        },
        OpenAIError::InvalidArgument(message) => TaskError::invalid_input(message.clone()),
        other => classify_api_error(None, None, &other.to_string()),
    }
}

/// 根据错误码、类型和消息文本分类
///
/// 各家兼容服务的错误格式不统一，只能在 code / type / message 中找关键字。
fn classify_api_error(code: Option<&str>, kind: Option<&str>, message: &str) -> TaskError {
    let haystack = format!(
        "{} {} {}",
        code.unwrap_or_default(),
        kind.unwrap_or_default(),
        message
    )
    .to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if has(&["rate_limit", "rate limit", "429", "too many requests", "quota"]) {
        TaskError::rate_limited(SERVICE, None)
    } else if has(&["overloaded", "server_error", "internal", "unavailable", "502", "503", "504", "500"]) {
        TaskError::server(SERVICE, 503, message)
    } else if has(&["timeout", "timed out"]) {
        TaskError::network(SERVICE, message)
    } else if has(&["invalid_api_key", "authentication", "unauthorized", "permission", "401", "403"]) {
        TaskError::unauthorized(SERVICE, message)
    } else if has(&["invalid_request", "invalid request", "400", "413", "context_length", "too large"]) {
        TaskError::invalid_input(message)
    } else if has(&["connection", "network", "dns", "reset"]) {
        TaskError::network(SERVICE, message)
    } else {
        TaskError::invalid_input(message)
    }
}
