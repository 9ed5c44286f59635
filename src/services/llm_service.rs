//! LLM 服务 - 业务能力层
//!
//! 只负责"调用 LLM"这一能力，不关心流程
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::LlmError;

/// LLM 服务
///
/// 职责：
/// - 发送一次对话请求并返回文本
/// - 不解析业务结果
/// - 不做重试（重试由调度层统一处理）
#[derive(Clone)]
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
}

impl LlmService {
    /// 创建新的 LLM 服务
    pub fn new(config: &Config, model_name: &str) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: model_name.to_string(),
            max_tokens: 2048,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// 通用的 LLM 调用函数
    ///
    /// # 参数
    /// - `user_message`: 用户消息内容
    /// - `system_message`: 系统消息（可选）
    /// - `imgs`: 图片 URL 或 data URL 列表（可选），会追加到用户消息中
    ///
    /// # 返回
    /// 返回 LLM 的响应内容（已去除首尾空白）
    pub async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: Option<&str>,
        imgs: Option<&[String]>,
    ) -> Result<String, LlmError> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_message.len());

        let mut messages = Vec::new();

        if let Some(sys_msg) = system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg)
                .build()
                .map_err(invalid_request)?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = match imgs {
            Some(img_urls) if !img_urls.is_empty() => {
                // 使用 Vision API：文本 + 图片
                let mut content_parts = vec![ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText {
                        text: user_message.to_string(),
                    },
                )];
                for url in img_urls {
                    content_parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                        ChatCompletionRequestMessageContentPartImage {
                            image_url: ImageUrl {
                                url: url.clone(),
                                detail: Some(ImageDetail::High),
                            },
                        },
                    ));
                }
                debug!("使用 Vision API，包含 {} 张图片", img_urls.len());
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
                    .build()
                    .map_err(invalid_request)?
            }
            _ => ChatCompletionRequestUserMessageArgs::default()
                .content(user_message)
                .build()
                .map_err(invalid_request)?,
        };
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.2)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(invalid_request)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            LlmError::ApiCallFailed {
                model: self.model_name.clone(),
                message: e.to_string(),
            }
        })?;

        debug!("LLM API 调用成功");

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        Ok(content.trim().to_string())
    }
}

fn invalid_request(e: impl std::fmt::Display) -> LlmError {
    LlmError::InvalidRequest(e.to_string())
}

/// 把图片内联成 data URL
pub fn image_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// 从模型回复中取出 JSON 对象
///
/// 兼容 ```json 代码块包裹、前后夹杂说明文字的回复
pub fn extract_json_object(reply: &str) -> Option<&str> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("正则表达式有效")
    });
    if let Some(captures) = fenced.captures(reply) {
        return captures.get(1).map(|m| m.as_str());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let reply = "好的，评分如下：\n```json\n{\"score\": 88}\n```\n希望有帮助";
        assert_eq!(extract_json_object(reply), Some("{\"score\": 88}"));
    }

    #[test]
    fn test_extract_json_from_plain_text() {
        assert_eq!(
            extract_json_object("结果: {\"text\": \"a\"} 完"),
            Some("{\"text\": \"a\"}")
        );
        assert_eq!(extract_json_object("没有 JSON"), None);
    }

    #[test]
    fn test_image_data_url() {
        assert_eq!(image_data_url("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    /// 测试通用 LLM 调用
    ///
    /// 运行方式：
    /// ```bash
    /// LLM_API_KEY=... cargo test test_send_to_llm_simple -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_send_to_llm_simple() {
        let _ = tracing_subscriber::fmt::try_init();

        let config = Config::from_env().unwrap();
        let service = LlmService::new(&config, &config.llm_model_name);
        let response = service
            .send_to_llm("用一句话介绍你自己", Some("你是一个简洁的助手。"), None)
            .await
            .unwrap();
        println!("LLM 响应: {}", response);
        assert!(!response.is_empty());
    }
}
