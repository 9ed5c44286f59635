//! 手写识别服务
//!
//! 两种实现：
//! - [`LlmRecognizer`]：视觉大模型，把图片内联成 data URL 发送
//! - [`HttpRecognizer`]：独立的 OCR 服务，POST JSON `{image, mime}`，返回 `{text, confidence}`

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::{OperationError, RecognitionError};
use crate::models::Recognition;
use crate::services::llm_service::{extract_json_object, image_data_url, LlmService};

/// 识别能力
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &[u8], mime: &str) -> Result<Recognition, OperationError>;
}

/// 根据配置选择识别实现
pub fn from_config(config: &Config) -> Result<Box<dyn Recognizer>, RecognitionError> {
    let recognizer: Box<dyn Recognizer> = match &config.recognizer_url {
        Some(url) => Box::new(HttpRecognizer::new(
            url,
            config.recognizer_api_key.clone(),
            Duration::from_secs(config.operation_timeout_secs),
        )?),
        None => Box::new(LlmRecognizer::new(LlmService::new(
            config,
            config.vision_model(),
        ))),
    };
    Ok(recognizer)
}

#[derive(Debug, Deserialize)]
struct RecognitionReply {
    text: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl From<RecognitionReply> for Recognition {
    fn from(reply: RecognitionReply) -> Self {
        Recognition {
            text: reply.text.trim().to_string(),
            confidence: reply.confidence.clamp(0.0, 1.0),
        }
    }
}

fn check_image(image: &[u8]) -> Result<(), RecognitionError> {
    if image.is_empty() {
        return Err(RecognitionError::UnsupportedImage("图片为空".to_string()));
    }
    Ok(())
}

/// 视觉大模型识别
pub struct LlmRecognizer {
    llm: LlmService,
}

const RECOGNIZE_SYSTEM_PROMPT: &str =
    "你是一个专业的手写文字识别助手，擅长把学生作文扫描件逐字转写成文本。";

const RECOGNIZE_USER_PROMPT: &str = r#"请转写图片中的全部手写内容，保持原有段落，不要修改错别字，不要添加任何评价。

只返回如下 JSON，不要返回其他内容：
{"text": "<转写的全文>", "confidence": <0 到 1 之间的识别把握>}"#;

impl LlmRecognizer {
    pub fn new(llm: LlmService) -> Self {
        Self { llm }
    }

    /// 解析模型回复
    fn parse_reply(reply: &str) -> Result<Recognition, RecognitionError> {
        let json = extract_json_object(reply)
            .ok_or_else(|| RecognitionError::InvalidJson(truncate(reply)))?;
        let parsed: RecognitionReply = serde_json::from_str(json)
            .map_err(|e| RecognitionError::InvalidJson(format!("{}: {}", e, truncate(json))))?;
        Ok(parsed.into())
    }
}

#[async_trait]
impl Recognizer for LlmRecognizer {
    async fn recognize(&self, image: &[u8], mime: &str) -> Result<Recognition, OperationError> {
        check_image(image)?;
        let urls = [image_data_url(mime, image)];
        let reply = self
            .llm
            .send_to_llm(RECOGNIZE_USER_PROMPT, Some(RECOGNIZE_SYSTEM_PROMPT), Some(&urls))
            .await
            .map_err(RecognitionError::from)?;
        debug!("识别回复长度: {} 字符", reply.chars().count());
        Ok(Self::parse_reply(&reply)?)
    }
}

/// HTTP OCR 服务识别
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    mime: &'a str,
}

impl HttpRecognizer {
    /// 客户端构建失败直接返回错误，不退回到没有超时的默认客户端
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::RequestFailed(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    /// 把非 2xx 状态映射为识别错误
    fn status_error(status: u16, body: String) -> RecognitionError {
        match status {
            400 | 413 | 415 | 422 => RecognitionError::UnsupportedImage(format!("{}: {}", status, body)),
            _ => RecognitionError::BadStatus { status, body },
        }
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, image: &[u8], mime: &str) -> Result<Recognition, OperationError> {
        check_image(image)?;
        let body = RecognizeRequest {
            image: STANDARD.encode(image),
            mime,
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RecognitionError::RequestFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::status_error(status.as_u16(), truncate(&text)).into());
        }

        let parsed: RecognitionReply = serde_json::from_str(&text)
            .map_err(|e| RecognitionError::InvalidJson(format!("{}: {}", e, truncate(&text))))?;
        Ok(parsed.into())
    }
}

fn truncate(text: &str) -> String {
    crate::utils::logging::truncate_text(text, 200)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_with_fence() {
        let reply = "```json\n{\"text\": \"  我的妈妈 \", \"confidence\": 1.7}\n```";
        let recognition = LlmRecognizer::parse_reply(reply).unwrap();
        assert_eq!(recognition.text, "我的妈妈");
        assert_eq!(recognition.confidence, 1.0);
    }

    #[test]
    fn test_parse_reply_missing_confidence() {
        let recognition = LlmRecognizer::parse_reply("{\"text\": \"春游\"}").unwrap();
        assert_eq!(recognition.confidence, 1.0);
    }

    #[test]
    fn test_parse_reply_garbage_is_retryable() {
        let err = LlmRecognizer::parse_reply("抱歉，我看不清").unwrap_err();
        assert!(matches!(err, RecognitionError::InvalidJson(_)));
        assert!(OperationError::from(err).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(!HttpRecognizer::status_error(415, String::new()).is_retryable());
        assert!(HttpRecognizer::status_error(503, String::new()).is_retryable());
    }

    #[test]
    fn test_from_config_picks_http_when_url_set() {
        let config = Config {
            recognizer_url: Some("http://127.0.0.1:9/ocr".into()),
            operation_timeout_secs: 5,
            ..Default::default()
        };
        assert!(from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_empty_image_is_permanent() {
        let recognizer = HttpRecognizer::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let err = recognizer.recognize(&[], "image/png").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
