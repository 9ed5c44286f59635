//! 作文评分服务

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{GradingError, OperationError};
use crate::models::{GradeResult, GradingContext};
use crate::services::llm_service::{extract_json_object, LlmService};

/// 评分能力
#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, text: &str, context: &GradingContext) -> Result<GradeResult, OperationError>;
}

/// 基于 LLM 的评分
pub struct LlmGrader {
    llm: LlmService,
}

#[derive(Debug, Deserialize)]
struct GradeReply {
    score: f64,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    improved: String,
}

impl LlmGrader {
    pub fn new(llm: LlmService) -> Self {
        Self { llm }
    }

    /// 构建评分消息，返回 (user_message, system_message)
    fn build_grade_messages(text: &str, context: &GradingContext) -> (String, String) {
        let system_message = format!(
            "你是一位经验丰富的{}老师，负责批改学生作文。评语使用语言: {}。",
            context.subject, context.language
        );

        let user_message = format!(
            r#"请根据评分标准批改下面这篇作文。

【评分标准】
{}

【满分】
{}

【作文全文】
{}

只返回如下 JSON，不要返回其他内容：
{{"score": <0 到满分之间的分数>, "feedback": "<评语>", "improved": "<修改后的范文>"}}"#,
            context.rubric, context.max_score, text
        );

        (user_message, system_message)
    }

    /// 解析评分回复
    fn parse_grade_reply(reply: &str, max_score: f64) -> Result<GradeResult, GradingError> {
        let json = extract_json_object(reply)
            .ok_or_else(|| GradingError::InvalidReply(reply.chars().take(200).collect()))?;
        let parsed: GradeReply = serde_json::from_str(json)
            .map_err(|e| GradingError::InvalidReply(e.to_string()))?;
        if !parsed.score.is_finite() || parsed.score < 0.0 || parsed.score > max_score {
            return Err(GradingError::InvalidReply(format!(
                "分数 {} 超出范围 [0, {}]",
                parsed.score, max_score
            )));
        }
        Ok(GradeResult {
            score: parsed.score,
            feedback: parsed.feedback.trim().to_string(),
            improved: parsed.improved.trim().to_string(),
        })
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn grade(&self, text: &str, context: &GradingContext) -> Result<GradeResult, OperationError> {
        if text.trim().is_empty() {
            return Err(GradingError::EmptyText.into());
        }
        let (user_message, system_message) = Self::build_grade_messages(text, context);
        let reply = self
            .llm
            .send_to_llm(&user_message, Some(&system_message), None)
            .await
            .map_err(GradingError::from)?;
        debug!("评分回复 (模型 {}): {} 字符", self.llm.model_name(), reply.chars().count());
        Ok(Self::parse_grade_reply(&reply, context.max_score)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grade_reply() {
        let reply = "```json\n{\"score\": 42.5, \"feedback\": \" 结构清晰 \", \"improved\": \"范文\"}\n```";
        let grade = LlmGrader::parse_grade_reply(reply, 50.0).unwrap();
        assert_eq!(grade.score, 42.5);
        assert_eq!(grade.feedback, "结构清晰");
    }

    #[test]
    fn test_score_out_of_range_is_invalid() {
        let err = LlmGrader::parse_grade_reply("{\"score\": 120}", 100.0).unwrap_err();
        assert!(matches!(err, GradingError::InvalidReply(_)));
    }

    #[test]
    fn test_messages_include_rubric() {
        let context = GradingContext {
            rubric: "立意 40 分".into(),
            ..Default::default()
        };
        let (user, system) = LlmGrader::build_grade_messages("正文", &context);
        assert!(user.contains("立意 40 分"));
        assert!(user.contains("正文"));
        assert!(system.contains("语文"));
    }
}
