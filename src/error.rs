use std::time::Duration;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 单个条目的操作错误（正常情况下在条目内部消化，不会走到这里）
    #[error("操作错误: {0}")]
    Operation(#[from] OperationError),
    /// 持久化错误（尽力而为，绝不应导致流水线崩溃）
    #[error("持久化错误: {0}")]
    Persistence(#[from] PersistenceError),
    /// 调度器被错误使用（编程错误，立即暴露）
    #[error("调度器使用错误: {0}")]
    SchedulerMisuse(String),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
    /// JSON 序列化 / 反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),
    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

/// 单个条目操作错误
///
/// 错误只作用于出错的条目本身：调度器把它记录为该条目的结果，
/// 从不向同一波次的其他条目或整个批次传播。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// 可重试的临时错误（网络抖动、限流等）
    #[error("临时错误: {0}")]
    Transient(String),
    /// 不可重试的永久错误（输入格式错误等）
    #[error("永久错误: {0}")]
    Permanent(String),
    /// 单次调用超时，按临时错误处理
    #[error("操作超时 ({0:?})")]
    Timeout(Duration),
    /// 运行已被取消，条目应回到 Pending 而不是 Failed
    #[error("操作已取消")]
    Cancelled,
    /// 识别服务错误
    #[error("识别失败: {0}")]
    Recognition(#[from] RecognitionError),
    /// 评分服务错误
    #[error("评分失败: {0}")]
    Grading(#[from] GradingError),
}

impl OperationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        OperationError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        OperationError::Permanent(msg.into())
    }

    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            OperationError::Transient(_) | OperationError::Timeout(_) => true,
            OperationError::Permanent(_) | OperationError::Cancelled => false,
            OperationError::Recognition(e) => e.is_retryable(),
            OperationError::Grading(e) => e.is_retryable(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

impl From<reqwest::Error> for OperationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return OperationError::Transient(err.to_string());
        }
        match err.status() {
            // 429 是限流，属于可以等一等再试的情况
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                OperationError::Permanent(err.to_string())
            }
            _ => OperationError::Transient(err.to_string()),
        }
    }
}

/// 识别服务错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecognitionError {
    /// 网络请求失败
    #[error("识别请求失败: {0}")]
    RequestFailed(String),
    /// 非 2xx 响应
    #[error("识别服务返回错误状态 {status}: {body}")]
    BadStatus { status: u16, body: String },
    /// 响应不是合法 JSON
    #[error("识别结果无法解析: {0}")]
    InvalidJson(String),
    /// 图片本身无法处理（不会重试）
    #[error("图片无法识别: {0}")]
    UnsupportedImage(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl RecognitionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RecognitionError::UnsupportedImage(_) => false,
            RecognitionError::Llm(e) => e.is_retryable(),
            _ => true,
        }
    }
}

/// LLM 调用错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// 请求构建失败（参数问题，重试无意义）
    #[error("LLM 请求构建失败: {0}")]
    InvalidRequest(String),
    /// API 调用失败
    #[error("LLM API 调用失败 (模型: {model}): {message}")]
    ApiCallFailed { model: String, message: String },
    /// 返回内容为空
    #[error("LLM 返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::InvalidRequest(_))
    }
}

/// 评分服务错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GradingError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// 返回内容无法解析
    #[error("评分结果无法解析: {0}")]
    InvalidReply(String),
    /// 待评分文本为空
    #[error("待评分文本为空")]
    EmptyText,
}

impl GradingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GradingError::Llm(e) => e.is_retryable(),
            GradingError::InvalidReply(_) => true,
            GradingError::EmptyText => false,
        }
    }
}

/// 持久化错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// 存储空间不足
    #[error("存储空间不足: 写入 {key} 需要 {needed} 字节，容量 {capacity} 字节")]
    QuotaExceeded {
        key: String,
        needed: usize,
        capacity: usize,
    },
    /// 底层存储失败
    #[error("存储失败: {0}")]
    Storage(String),
    /// 快照序列化失败
    #[error("快照序列化失败: {0}")]
    Serialization(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置项取值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
    /// TOML 解析失败
    #[error("配置文件 {path} 解析失败: {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 目录不存在
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: String },
    /// 读取失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建调度器误用错误
    pub fn misuse(msg: impl Into<String>) -> Self {
        AppError::SchedulerMisuse(msg.into())
    }

    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建非法配置错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(OperationError::transient("网络抖动").is_retryable());
        assert!(OperationError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(!OperationError::permanent("图片损坏").is_retryable());
        assert!(!OperationError::Cancelled.is_retryable());
        assert!(OperationError::from(RecognitionError::InvalidJson("oops".into())).is_retryable());
        assert!(
            !OperationError::from(RecognitionError::UnsupportedImage("空文件".into())).is_retryable()
        );
        assert!(OperationError::from(GradingError::InvalidReply("{".into())).is_retryable());
        assert!(!OperationError::from(GradingError::EmptyText).is_retryable());
        assert!(!OperationError::from(RecognitionError::from(LlmError::InvalidRequest(
            "max_tokens".into()
        )))
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::from(PersistenceError::QuotaExceeded {
            key: "task:1".into(),
            needed: 10,
            capacity: 5,
        });
        let text = err.to_string();
        assert!(text.contains("task:1"));
        assert!(text.contains("10"));
    }
}
