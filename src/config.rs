use crate::error::{AppResult, ConfigError};
use serde::Deserialize;
use std::path::Path;

/// 程序配置
///
/// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- 调度 ---
    /// 每个波次的条目数（同时也是并发上限）
    pub concurrency: usize,
    /// 波次之间的间隔（毫秒）
    pub inter_wave_delay_ms: u64,
    // --- 重试 ---
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 单次外部调用超时（秒）
    pub operation_timeout_secs: u64,
    // --- 持久化 ---
    /// 单个快照的体积预算（字节）
    pub storage_budget_bytes: usize,
    /// 状态目录的总容量（字节）
    pub storage_capacity_bytes: usize,
    /// 其他任务的快照超过该时长可以被淘汰（秒）
    pub snapshot_ttl_secs: u64,
    /// 自动保存的最小间隔（毫秒）
    pub save_debounce_ms: u64,
    pub state_dir: String,
    pub output_dir: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- 识别服务 ---
    /// 设置后使用 HTTP 识别服务，否则使用 LLM 视觉识别
    pub recognizer_url: Option<String>,
    pub recognizer_api_key: Option<String>,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    /// 识别使用的视觉模型，缺省时与评分模型相同
    pub llm_vision_model_name: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 20,
            inter_wave_delay_ms: 500,
            max_retries: 2,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            operation_timeout_secs: 120,
            storage_budget_bytes: 5 * 1024 * 1024,
            storage_capacity_bytes: 50 * 1024 * 1024,
            snapshot_ttl_secs: 2 * 60 * 60,
            save_debounce_ms: 500,
            state_dir: ".essay_batch".to_string(),
            output_dir: "output".to_string(),
            verbose_logging: false,
            recognizer_url: None,
            recognizer_api_key: None,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_vision_model_name: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, expected: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: name.to_string(),
                value,
                expected_type: expected.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// 默认值 + 环境变量
    pub fn from_env() -> AppResult<Self> {
        Self::default().with_env_overrides()
    }

    /// 读取 TOML 配置文件，缺失的字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::AppError::file_read_failed(path.display().to_string(), e))?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// 用环境变量覆盖当前配置
    pub fn with_env_overrides(self) -> AppResult<Self> {
        let d = self;
        Ok(Self {
            concurrency: env_parse("CONCURRENCY", "usize")?.unwrap_or(d.concurrency),
            inter_wave_delay_ms: env_parse("INTER_WAVE_DELAY_MS", "u64")?.unwrap_or(d.inter_wave_delay_ms),
            max_retries: env_parse("MAX_RETRIES", "u32")?.unwrap_or(d.max_retries),
            base_backoff_ms: env_parse("BASE_BACKOFF_MS", "u64")?.unwrap_or(d.base_backoff_ms),
            max_backoff_ms: env_parse("MAX_BACKOFF_MS", "u64")?.unwrap_or(d.max_backoff_ms),
            operation_timeout_secs: env_parse("OPERATION_TIMEOUT_SECS", "u64")?.unwrap_or(d.operation_timeout_secs),
            storage_budget_bytes: env_parse("STORAGE_BUDGET_BYTES", "usize")?.unwrap_or(d.storage_budget_bytes),
            storage_capacity_bytes: env_parse("STORAGE_CAPACITY_BYTES", "usize")?.unwrap_or(d.storage_capacity_bytes),
            snapshot_ttl_secs: env_parse("SNAPSHOT_TTL_SECS", "u64")?.unwrap_or(d.snapshot_ttl_secs),
            save_debounce_ms: env_parse("SAVE_DEBOUNCE_MS", "u64")?.unwrap_or(d.save_debounce_ms),
            state_dir: std::env::var("STATE_DIR").unwrap_or(d.state_dir),
            output_dir: std::env::var("OUTPUT_DIR").unwrap_or(d.output_dir),
            verbose_logging: env_parse("VERBOSE_LOGGING", "bool")?.unwrap_or(d.verbose_logging),
            recognizer_url: std::env::var("RECOGNIZER_URL").ok().or(d.recognizer_url),
            recognizer_api_key: std::env::var("RECOGNIZER_API_KEY").ok().or(d.recognizer_api_key),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(d.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(d.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(d.llm_model_name),
            llm_vision_model_name: std::env::var("LLM_VISION_MODEL_NAME").ok().or(d.llm_vision_model_name),
        })
    }

    /// 检查取值范围
    pub fn validate(&self) -> AppResult<()> {
        use crate::orchestrator::scheduler::MAX_CONCURRENCY;
        use crate::error::AppError;

        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(AppError::invalid_config(
                "concurrency",
                format!("必须在 1..={} 之间，当前为 {}", MAX_CONCURRENCY, self.concurrency),
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(AppError::invalid_config(
                "base_backoff_ms",
                "不能大于 max_backoff_ms",
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(AppError::invalid_config("operation_timeout_secs", "不能为 0"));
        }
        if self.storage_budget_bytes == 0 {
            return Err(AppError::invalid_config("storage_budget_bytes", "不能为 0"));
        }
        Ok(())
    }

    /// 识别使用的模型
    pub fn vision_model(&self) -> &str {
        self.llm_vision_model_name
            .as_deref()
            .unwrap_or(&self.llm_model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.vision_model(), config.llm_model_name);
    }

    #[test]
    fn test_toml_partial_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency = 15\nllm_model_name = \"qwen-vl\"").unwrap();
        let config = Config::from_toml_file(file.path()).unwrap();
        assert_eq!(config.concurrency, 15);
        assert_eq!(config.llm_model_name, "qwen-vl");
        assert_eq!(config.inter_wave_delay_ms, 500);
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency = \"many\"").unwrap();
        let err = Config::from_toml_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("解析失败"));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = Config {
            concurrency: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = Config {
            base_backoff_ms: 60_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
