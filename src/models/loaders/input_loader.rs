use crate::error::{AppError, AppResult, ConfigError, FileError};
use crate::models::task::{dedupe_item_ids, GradingContext, Item, SourceRef, TaskConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 任务清单文件名
pub const MANIFEST_FILE: &str = "task.toml";

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "gif"];

/// `task.toml` 的内容
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskManifest {
    pub title: Option<String>,
    pub grading: GradingContext,
    pub roster: Vec<String>,
}

/// 从目录中加载的批次输入
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub title: String,
    pub config: TaskConfig,
    pub items: Vec<Item>,
}

/// 读取目录下的 `task.toml`，不存在时使用默认值
pub async fn load_manifest(folder: &Path) -> AppResult<TaskManifest> {
    let manifest_path = folder.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        tracing::debug!("未找到 {}，使用默认任务配置", manifest_path.display());
        return Ok(TaskManifest::default());
    }

    let content = fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| AppError::file_read_failed(manifest_path.display().to_string(), e))?;

    let manifest: TaskManifest = toml::from_str(&content).map_err(|e| ConfigError::TomlParseFailed {
        path: manifest_path.display().to_string(),
        source: e,
    })?;

    Ok(manifest)
}

/// 扫描目录中的所有图片，按文件名排序后生成条目
///
/// 条目 id 由文件名（不含扩展名）得到，重新扫描同一目录时 id 保持不变，
/// 这样可以把持久化的状态对回到原来的条目上。
pub async fn scan_items(folder: &Path) -> AppResult<Vec<Item>> {
    if !folder.is_dir() {
        return Err(FileError::DirectoryNotFound {
            path: folder.display().to_string(),
        }
        .into());
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(folder)
        .await
        .map_err(|e| AppError::file_read_failed(folder.display().to_string(), e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::file_read_failed(folder.display().to_string(), e))?
    {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            paths.push(path);
        }
    }

    paths.sort();

    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let file_name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let id = path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let size_bytes = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!("读取文件信息失败 {}: {}", path.display(), e);
                0
            }
        };
        tracing::debug!("发现扫描件: {} ({} 字节)", file_name, size_bytes);
        items.push(Item::new(
            id,
            SourceRef::from_path(path.to_string_lossy().to_string(), file_name, size_bytes),
        ));
    }

    // a.png 和 a.jpg 的文件名主干相同
    dedupe_item_ids(&mut items);
    Ok(items)
}

/// 加载整个输入目录：清单 + 扫描件
pub async fn load_batch_input(folder_path: &str) -> AppResult<BatchInput> {
    let folder = PathBuf::from(folder_path);
    let manifest = load_manifest(&folder).await?;
    let items = scan_items(&folder).await?;

    let title = manifest.title.clone().unwrap_or_else(|| {
        folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| folder_path.to_string())
    });

    tracing::info!("✓ 从 {} 加载了 {} 份扫描件", folder_path, items.len());

    Ok(BatchInput {
        title,
        config: TaskConfig {
            grading: manifest.grading,
            roster: manifest.roster,
            source_dir: Some(folder.to_string_lossy().to_string()),
        },
        items,
    })
}
