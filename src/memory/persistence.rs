//! 持久化辅助
//!
//! 以 JSON 文档形式写入/读取记录。写入先落到同目录临时文件，fsync 后原子重命名，
//! 返回时数据已落盘；崩溃时磁盘上要么是旧版本，要么是新版本。

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// 持久写入 JSON：临时文件 + sync_all + rename；父目录不存在时自动创建
pub async fn write_json_durable<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp, path).await?;
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        // 同步目录项，rename 才算落盘
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}

/// 读取 JSON 文档；文件不存在时返回 None
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_json_durable(&path, &vec!["a", "b"]).await.unwrap();
        let back: Option<Vec<String>> = read_json(&path).await.unwrap();
        assert_eq!(back, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(back.is_none());
    }
}
