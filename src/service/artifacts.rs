//! 发票文件落盘。
//!
//! 目录结构 (相对存储根目录):
//! - `pdf/`, `xml/`, `zip/`: `{serie}-{folio}.{ext}`
//! - `errores/`: 标注后的错误表格 `{stem}_errores.csv`
//! - `uploads/`: 原始上传, 带 UTC 时间戳前缀

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ERRORS_DIR: &str = "errores";
const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("nombre de archivo inválido: {0}")]
    InvalidName(String),

    #[error("error de E/S en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 发票文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Pdf,
    Xml,
    Zip,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::Pdf, Self::Xml, Self::Zip];

    /// 目录名与扩展名相同
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Xml => "xml",
            Self::Zip => "zip",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Xml => "application/xml",
            Self::Zip => "application/zip",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArtifactKind {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "xml" => Ok(Self::Xml),
            "zip" => Ok(Self::Zip),
            other => Err(ArtifactError::InvalidName(other.to_string())),
        }
    }
}

/// 只保留最后一段文件名, 拒绝空名与 `..`
fn safe_file_name(name: &str) -> Result<&str, ArtifactError> {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .ok_or_else(|| ArtifactError::InvalidName(name.to_string()))
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 启动时创建全部子目录
    pub async fn ensure_dirs(&self) -> Result<(), ArtifactError> {
        let dirs = ArtifactKind::ALL
            .iter()
            .map(|k| self.root.join(k.extension()))
            .chain([self.root.join(ERRORS_DIR), self.root.join(UPLOADS_DIR)]);
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| ArtifactError::Io { path: dir.clone(), source })?;
        }
        Ok(())
    }

    pub fn file_name(serie: &str, folio: i64, kind: ArtifactKind) -> String {
        format!("{}-{}.{}", serie, folio, kind.extension())
    }

    pub fn invoice_path(&self, serie: &str, folio: i64, kind: ArtifactKind) -> PathBuf {
        self.root
            .join(kind.extension())
            .join(Self::file_name(serie, folio, kind))
    }

    pub async fn save_invoice_file(
        &self,
        serie: &str,
        folio: i64,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.invoice_path(serie, folio, kind);
        write(&path, bytes).await?;
        tracing::info!("{} guardado en {}", kind.extension().to_uppercase(), path.display());
        Ok(path)
    }

    /// 错误表格的文件名: 上传名去掉扩展名 + `_errores.csv`
    pub fn error_sheet_name(upload_name: &str) -> String {
        let stem = safe_file_name(upload_name)
            .ok()
            .and_then(|n| Path::new(n).file_stem().and_then(|s| s.to_str()))
            .filter(|s| !s.is_empty())
            .unwrap_or("archivo");
        format!("{stem}_errores.csv")
    }

    pub async fn save_error_sheet(
        &self,
        upload_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        let path = self
            .root
            .join(ERRORS_DIR)
            .join(Self::error_sheet_name(upload_name));
        write(&path, bytes).await?;
        Ok(path)
    }

    pub fn error_sheet_path(&self, file_name: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(ERRORS_DIR).join(safe_file_name(file_name)?))
    }

    /// 保存原始上传, 返回实际写入的路径
    pub async fn save_upload(
        &self,
        original_name: &str,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ArtifactError> {
        let name = safe_file_name(original_name).unwrap_or("archivo.csv");
        let path = self
            .root
            .join(UPLOADS_DIR)
            .join(format!("{}_{}", now.format("%Y%m%d%H%M%S"), name));
        write(&path, bytes).await?;
        Ok(path)
    }

    /// 读取文件; 不存在时返回 `Ok(None)`
    pub async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, ArtifactError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

async fn write(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, bytes).await.map_err(io_err)
}
