//! Storage for task input and result files.
//!
//! Inputs are named `{task_id}_{slot}_{file_name}`; results keep the name
//! the worker gave them, which already starts with `{task_id}_{node_id}_`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{InputFile, TaskId, UploadFile};

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store an uploaded input under its slot. Returns the stored record.
    async fn write_input(&self, task_id: TaskId, slot: usize, file: &UploadFile) -> Result<InputFile>;

    /// Read back a stored input by the name [`FileStore::write_input`] gave it.
    async fn read_input(&self, file_name: &str) -> Result<Vec<u8>>;

    /// Store one result file.
    async fn write_output(&self, file: &UploadFile) -> Result<()>;

    /// Names of stored result files starting with `prefix`, in name order.
    async fn list_outputs(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read back a stored result file.
    async fn read_output(&self, file_name: &str) -> Result<Vec<u8>>;

    /// Remove the result files of a task, keeping its inputs.
    async fn remove_outputs(&self, task_id: TaskId) -> Result<()>;

    /// Remove every input and result file of a task. Best effort.
    async fn remove_task(&self, task_id: TaskId) -> Result<()>;
}

/// Files on the local filesystem under `input/` and `output/`.
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("input")).await?;
        tokio::fs::create_dir_all(root.join("output")).await?;
        Ok(Self { root })
    }

    fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}

/// Reject names that could escape the storage directory.
fn checked_name(file_name: &str) -> Result<&str> {
    let bare = Path::new(file_name).file_name().and_then(|n| n.to_str());
    match bare {
        Some(name) if name == file_name && !name.is_empty() => Ok(name),
        _ => Err(Error::Validation(format!("invalid file name: {file_name:?}"))),
    }
}

async fn read_named(dir: &Path, file_name: &str, kind: &str) -> Result<Vec<u8>> {
    let name = checked_name(file_name)?;
    match tokio::fs::read(dir.join(name)).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NotFound(format!("{kind} file {name}")))
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove_with_prefix(dir: &Path, prefix: &str) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), "failed to remove task file: {e}");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn write_input(&self, task_id: TaskId, slot: usize, file: &UploadFile) -> Result<InputFile> {
        let name = checked_name(&file.file_name)?;
        let stored = format!("{task_id}_{slot}_{name}");
        tokio::fs::write(self.input_dir().join(&stored), &file.data).await?;
        debug!(file = %stored, size = file.size(), "stored input file");
        Ok(InputFile {
            file_name: stored,
            file_size: file.size(),
        })
    }

    async fn read_input(&self, file_name: &str) -> Result<Vec<u8>> {
        read_named(&self.input_dir(), file_name, "input").await
    }

    async fn write_output(&self, file: &UploadFile) -> Result<()> {
        let name = checked_name(&file.file_name)?;
        tokio::fs::write(self.output_dir().join(name), &file.data).await?;
        debug!(file = %name, size = file.size(), "stored result file");
        Ok(())
    }

    async fn list_outputs(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(self.output_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_output(&self, file_name: &str) -> Result<Vec<u8>> {
        read_named(&self.output_dir(), file_name, "result").await
    }

    async fn remove_outputs(&self, task_id: TaskId) -> Result<()> {
        remove_with_prefix(&self.output_dir(), &format!("{task_id}_")).await
    }

    async fn remove_task(&self, task_id: TaskId) -> Result<()> {
        let prefix = format!("{task_id}_");
        remove_with_prefix(&self.input_dir(), &prefix).await?;
        remove_with_prefix(&self.output_dir(), &prefix).await
    }
}
