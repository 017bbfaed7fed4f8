//! Traffic Log: append-only, one JSON object per line. Writes are
//! best-effort — a failed append is reported to stderr and discarded,
//! never blocks request handling.

use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// One disposition record for a single HTTP request.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficEntry {
    pub timestamp: String,
    pub action: &'static str,
    pub mode: &'static str,
    pub host: String,
    pub path: String,
    pub method: String,
    pub reason: String,
}

impl TrafficEntry {
    pub fn now(
        action: &'static str,
        mode: &'static str,
        host: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            action,
            mode,
            host: host.into(),
            path: path.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }
}

/// Appends [`TrafficEntry`] records to a fixed file. Open mode is
/// append-only with `O_APPEND` semantics so concurrent writers (should
/// they exist) cannot overwrite each other; an advisory exclusive file
/// lock additionally prevents interleaved partial lines.
#[derive(Clone)]
pub struct TrafficLog {
    path: PathBuf,
}

impl TrafficLog {
    /// Opens (creating if needed) the log file at `path` with mode 0600
    /// and the containing directory at 0755.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)?;
        drop(file);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(Self { path })
    }

    /// Best-effort append, run on the blocking thread pool so a slow disk
    /// never stalls the connection task driving it.
    pub async fn append(&self, entry: TrafficEntry) {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || Self::append_sync(&path, &entry)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                eprintln!("traffic log append failed: {err}");
            }
            Err(join_err) => {
                eprintln!("traffic log append task panicked: {join_err}");
            }
        }
    }

    fn append_sync(path: &Path, entry: &TrafficEntry) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.lock_exclusive()?;
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer(&mut writer, entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        FileExt::unlock(&file)?;
        Ok(())
    }
}
