//! Scratch-directory files owned by a single download attempt.
//!
//! `AttemptFiles` owns every file carrying the attempt's stem until the attempt
//! either fails (all of them are removed) or succeeds (the output is handed to a
//! `StagedFile`). `StagedStream` reads a `StagedFile` and removes it once the
//! stream ends, errors, or is dropped by a disconnected client.

use chrono::Utc;
use futures_util::Stream;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::platform::Platform;

const LEFTOVER_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

#[derive(Debug)]
pub struct AttemptFiles {
    dir: PathBuf,
    stem: String,
    armed: bool,
}

impl AttemptFiles {
    pub fn new(dir: &Path, platform: Platform) -> Self {
        let stem = format!(
            "{}_{}_{}",
            platform.tag(),
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        Self {
            dir: dir.to_path_buf(),
            stem,
            armed: true,
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Output template handed to the downloader; it substitutes `%(ext)s`.
    pub fn output_template(&self) -> String {
        self.dir
            .join(format!("{}.%(ext)s", self.stem))
            .to_string_lossy()
            .into_owned()
    }

    pub fn expected_path(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, extension))
    }

    fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.stem)
            .is_some_and(|rest| rest.starts_with('.'))
    }

    /// Finds the finished, non-empty output file for this attempt.
    pub async fn locate_output(&self, extension: &str) -> std::io::Result<Option<(PathBuf, u64)>> {
        let expected = self.expected_path(extension);
        if let Some(size) = non_empty_file_size(&expected).await? {
            return Ok(Some((expected, size)));
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.owns(&name) || LEFTOVER_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                continue;
            }
            let path = entry.path();
            if let Some(size) = non_empty_file_size(&path).await? {
                return Ok(Some((path, size)));
            }
        }

        Ok(None)
    }

    /// Removes every file belonging to this attempt.
    pub async fn discard(mut self) {
        self.armed = false;
        for path in self.owned_paths_async().await {
            remove_quietly_async(&path).await;
        }
    }

    /// Keeps `output` and removes any other file belonging to this attempt.
    pub async fn into_staged(mut self, output: PathBuf) -> StagedFile {
        self.armed = false;
        for path in self.owned_paths_async().await {
            if path != output {
                remove_quietly_async(&path).await;
            }
        }
        StagedFile::new(output)
    }

    async fn owned_paths_async(&self) -> Vec<PathBuf> {
        let mut owned = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), "failed to list scratch dir: {}", e);
                return owned;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if self.owns(&entry.file_name().to_string_lossy()) {
                owned.push(entry.path());
            }
        }
        owned
    }

    fn owned_paths(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| self.owns(&entry.file_name().to_string_lossy()))
                .map(|entry| entry.path())
                .collect(),
            Err(e) => {
                warn!(dir = %self.dir.display(), "failed to list scratch dir: {}", e);
                Vec::new()
            }
        }
    }
}

impl Drop for AttemptFiles {
    /// Reached when the attempt future is cancelled mid-flight. The directory
    /// scan runs on the blocking pool when a runtime is available.
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orphaned = AttemptFiles {
            dir: std::mem::take(&mut self.dir),
            stem: std::mem::take(&mut self.stem),
            armed: false,
        };
        let sweep = move || {
            for path in orphaned.owned_paths() {
                remove_quietly(&path);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(sweep)),
            Err(_) => sweep(),
        }
    }
}

/// A finished download in the scratch directory, removed on drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    removed: bool,
}

impl StagedFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent; a file that is already gone is not an error. A single
    /// unlink, so it runs inline even on a runtime thread.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        remove_quietly(&self.path);
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Single-pass byte stream over a `StagedFile`.
pub struct StagedStream {
    inner: ReaderStream<File>,
    file: Option<StagedFile>,
}

impl StagedStream {
    pub async fn open(file: StagedFile) -> std::io::Result<Self> {
        let handle = File::open(file.path()).await?;
        Ok(Self {
            inner: ReaderStream::new(handle),
            file: Some(file),
        })
    }

    /// Backing file, until the stream has finished with it.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(StagedFile::path)
    }
}

impl Stream for StagedStream {
    type Item = <ReaderStream<File> as Stream>::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            if let Some(mut file) = this.file.take() {
                file.remove();
            }
        }
        polled
    }
}

async fn non_empty_file_size(path: &Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temp file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove temp file: {}", e),
    }
}

async fn remove_quietly_async(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed temp file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove temp file: {}", e),
    }
}
