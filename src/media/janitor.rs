use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Deletes regular files in `dir` last modified more than `max_age` ago.
/// Returns how many were removed.
pub async fn sweep(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %entry.path().display(), "Failed to stat scratch file: {}", e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale file");
                removed += 1;
            }
            // Already consumed by its stream
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "Failed to remove stale file: {}", e),
        }
    }

    Ok(removed)
}

/// Runs `sweep` every `interval` for the lifetime of the process.
pub fn spawn(dir: PathBuf, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep(&dir, max_age).await {
                Ok(0) => debug!(dir = %dir.display(), "Janitor sweep found nothing to remove"),
                Ok(count) => info!(dir = %dir.display(), "Janitor removed {} stale files", count),
                Err(e) => warn!(dir = %dir.display(), "Janitor sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("youtube_1_old.mp4");
        let fresh = dir.path().join("tiktok_2_new.mp4");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        age_file(&old, Duration::from_secs(2 * 3600));

        let removed = sweep(dir.path(), Duration::from_secs(3600)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        let removed = sweep(dir.path(), Duration::ZERO).await.unwrap();

        assert_eq!(removed, 0);
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert_eq!(sweep(&missing, Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_janitor_sweeps_immediately() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("stale.part");
        std::fs::write(&old, b"x").unwrap();
        age_file(&old, Duration::from_secs(120));

        let handle = spawn(
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );

        for _ in 0..50 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert!(!old.exists());
    }
}
