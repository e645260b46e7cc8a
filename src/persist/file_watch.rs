use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};
use tracing_error::SpanTrace;

use super::error::PersistError;

/// Resolves once every file in `files` exists.
///
/// Directory events wake the check early, `recheck` bounds the delay on
/// filesystems that do not emit events.
#[instrument("persist/wait_for_files", skip(files), level = "trace")]
pub async fn wait_for_files(
    dir: &Path,
    files: &[PathBuf],
    recheck: Duration,
) -> Result<(), PersistError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let _ = tx.send(event);
    })
    .map_err(|source| watch_error(dir, source))?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|source| watch_error(dir, source))?;

    // Files written before the watch was registered produce no event.
    loop {
        let missing: Vec<&PathBuf> = files.iter().filter(|f| !f.is_file()).collect();
        if missing.is_empty() {
            debug!("All output files present in '{}'.", dir.display());
            return Ok(());
        }
        trace!("Still waiting for {:?}.", missing);

        tokio::select! {
            event = rx.recv() => match event {
                Some(Ok(_)) => {}
                Some(Err(source)) => return Err(watch_error(dir, source)),
                None => tokio::time::sleep(recheck).await,
            },
            _ = tokio::time::sleep(recheck) => {}
        }
    }
}

fn watch_error(dir: &Path, source: notify::Error) -> PersistError {
    PersistError::Watch {
        path: dir.to_path_buf(),
        source,
        span_trace: SpanTrace::capture(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_files_resolve_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("output.json");
        std::fs::write(&file, "{}").unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_files(dir.path(), &[file], Duration::from_secs(60)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        std::fs::write(&first, "{}").unwrap();

        let writer_path = second.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(writer_path, "{}").await.unwrap();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_files(dir.path(), &[first, second], Duration::from_millis(200)),
        )
        .await
        .unwrap()
        .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let result = wait_for_files(&missing, &[missing.join("x")], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PersistError::Watch { .. })));
    }
}
