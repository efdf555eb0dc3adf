//! Action chains run against ready files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use charon_harness::action_config::{Action, ActionConfig, Transfer};
use charon_harness::template::{RenderInput, TemplateError};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("destination {} exists and overwriting is disabled", .0.display())]
    DestinationExists(PathBuf),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("{operation} {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ActionError {
    let path = path.to_path_buf();
    move |source| ActionError::Io {
        operation,
        path,
        source,
    }
}

/// Where a chain stands after each action.
#[derive(Debug)]
struct Chain {
    original: PathBuf,
    /// Current location of the file.
    current: PathBuf,
    /// Name produced by the last copy or move.
    previous: Option<PathBuf>,
}

pub struct Processor {
    config: ActionConfig,
    counter: AtomicU64,
}

impl Processor {
    pub fn new(config: ActionConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    /// Run the chain of the first watcher accepting `path` and return how
    /// many actions succeeded.
    pub async fn handle(&self, path: &Path) -> usize {
        let Some(folder) = path.parent() else {
            return 0;
        };
        let Some(watcher) = self.config.find_watcher(folder, path) else {
            debug!(file = %path.display(), "no watcher accepts file");
            return 0;
        };

        let mut chain = Chain {
            original: path.to_path_buf(),
            current: path.to_path_buf(),
            previous: None,
        };
        let mut succeeded = 0;
        for action in &watcher.actions {
            match self.apply(action, &mut chain).await {
                Ok(destination) => {
                    succeeded += 1;
                    info!(
                        action = action.kind(),
                        file = %path.display(),
                        destination = %destination.as_deref().unwrap_or(Path::new("-")).display(),
                        "Operation succeeded"
                    );
                }
                Err(error) => {
                    warn!(action = action.kind(), file = %path.display(), %error, "Operation failed");
                }
            }
        }
        succeeded
    }

    async fn apply(&self, action: &Action, chain: &mut Chain) -> Result<Option<PathBuf>, ActionError> {
        let source = chain.current.clone();
        match action {
            Action::Copy(transfer) => {
                let destination = self.destination(transfer, chain).await?;
                fs::copy(&source, &destination)
                    .await
                    .map_err(io_error("copy to", &destination))?;
                chain.previous = destination.file_name().map(PathBuf::from);
                Ok(Some(destination))
            }
            Action::Move(transfer) => {
                let destination = self.destination(transfer, chain).await?;
                move_file(&source, &destination).await?;
                chain.previous = destination.file_name().map(PathBuf::from);
                chain.current = destination.clone();
                Ok(Some(destination))
            }
            Action::Remove => {
                fs::remove_file(&source)
                    .await
                    .map_err(io_error("remove", &source))?;
                Ok(None)
            }
        }
    }

    /// Resolve and prepare the destination path of a copy or move.
    ///
    /// Counter values come from one sequence shared by every watcher and
    /// skip names already present in the destination folder.
    async fn destination(&self, transfer: &Transfer, chain: &Chain) -> Result<PathBuf, ActionError> {
        let dir = &transfer.destination_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(io_error("create directory", dir))?;

        let template = &transfer.destination_name;
        let render = |counter| {
            template.render(RenderInput {
                original: &chain.original,
                previous: chain.previous.as_deref(),
                counter,
            })
        };

        let destination = if template.counter_width().is_some() {
            loop {
                let value = self.counter.fetch_add(1, Ordering::SeqCst);
                let candidate = dir.join(render(Some(value))?);
                if !exists(&candidate).await {
                    break candidate;
                }
                debug!(skipped = %candidate.display(), "counter name taken");
            }
        } else {
            dir.join(render(None)?)
        };

        if !transfer.overwrites() && exists(&destination).await {
            return Err(ActionError::DestinationExists(destination));
        }
        Ok(destination)
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Rename, falling back to copy and remove when the rename fails (for
/// example across filesystems).
async fn move_file(source: &Path, destination: &Path) -> Result<(), ActionError> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(error) => {
            debug!(%error, "rename failed; copying instead");
            fs::copy(source, destination)
                .await
                .map_err(io_error("copy to", destination))?;
            fs::remove_file(source)
                .await
                .map_err(io_error("remove", source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_harness::action_config::WatcherConfig;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("Src")).unwrap();
            Self { dir }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.dir.path().join(relative)
        }

        fn write(&self, relative: &str, content: &str) -> PathBuf {
            let path = self.path(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            path
        }

        fn read(&self, relative: &str) -> String {
            std::fs::read_to_string(self.path(relative)).unwrap()
        }

        fn watcher(&self) -> WatcherConfig {
            WatcherConfig::new(self.path("Src"))
        }
    }

    #[tokio::test]
    async fn test_copy_keeps_source() {
        let fx = Fixture::new();
        let processor = Processor::new(
            ActionConfig::new().watcher(fx.watcher().action(Action::copy(fx.path("Dst"), "${name}").unwrap())),
        );
        let file = fx.write("Src/myFile", "a\nb\nc");
        assert_eq!(processor.handle(&file).await, 1);
        assert_eq!(fx.read("Dst/myFile"), "a\nb\nc");
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_backup_chain_follows_previous_name() {
        let fx = Fixture::new();
        let processor = Processor::new(
            ActionConfig::new().watcher(
                fx.watcher()
                    .action(Action::copy(fx.path("Dst1"), "file_###").unwrap())
                    .action(Action::copy(fx.path("Dst2"), "${previousName}").unwrap())
                    .action(Action::move_to(fx.path("Dst3"), "${previousName}").unwrap()),
            ),
        );
        fx.write("Dst2/file_000.csv", "stale");
        let file = fx.write("Src/report.csv", "fresh");
        assert_eq!(processor.handle(&file).await, 3);
        assert_eq!(fx.read("Dst1/file_000.csv"), "fresh");
        assert_eq!(fx.read("Dst2/file_000.csv"), "fresh");
        assert_eq!(fx.read("Dst3/file_000.csv"), "fresh");
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_counter_skips_taken_names() {
        let fx = Fixture::new();
        let processor = Processor::new(
            ActionConfig::new().watcher(fx.watcher().action(Action::move_to(fx.path("Dst"), "file_###").unwrap())),
        );
        fx.write("Dst/file_000.png", "");
        let first = fx.write("Src/a.png", "");
        let second = fx.write("Src/b.jpg", "");
        assert_eq!(processor.handle(&first).await, 1);
        assert_eq!(processor.handle(&second).await, 1);
        assert!(fx.path("Dst/file_001.png").exists());
        assert!(fx.path("Dst/file_002.jpg").exists());
    }

    #[tokio::test]
    async fn test_overwrite_disabled_fails_operation() {
        let fx = Fixture::new();
        let copy = Action::Copy(
            Transfer::new(fx.path("Dst"), "${name}")
                .unwrap()
                .overwrite_existing(false),
        );
        let processor = Processor::new(ActionConfig::new().watcher(fx.watcher().action(copy)));
        fx.write("Dst/x.txt", "old");
        let file = fx.write("Src/x.txt", "new");
        assert_eq!(processor.handle(&file).await, 0);
        assert_eq!(fx.read("Dst/x.txt"), "old");
    }

    #[tokio::test]
    async fn test_copy_then_remove_clears_source() {
        let fx = Fixture::new();
        let processor = Processor::new(
            ActionConfig::new().watcher(
                fx.watcher()
                    .action(Action::copy(fx.path("Dst"), "${name}").unwrap())
                    .action(Action::remove()),
            ),
        );
        let file = fx.write("Src/kept.tmp", "x");
        assert_eq!(processor.handle(&file).await, 2);
        assert!(!file.exists());
        assert_eq!(fx.read("Dst/kept.tmp"), "x");
    }

    #[tokio::test]
    async fn test_first_matching_watcher_wins() {
        let fx = Fixture::new();
        let processor = Processor::new(
            ActionConfig::new()
                .watcher(fx.watcher().extensions(["forRemove"]).action(Action::remove()))
                .watcher(fx.watcher().action(Action::copy(fx.path("Dst"), "${name}").unwrap())),
        );
        let removed = fx.write("Src/a.forRemove", "x");
        let copied = fx.write("Src/a.forCopy", "y");
        assert_eq!(processor.handle(&removed).await, 1);
        assert_eq!(processor.handle(&copied).await, 1);
        assert!(!removed.exists());
        assert_eq!(fx.read("Dst/a.forCopy"), "y");
        assert_eq!(processor.handle(&fx.path("Other/a.forCopy")).await, 0);
    }
}
