//! Configuration artifact handed to the daemon via `--config`.
//!
//! The on-disk shape is a JSON array of watchers:
//!
//! ```json
//! [
//!   {
//!     "watchedFolder": "/tmp/sandbox/Src",
//!     "extensions": ["png"],
//!     "actions": [
//!       { "type": "copy", "destinationDir": "/tmp/sandbox/Dst", "destinationName": "${name}" },
//!       { "type": "remove" }
//!     ]
//!   }
//! ]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::template::{NameTemplate, TemplateError};

/// Ordered list of watchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionConfig {
    pub watchers: Vec<WatcherConfig>,
}

/// One watched folder with its optional extension filter and action chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    pub watched_folder: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
    pub actions: Vec<Action>,
}

/// One step of an action chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Copy(Transfer),
    Move(Transfer),
    Remove,
}

/// Destination of a copy or move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub destination_dir: PathBuf,
    pub destination_name: NameTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_existing: Option<bool>,
}

impl ActionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a watcher.
    pub fn watcher(mut self, watcher: WatcherConfig) -> Self {
        self.watchers.push(watcher);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Distinct watched folders, in first-seen order.
    pub fn watched_folders(&self) -> Vec<&Path> {
        let mut folders: Vec<&Path> = Vec::new();
        for watcher in &self.watchers {
            if !folders.contains(&watcher.watched_folder.as_path()) {
                folders.push(&watcher.watched_folder);
            }
        }
        folders
    }

    /// First watcher on `folder` whose extension filter accepts `file`.
    pub fn find_watcher(&self, folder: &Path, file: &Path) -> Option<&WatcherConfig> {
        self.watchers
            .iter()
            .find(|watcher| watcher.watched_folder == folder && watcher.accepts(file))
    }

    /// Check the structural rules the daemon enforces when loading a config.
    pub fn validate(&self) -> HarnessResult<()> {
        for (index, watcher) in self.watchers.iter().enumerate() {
            watcher
                .validate()
                .map_err(|reason| HarnessError::ConfigInvalid(format!("watcher #{index}: {reason}")))?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> HarnessResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> HarnessResult<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarnessError::fixture_io("create config dir", parent, e))?;
        }
        std::fs::write(path, json).map_err(|e| HarnessError::fixture_io("write config", path, e))
    }

    pub fn read_from(path: &Path) -> HarnessResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::fixture_io("read config", path, e))?;
        Self::from_json(&json)
    }
}

impl WatcherConfig {
    pub fn new(watched_folder: impl Into<PathBuf>) -> Self {
        Self {
            watched_folder: watched_folder.into(),
            extensions: None,
            actions: Vec::new(),
        }
    }

    /// Restrict the watcher to files with one of these extensions (no dot).
    pub fn extensions(mut self, extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Whether the extension filter accepts `file`. Matching is case-sensitive.
    pub fn accepts(&self, file: &Path) -> bool {
        match &self.extensions {
            None => true,
            Some(extensions) if extensions.is_empty() => true,
            Some(extensions) => file
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|allowed| allowed == ext)),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.watched_folder.as_os_str().is_empty() {
            return Err("watchedFolder must not be empty".to_string());
        }
        if self.actions.is_empty() {
            return Err("actions must not be empty".to_string());
        }
        for extension in self.extensions.iter().flatten() {
            if extension.is_empty() {
                return Err("extensions must not contain empty strings".to_string());
            }
            if extension.contains('.') {
                return Err(format!("extension '{extension}' must not contain a dot"));
            }
        }
        for (index, action) in self.actions.iter().enumerate() {
            if let Some(transfer) = action.transfer()
                && transfer.destination_dir.as_os_str().is_empty()
            {
                return Err(format!("action #{index}: destinationDir must not be empty"));
            }
            if action.ends_chain() && index + 1 < self.actions.len() {
                return Err(format!(
                    "action #{index}: no action may follow a {}",
                    action.kind()
                ));
            }
        }
        Ok(())
    }
}

impl Action {
    pub fn copy(destination_dir: impl Into<PathBuf>, name: &str) -> Result<Self, TemplateError> {
        Ok(Self::Copy(Transfer::new(destination_dir, name)?))
    }

    pub fn move_to(destination_dir: impl Into<PathBuf>, name: &str) -> Result<Self, TemplateError> {
        Ok(Self::Move(Transfer::new(destination_dir, name)?))
    }

    pub fn remove() -> Self {
        Self::Remove
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        match self {
            Self::Copy(transfer) | Self::Move(transfer) => Some(transfer),
            Self::Remove => None,
        }
    }

    /// Whether the source file is gone once this action has run.
    pub fn ends_chain(&self) -> bool {
        matches!(self, Self::Move(_) | Self::Remove)
    }

    /// Lowercase type tag as written in the config.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Copy(_) => "copy",
            Self::Move(_) => "move",
            Self::Remove => "remove",
        }
    }
}

impl Transfer {
    pub fn new(destination_dir: impl Into<PathBuf>, name: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            destination_dir: destination_dir.into(),
            destination_name: NameTemplate::parse(name)?,
            overwrite_existing: None,
        })
    }

    pub fn overwrite_existing(mut self, overwrite: bool) -> Self {
        self.overwrite_existing = Some(overwrite);
        self
    }

    /// Overwriting is the default when the flag is absent.
    pub fn overwrites(&self) -> bool {
        self.overwrite_existing.unwrap_or(true)
    }
}
