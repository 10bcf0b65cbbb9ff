use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Default,
}

impl PermissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Default => "default",
        }
    }
}

/// Delivery collaborator for fired reminders. Best effort: callers ignore
/// the result beyond logging.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, title: &str, body: &str, icon: &str) -> Result<(), InfraError>;
}

#[async_trait]
pub trait PermissionSource: Send + Sync {
    fn current_permission(&self) -> PermissionState;
    async fn request_permission(&self) -> PermissionState;
}

/// Direct local fallback sink: appends each notification as one JSON line.
#[derive(Debug)]
pub struct LogNotificationSink {
    path: PathBuf,
    guard: Mutex<()>,
}

impl LogNotificationSink {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join("notifications.log"),
            guard: Mutex::new(()),
        }
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, title: &str, body: &str, icon: &str) -> Result<(), InfraError> {
        let _guard = self
            .guard
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("notification lock poisoned: {error}")))?;
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "title": title,
            "body": body,
            "icon": icon,
        });
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{payload}")?;
        Ok(())
    }
}

/// Fixed-answer permission source for headless runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionSource {
    state: PermissionState,
}

impl StaticPermissionSource {
    pub fn new(state: PermissionState) -> Self {
        Self { state }
    }

    pub fn granted() -> Self {
        Self::new(PermissionState::Granted)
    }
}

#[async_trait]
impl PermissionSource for StaticPermissionSource {
    fn current_permission(&self) -> PermissionState {
        self.state
    }

    async fn request_permission(&self) -> PermissionState {
        self.state
    }
}
