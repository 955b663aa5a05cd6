//! Routing finished artifacts to downloads, email and storage paths.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::{ReportError, ReportResult, Stage};
use crate::job::ReportJob;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DeliveryTarget {
    Download,
    Email {
        recipients: Vec<String>,
        subject: Option<String>,
        message: Option<String>,
        /// Attach the artifact instead of linking to it.
        attach: bool,
        /// Gzip the attachment when the artifact is not already compressed.
        compress: bool,
    },
    /// Directory relative to the storage root.
    Storage { path: String },
}

impl DeliveryTarget {
    pub fn method(&self) -> &'static str {
        match self {
            DeliveryTarget::Download => "download",
            DeliveryTarget::Email { .. } => "email",
            DeliveryTarget::Storage { .. } => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DeliveryReceipt {
    Download {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Email {
        recipients: Vec<String>,
        attached: bool,
    },
    Storage {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> ReportResult<()>;
}

/// Writes each message as JSON (plus attachment files) into an outbox directory.
pub struct OutboxMailer {
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, message: &EmailMessage) -> ReportResult<()> {
        let failure = |err: std::io::Error| ReportError::DeliveryFailure(format!("outbox: {err}"));
        tokio::fs::create_dir_all(&self.dir).await.map_err(failure)?;

        let id = Uuid::new_v4();
        for attachment in &message.attachments {
            let path = self.dir.join(format!("{id}-{}", attachment.filename));
            tokio::fs::write(&path, &attachment.bytes)
                .await
                .map_err(failure)?;
        }
        let body = serde_json::to_vec_pretty(message)
            .map_err(|err| ReportError::DeliveryFailure(format!("outbox: {err}")))?;
        tokio::fs::write(self.dir.join(format!("{id}.json")), body)
            .await
            .map_err(failure)?;
        Ok(())
    }
}

/// Keeps sent messages in memory. `fail_next` simulates an SMTP outage.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failures_remaining: AtomicUsize,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> ReportResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ReportError::DeliveryFailure("mail transport unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadHandle {
    pub token: String,
    pub job_id: Uuid,
    pub file_path: String,
    pub filename: String,
    pub expires_at: DateTime<Utc>,
}

/// Expiring download tokens.
pub struct DownloadRegistry {
    ttl: Duration,
    handles: RwLock<HashMap<String, DownloadHandle>>,
}

impl DownloadRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn issue(
        &self,
        job_id: Uuid,
        file_path: &str,
        filename: &str,
        now: DateTime<Utc>,
    ) -> DownloadHandle {
        let handle = DownloadHandle {
            token: Uuid::new_v4().simple().to_string(),
            job_id,
            file_path: file_path.to_string(),
            filename: filename.to_string(),
            expires_at: now + self.ttl,
        };
        self.handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle.token.clone(), handle.clone());
        handle
    }

    pub fn resolve(&self, token: &str, now: DateTime<Utc>) -> ReportResult<DownloadHandle> {
        let mut handles = self
            .handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match handles.get(token) {
            None => Err(ReportError::NotFound("download link".to_string())),
            Some(handle) if handle.expires_at <= now => {
                handles.remove(token);
                Err(ReportError::NotFound("download link expired".to_string()))
            }
            Some(handle) => Ok(handle.clone()),
        }
    }

    /// Drop every handle for `job_id`.
    pub fn revoke_job(&self, job_id: Uuid) {
        self.handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, handle| handle.job_id != job_id);
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut handles = self
            .handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = handles.len();
        handles.retain(|_, handle| handle.expires_at > now);
        before - handles.len()
    }
}

/// Storage targets must be relative paths that stay below the storage root.
pub fn is_relative_storage_path(path: &str) -> bool {
    !path.trim().is_empty()
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

pub struct DeliveryDispatcher {
    mailer: Arc<dyn Mailer>,
    storage_root: PathBuf,
    downloads: DownloadRegistry,
    timeout: StdDuration,
}

impl DeliveryDispatcher {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        storage_root: impl Into<PathBuf>,
        download_ttl: Duration,
        timeout: StdDuration,
    ) -> Self {
        Self {
            mailer,
            storage_root: storage_root.into(),
            downloads: DownloadRegistry::new(download_ttl),
            timeout,
        }
    }

    pub fn downloads(&self) -> &DownloadRegistry {
        &self.downloads
    }

    /// Deliver the stored artifact of a completed `job`.
    pub async fn deliver(
        &self,
        job: &ReportJob,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> ReportResult<DeliveryReceipt> {
        let secs = self.timeout.as_secs();
        let receipt = tokio::time::timeout(self.timeout, self.dispatch(job, artifact, now))
            .await
            .map_err(|_| ReportError::Timeout {
                stage: Stage::Deliver,
                secs,
            })??;
        info!(
            job_id = %job.id,
            method = job.definition.delivery.method(),
            bytes = artifact.size_bytes,
            "artifact delivered"
        );
        Ok(receipt)
    }

    async fn dispatch(
        &self,
        job: &ReportJob,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> ReportResult<DeliveryReceipt> {
        let file_path = job
            .file_path
            .as_deref()
            .ok_or_else(|| ReportError::DeliveryFailure("job has no stored artifact".to_string()))?;
        let filename = format!("{}.{}", job.definition.filename, artifact.extension());

        match &job.definition.delivery {
            DeliveryTarget::Download => {
                let handle = self.downloads.issue(job.id, file_path, &filename, now);
                Ok(DeliveryReceipt::Download {
                    token: handle.token,
                    expires_at: handle.expires_at,
                })
            }
            DeliveryTarget::Email {
                recipients,
                subject,
                message,
                attach,
                compress,
            } => {
                if recipients.is_empty() {
                    return Err(ReportError::DeliveryFailure(
                        "email delivery requires a recipient".to_string(),
                    ));
                }
                let mut body = message.clone().unwrap_or_default();
                if !body.is_empty() {
                    body.push_str("\n\n");
                }
                body.push_str(&format!("Report: {}\n", job.definition.title));

                let mut attachments = Vec::new();
                if *attach {
                    let attachment = if *compress && !artifact.compressed {
                        let packed = artifact.clone().compress()?;
                        Attachment {
                            filename: format!("{filename}.gz"),
                            content_type: packed.content_type().to_string(),
                            size_bytes: packed.size_bytes,
                            bytes: packed.bytes,
                        }
                    } else {
                        Attachment {
                            filename: filename.clone(),
                            content_type: artifact.content_type().to_string(),
                            size_bytes: artifact.size_bytes,
                            bytes: artifact.bytes.clone(),
                        }
                    };
                    attachments.push(attachment);
                } else {
                    let handle = self.downloads.issue(job.id, file_path, &filename, now);
                    body.push_str(&format!(
                        "Download: /downloads/{} (expires {})\n",
                        handle.token,
                        handle.expires_at.format("%Y-%m-%d %H:%M UTC")
                    ));
                }

                let email = EmailMessage {
                    to: recipients.clone(),
                    subject: subject
                        .clone()
                        .unwrap_or_else(|| job.definition.title.clone()),
                    body,
                    attachments,
                };
                self.mailer.send(&email).await?;
                Ok(DeliveryReceipt::Email {
                    recipients: recipients.clone(),
                    attached: *attach,
                })
            }
            DeliveryTarget::Storage { path } => {
                let directory = self.storage_dir(path)?;
                let destination = directory.join(&filename);
                let failure = |err: std::io::Error| {
                    ReportError::DeliveryFailure(format!("{}: {err}", destination.display()))
                };
                tokio::fs::create_dir_all(&directory)
                    .await
                    .map_err(failure)?;
                tokio::fs::write(&destination, &artifact.bytes)
                    .await
                    .map_err(failure)?;
                Ok(DeliveryReceipt::Storage {
                    path: destination.display().to_string(),
                })
            }
        }
    }

    fn storage_dir(&self, path: &str) -> ReportResult<PathBuf> {
        if !is_relative_storage_path(path) {
            return Err(ReportError::DeliveryFailure(format!(
                "invalid storage path {path}"
            )));
        }
        Ok(self.storage_root.join(path))
    }

    /// Tell `recipients` that a scheduled report gave up.
    pub async fn notify_failure(
        &self,
        recipients: &[String],
        title: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> ReportResult<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        let email = EmailMessage {
            to: recipients.to_vec(),
            subject: format!("Scheduled Report Failed: {title}"),
            body: format!(
                "The scheduled report \"{title}\" failed at {}.\n\n{error_message}\n",
                now.format("%Y-%m-%d %H:%M UTC")
            ),
            attachments: Vec::new(),
        };
        match self.mailer.send(&email).await {
            Ok(()) => {
                info!(recipients = recipients.len(), title, "failure notification sent");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, title, "failure notification not sent");
                Err(err)
            }
        }
    }
}
