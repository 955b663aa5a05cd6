//! Persistence seams for jobs, schedules and artifact bytes.
//!
//! Postgres implementations live in `crate::db`; the in-memory and filesystem
//! ones here back the tests and the `demo` command.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ReportError, ReportResult};
use crate::job::{JobStatus, ReportJob};
use crate::schedule::Schedule;

pub const DEFAULT_PER_PAGE: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListQuery {
    /// Matches `JobDefinition::type_label`.
    pub report_type: Option<String>,
    pub status: Option<JobStatus>,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
}

impl Default for JobListQuery {
    fn default() -> Self {
        Self {
            report_type: None,
            status: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl JobListQuery {
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.per_page
    }

    pub fn matches(&self, job: &ReportJob) -> bool {
        self.report_type
            .as_deref()
            .map_or(true, |label| job.definition.type_label() == label)
            && self.status.map_or(true, |status| job.status == status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub current_page: usize,
    pub per_page: usize,
    pub total: usize,
    pub last_page: usize,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, query: &JobListQuery, total: usize) -> Self {
        let per_page = query.per_page.max(1);
        Self {
            data,
            current_page: query.page.max(1),
            per_page,
            total,
            last_page: total.div_ceil(per_page).max(1),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            current_page: self.current_page,
            per_page: self.per_page,
            total: self.total,
            last_page: self.last_page,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &ReportJob) -> ReportResult<()>;
    async fn update(&self, job: &ReportJob) -> ReportResult<()>;
    async fn get(&self, id: Uuid) -> ReportResult<Option<ReportJob>>;
    /// Newest first.
    async fn list(&self, query: &JobListQuery) -> ReportResult<Page<ReportJob>>;
    async fn delete(&self, id: Uuid) -> ReportResult<bool>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, schedule: &Schedule) -> ReportResult<()>;
    async fn update(&self, schedule: &Schedule) -> ReportResult<()>;
    async fn get(&self, id: Uuid) -> ReportResult<Option<Schedule>>;
    /// Active schedules whose next trigger is at or before `now`.
    async fn due(&self, now: DateTime<Utc>) -> ReportResult<Vec<Schedule>>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `bytes` under `key` and return the stored path.
    async fn put(&self, key: &str, bytes: &[u8]) -> ReportResult<String>;
    async fn get(&self, path: &str) -> ReportResult<Vec<u8>>;
    async fn exists(&self, path: &str) -> ReportResult<bool>;
    async fn delete(&self, path: &str) -> ReportResult<()>;
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ReportJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ReportJob> {
        let mut jobs: Vec<ReportJob> = read(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ReportJob) -> ReportResult<()> {
        write(&self.jobs).insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &ReportJob) -> ReportResult<()> {
        let mut jobs = write(&self.jobs);
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(ReportError::NotFound(format!("report job {}", job.id))),
        }
    }

    async fn get(&self, id: Uuid) -> ReportResult<Option<ReportJob>> {
        Ok(read(&self.jobs).get(&id).cloned())
    }

    async fn list(&self, query: &JobListQuery) -> ReportResult<Page<ReportJob>> {
        let mut matching: Vec<ReportJob> = read(&self.jobs)
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matching.len();
        let data = matching
            .into_iter()
            .skip(query.offset())
            .take(query.per_page)
            .collect();
        Ok(Page::new(data, query, total))
    }

    async fn delete(&self, id: Uuid) -> ReportResult<bool> {
        Ok(write(&self.jobs).remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: &Schedule) -> ReportResult<()> {
        write(&self.schedules).insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> ReportResult<()> {
        let mut schedules = write(&self.schedules);
        match schedules.get_mut(&schedule.id) {
            Some(stored) => {
                *stored = schedule.clone();
                Ok(())
            }
            None => Err(ReportError::NotFound(format!("schedule {}", schedule.id))),
        }
    }

    async fn get(&self, id: Uuid) -> ReportResult<Option<Schedule>> {
        Ok(read(&self.schedules).get(&id).cloned())
    }

    async fn due(&self, now: DateTime<Utc>) -> ReportResult<Vec<Schedule>> {
        let mut due: Vec<Schedule> = read(&self.schedules)
            .values()
            .filter(|schedule| schedule.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|schedule| schedule.trigger_at());
        Ok(due)
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        read(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.files).is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> ReportResult<String> {
        write(&self.files).insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, path: &str) -> ReportResult<Vec<u8>> {
        read(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| ReportError::NotFound(format!("artifact {path}")))
    }

    async fn exists(&self, path: &str) -> ReportResult<bool> {
        Ok(read(&self.files).contains_key(path))
    }

    async fn delete(&self, path: &str) -> ReportResult<()> {
        write(&self.files).remove(path);
        Ok(())
    }
}

/// Artifacts as files under a root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a relative key under the root, refusing `..` and absolute paths.
    pub fn resolve(&self, key: &str) -> ReportResult<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || key.is_empty() {
            return Err(ReportError::Storage(format!("invalid artifact path {key}")));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ReportError {
    ReportError::Storage(format!("{}: {err}", path.display()))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> ReportResult<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(parent, err))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| io_error(&path, err))?;
        Ok(key.to_string())
    }

    async fn get(&self, path: &str) -> ReportResult<Vec<u8>> {
        let resolved = self.resolve(path)?;
        match tokio::fs::read(&resolved).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ReportError::NotFound(format!("artifact {path}")))
            }
            Err(err) => Err(io_error(&resolved, err)),
        }
    }

    async fn exists(&self, path: &str) -> ReportResult<bool> {
        let resolved = self.resolve(path)?;
        tokio::fs::try_exists(&resolved)
            .await
            .map_err(|err| io_error(&resolved, err))
    }

    async fn delete(&self, path: &str) -> ReportResult<()> {
        let resolved = self.resolve(path)?;
        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&resolved, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math_rounds_up() {
        let query = JobListQuery {
            page: 2,
            per_page: 15,
            ..JobListQuery::default()
        };
        let page: Page<u8> = Page::new(Vec::new(), &query, 31);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.current_page, 2);
        assert_eq!(query.offset(), 15);
    }

    #[test]
    fn fs_store_refuses_escaping_paths() {
        let store = FsArtifactStore::new("/tmp/spark-reports");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("exports/a.csv").is_ok());
    }

    #[tokio::test]
    async fn memory_artifacts_round_trip_and_delete() {
        let store = MemoryArtifactStore::new();
        let path = store.put("exports/a.csv", b"id\n").await.unwrap();
        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap(), b"id\n");
        store.delete(&path).await.unwrap();
        assert!(!store.exists(&path).await.unwrap());
        assert!(matches!(
            store.get(&path).await,
            Err(ReportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_artifacts_are_written_under_the_root() {
        let root = std::env::temp_dir().join(format!("spark-reports-{}", Uuid::new_v4()));
        let store = FsArtifactStore::new(&root);
        store.put("reports/r.json", b"{}").await.unwrap();
        assert!(root.join("reports/r.json").exists());
        assert_eq!(store.get("reports/r.json").await.unwrap(), b"{}");
        store.delete("reports/r.json").await.unwrap();
        assert!(!store.exists("reports/r.json").await.unwrap());
        let _ = std::fs::remove_dir_all(root);
    }
}
