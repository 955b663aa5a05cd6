use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BookingRepository, PermissionSlipRepository, ProgramRepository, SchoolRepository,
    UserRepository,
};
use crate::error::{ReportError, ReportResult};
use crate::filter::{RecordQuery, StaticCatalog};
use crate::models::{
    BookingRecord, PermissionSlipRecord, ProgramRecord, SchoolRecord, UserRecord,
};

/// In-memory store for tests and the `demo` command.
///
/// `fail_next` and `with_latency` let callers simulate an unreachable or slow upstream.
#[derive(Default)]
pub struct MemoryRepository {
    bookings: RwLock<Vec<BookingRecord>>,
    programs: RwLock<Vec<ProgramRecord>>,
    schools: RwLock<Vec<SchoolRecord>>,
    slips: RwLock<Vec<PermissionSlipRecord>>,
    users: RwLock<Vec<UserRecord>>,
    failures_remaining: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_booking(&self, booking: BookingRecord) {
        write(&self.bookings).push(booking);
    }

    pub fn insert_program(&self, program: ProgramRecord) {
        write(&self.programs).push(program);
    }

    pub fn insert_school(&self, school: SchoolRecord) {
        write(&self.schools).push(school);
    }

    pub fn insert_slip(&self, slip: PermissionSlipRecord) {
        write(&self.slips).push(slip);
    }

    pub fn insert_user(&self, user: UserRecord) {
        write(&self.users).push(user);
    }

    /// Make the next `count` fetches fail with `DataUnavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Reference catalog derived from the stored records.
    pub fn catalog(&self) -> StaticCatalog {
        let mut catalog = StaticCatalog::new();
        for school in read(&self.schools).iter() {
            catalog = catalog.with_school(school.id, school.district_id);
        }
        for program in read(&self.programs).iter() {
            catalog = catalog.with_program(program.id);
        }
        for user in read(&self.users).iter() {
            if user.role == "teacher" {
                catalog = catalog.with_teacher(user.id);
            }
        }
        catalog
    }

    async fn gate(&self) -> ReportResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ReportError::DataUnavailable(
                "booking store unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn select<T: Clone>(
    records: &[T],
    id: impl Fn(&T) -> i64,
    keep: impl Fn(&T) -> bool,
    limit: Option<usize>,
) -> Vec<T> {
    let mut selected: Vec<T> = records.iter().filter(|record| keep(record)).cloned().collect();
    selected.sort_by_key(|record| id(record));
    if let Some(limit) = limit {
        selected.truncate(limit);
    }
    selected
}

#[async_trait]
impl BookingRepository for MemoryRepository {
    async fn bookings(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<BookingRecord>> {
        self.gate().await?;
        let records = read(&self.bookings);
        Ok(select(&records, |b| b.id, |b| query.matches_booking(b), limit))
    }
}

#[async_trait]
impl ProgramRepository for MemoryRepository {
    async fn programs(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<ProgramRecord>> {
        self.gate().await?;
        let records = read(&self.programs);
        Ok(select(&records, |p| p.id, |p| query.matches_program(p), limit))
    }
}

#[async_trait]
impl SchoolRepository for MemoryRepository {
    async fn schools(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<SchoolRecord>> {
        self.gate().await?;
        let records = read(&self.schools);
        Ok(select(&records, |s| s.id, |s| query.matches_school(s), limit))
    }
}

#[async_trait]
impl PermissionSlipRepository for MemoryRepository {
    async fn permission_slips(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<PermissionSlipRecord>> {
        self.gate().await?;
        let records = read(&self.slips);
        Ok(select(&records, |s| s.id, |s| query.matches_slip(s), limit))
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn users(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<UserRecord>> {
        self.gate().await?;
        let records = read(&self.users);
        Ok(select(&records, |u| u.id, |u| query.matches_user(u), limit))
    }
}
