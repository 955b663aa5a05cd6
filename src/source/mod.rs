//! Data source adapters, one per `DataType`.
//!
//! Adapters turn repository records into a `Table`. Repositories own the
//! query itself and are injected, so the Postgres store and the in-memory
//! fixture are interchangeable.

mod adapters;
pub mod columns;
mod memory;

pub use adapters::{
    AnalyticsSummarySource, BookingsSource, FinancialSource, PermissionSlipsSource,
    ProgramsSource, SchoolsSource, UsersSource,
};
pub use memory::MemoryRepository;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{ReportError, ReportResult};
use crate::filter::RecordQuery;
use crate::models::{
    BookingRecord, DataType, PermissionSlipRecord, ProgramRecord, SchoolRecord, UserRecord,
};
use crate::table::Table;

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Bookings matching `query`, in id order, at most `limit` of them.
    async fn bookings(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<BookingRecord>>;
}

#[async_trait]
pub trait ProgramRepository: Send + Sync {
    async fn programs(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<ProgramRecord>>;
}

#[async_trait]
pub trait SchoolRepository: Send + Sync {
    async fn schools(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<SchoolRecord>>;
}

#[async_trait]
pub trait PermissionSlipRepository: Send + Sync {
    async fn permission_slips(
        &self,
        query: &RecordQuery,
        limit: Option<usize>,
    ) -> ReportResult<Vec<PermissionSlipRecord>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn users(&self, query: &RecordQuery, limit: Option<usize>)
        -> ReportResult<Vec<UserRecord>>;
}

/// A store that can back every data type.
pub trait SparkRepository:
    BookingRepository + ProgramRepository + SchoolRepository + PermissionSlipRepository + UserRepository
{
}

impl<T> SparkRepository for T where
    T: BookingRepository
        + ProgramRepository
        + SchoolRepository
        + PermissionSlipRepository
        + UserRepository
{
}

/// Fetch request handed to an adapter.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub query: RecordQuery,
    pub today: NaiveDate,
    /// Upper bound on rows pulled from the store.
    pub limit: Option<usize>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn data_type(&self) -> DataType;

    /// Rows in the store's natural order with every allowlisted column.
    async fn fetch(&self, request: &FetchRequest) -> ReportResult<Table>;
}

/// Adapters keyed by data type.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<DataType, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.data_type(), source);
    }

    pub fn get(&self, data_type: DataType) -> ReportResult<Arc<dyn DataSource>> {
        self.sources.get(&data_type).cloned().ok_or_else(|| {
            ReportError::DataUnavailable(format!("no data source registered for {data_type}"))
        })
    }

    /// Register an adapter for every data type, all reading from `repo`.
    pub fn from_repository<R: SparkRepository + 'static>(repo: Arc<R>) -> Self {
        let bookings: Arc<dyn BookingRepository> = repo.clone();
        let slips: Arc<dyn PermissionSlipRepository> = repo.clone();

        let mut registry = Self::new();
        registry.register(Arc::new(BookingsSource::new(bookings.clone())));
        registry.register(Arc::new(FinancialSource::new(bookings.clone())));
        registry.register(Arc::new(ProgramsSource::new(repo.clone())));
        registry.register(Arc::new(SchoolsSource::new(repo.clone())));
        registry.register(Arc::new(PermissionSlipsSource::new(slips.clone())));
        registry.register(Arc::new(UsersSource::new(repo)));
        registry.register(Arc::new(AnalyticsSummarySource::new(bookings, slips)));
        registry
    }
}
