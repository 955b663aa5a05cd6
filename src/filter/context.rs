use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

/// Lookups the validators need for `exists` and school/district checks.
pub trait ReferenceCatalog: Send + Sync {
    fn school_exists(&self, school_id: i64) -> bool;
    fn district_exists(&self, district_id: i64) -> bool;
    fn program_exists(&self, program_id: i64) -> bool;
    fn teacher_exists(&self, teacher_id: i64) -> bool;
    /// District the school belongs to, if the school is known and assigned.
    fn school_district(&self, school_id: i64) -> Option<i64>;
}

/// Snapshot catalog, loaded from the database or built by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    schools: HashMap<i64, Option<i64>>,
    districts: HashSet<i64>,
    programs: HashSet<i64>,
    teachers: HashSet<i64>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_district(mut self, district_id: i64) -> Self {
        self.districts.insert(district_id);
        self
    }

    pub fn with_school(mut self, school_id: i64, district_id: Option<i64>) -> Self {
        self.schools.insert(school_id, district_id);
        if let Some(district_id) = district_id {
            self.districts.insert(district_id);
        }
        self
    }

    pub fn with_program(mut self, program_id: i64) -> Self {
        self.programs.insert(program_id);
        self
    }

    pub fn with_teacher(mut self, teacher_id: i64) -> Self {
        self.teachers.insert(teacher_id);
        self
    }
}

impl ReferenceCatalog for StaticCatalog {
    fn school_exists(&self, school_id: i64) -> bool {
        self.schools.contains_key(&school_id)
    }

    fn district_exists(&self, district_id: i64) -> bool {
        self.districts.contains(&district_id)
    }

    fn program_exists(&self, program_id: i64) -> bool {
        self.programs.contains(&program_id)
    }

    fn teacher_exists(&self, teacher_id: i64) -> bool {
        self.teachers.contains(&teacher_id)
    }

    fn school_district(&self, school_id: i64) -> Option<i64> {
        self.schools.get(&school_id).copied().flatten()
    }
}

/// Explicit inputs for request validation: the clock, the app timezone and the catalog.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub now: DateTime<Utc>,
    pub timezone: Tz,
    pub catalog: &'a dyn ReferenceCatalog,
}

impl<'a> ValidationContext<'a> {
    pub fn new(now: DateTime<Utc>, timezone: Tz, catalog: &'a dyn ReferenceCatalog) -> Self {
        Self {
            now,
            timezone,
            catalog,
        }
    }

    /// Current calendar date in the application timezone.
    pub fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.timezone).date_naive()
    }
}
