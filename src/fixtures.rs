//! Deterministic demo data for the in-memory repository.
//!
//! Every record is derived from its id, so two calls with the same anchor date
//! produce the same dataset. Used by the `demo` command and the scenario tests.

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::models::{BookingRecord, PermissionSlipRecord, ProgramRecord, SchoolRecord, UserRecord};
use crate::source::MemoryRepository;

pub const DISTRICTS: [(i64, &str); 2] = [(1, "Riverside Unified"), (2, "Lakeview County")];

const SCHOOLS: [(i64, &str, i64, &str, &str); 4] = [
    (10, "Oak Elementary", 1, "elementary", "Riverside"),
    (11, "Elm Middle", 1, "middle", "Riverside"),
    (12, "Pine High", 2, "high", "Lakeview"),
    (13, "Cedar Academy", 2, "charter", "Lakeview"),
];

const PROGRAMS: [(i64, &str, &[&str], f64); 3] = [
    (1, "Robotics Lab", &["4", "5", "6"], 12.5),
    (2, "Watershed Field Study", &["6", "7", "8"], 9.0),
    (3, "Planetarium Night", &["K", "1", "2", "3"], 7.25),
];

const TEACHERS: [(i64, &str, i64); 4] = [
    (100, "Avery Park", 10),
    (101, "Jules Moreno", 11),
    (102, "Kiara Patel", 12),
    (103, "Sam Ortiz", 13),
];

const BOOKING_CYCLE: [&str; 6] = [
    "confirmed",
    "completed",
    "pending",
    "confirmed",
    "cancelled",
    "completed",
];

const PAYMENT_CYCLE: [&str; 4] = ["paid", "pending", "paid", "overdue"];

fn at_ten(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(10, 0, 0).unwrap_or_default()
}

/// Reference records all exist from `since` on.
pub fn schools(since: NaiveDate) -> Vec<SchoolRecord> {
    SCHOOLS
        .iter()
        .map(|&(id, name, district_id, school_type, city)| SchoolRecord {
            id,
            name: name.to_string(),
            district_id: Some(district_id),
            district_name: district_name(district_id).to_string(),
            school_type: school_type.to_string(),
            city: city.to_string(),
            state: "OR".to_string(),
            student_count: 40 + (id as i32 % 7) * 9,
            is_active: true,
            created_at: at_ten(since),
        })
        .collect()
}

fn district_name(district_id: i64) -> &'static str {
    DISTRICTS
        .iter()
        .find(|(id, _)| *id == district_id)
        .map_or("", |(_, name)| name)
}

pub fn programs(since: NaiveDate) -> Vec<ProgramRecord> {
    PROGRAMS
        .iter()
        .map(|&(id, title, grades, price)| ProgramRecord {
            id,
            title: title.to_string(),
            description: format!("{title} for visiting classes."),
            grade_levels: grades.iter().map(|grade| grade.to_string()).collect(),
            duration_minutes: 60 + id as i32 * 30,
            max_students: 30 + id as i32 * 5,
            price_per_student: price,
            is_active: id != 3,
            created_at: at_ten(since),
        })
        .collect()
}

pub fn users(since: NaiveDate) -> Vec<UserRecord> {
    let mut users: Vec<UserRecord> = TEACHERS
        .iter()
        .map(|&(id, name, school_id)| UserRecord {
            id,
            name: name.to_string(),
            email: format!("{}@spark.test", name.to_lowercase().replace(' ', ".")),
            role: "teacher".to_string(),
            school_id: Some(school_id),
            school_name: SCHOOLS
                .iter()
                .find(|school| school.0 == school_id)
                .map(|school| school.1.to_string()),
            is_active: true,
            created_at: at_ten(since),
        })
        .collect();
    users.push(UserRecord {
        id: 1,
        name: "Morgan Reyes".to_string(),
        email: "admin@spark.test".to_string(),
        role: "admin".to_string(),
        school_id: None,
        school_name: None,
        is_active: true,
        created_at: at_ten(since),
    });
    users
}

/// `count` bookings spread one per day, backwards from `last_day`.
pub fn bookings(last_day: NaiveDate, count: usize) -> Vec<BookingRecord> {
    (1..=count as i64)
        .map(|id| {
            let school = SCHOOLS[(id as usize) % SCHOOLS.len()];
            let program = PROGRAMS[(id as usize) % PROGRAMS.len()];
            let teacher = TEACHERS
                .iter()
                .find(|teacher| teacher.2 == school.0)
                .copied();
            let students = 12 + (id * 7 % 29) as i32;
            let created = last_day - Duration::days(count as i64 - id);
            let status = BOOKING_CYCLE[(id as usize) % BOOKING_CYCLE.len()];
            BookingRecord {
                id,
                booking_reference: format!("BK-{id:05}"),
                school_id: school.0,
                school_name: school.1.to_string(),
                district_id: Some(school.2),
                program_id: program.0,
                program_title: program.1.to_string(),
                teacher_id: teacher.map(|teacher| teacher.0),
                teacher_name: teacher.map_or_else(String::new, |teacher| teacher.1.to_string()),
                status: status.to_string(),
                payment_status: PAYMENT_CYCLE[(id as usize) % PAYMENT_CYCLE.len()].to_string(),
                student_count: students,
                total_cost: f64::from(students) * program.3,
                grade_levels: vec![program.2[(id as usize) % program.2.len()].to_string()],
                confirmed_date: (status != "pending").then_some(created + Duration::days(2)),
                payment_due_date: Some(created + Duration::days(30)),
                created_at: at_ten(created),
                deleted: id % 37 == 0,
            }
        })
        .collect()
}

/// Three slips per booking; every third one is still unsigned.
pub fn permission_slips(bookings: &[BookingRecord]) -> Vec<PermissionSlipRecord> {
    let mut slips = Vec::with_capacity(bookings.len() * 3);
    for booking in bookings {
        for seat in 0..3i64 {
            let id = booking.id * 10 + seat;
            let is_signed = id % 3 != 0;
            slips.push(PermissionSlipRecord {
                id,
                booking_id: booking.id,
                booking_reference: booking.booking_reference.clone(),
                school_id: booking.school_id,
                district_id: booking.district_id,
                program_id: booking.program_id,
                student_name: format!("Student {id}"),
                parent_name: format!("Parent {id}"),
                parent_email: format!("parent{id}@families.test"),
                is_signed,
                signed_at: is_signed.then(|| booking.created_at + Duration::days(1)),
                reminder_sent_count: if is_signed { 0 } else { (id % 4) as i32 },
                created_at: booking.created_at,
            });
        }
    }
    slips
}

/// A repository holding every fixture, with `booking_count` bookings ending at `last_day`.
pub fn demo_repository(last_day: NaiveDate, booking_count: usize) -> MemoryRepository {
    let since = last_day - Duration::days(booking_count.max(1) as i64);
    let repo = MemoryRepository::new();
    schools(since).into_iter().for_each(|school| repo.insert_school(school));
    programs(since).into_iter().for_each(|program| repo.insert_program(program));
    users(since).into_iter().for_each(|user| repo.insert_user(user));
    let bookings = bookings(last_day, booking_count);
    permission_slips(&bookings)
        .into_iter()
        .for_each(|slip| repo.insert_slip(slip));
    bookings.into_iter().for_each(|booking| repo.insert_booking(booking));
    repo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ReferenceCatalog;

    #[test]
    fn bookings_are_deterministic_and_end_on_the_anchor() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let first = bookings(day, 40);
        assert_eq!(first, bookings(day, 40));
        assert_eq!(first.last().unwrap().created_at.date(), day);
        assert_eq!(
            first.first().unwrap().created_at.date(),
            day - Duration::days(39)
        );
    }

    #[test]
    fn catalog_covers_the_reference_data() {
        let repo = demo_repository(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 10);
        let catalog = repo.catalog();
        assert!(catalog.school_exists(12));
        assert_eq!(catalog.school_district(12), Some(2));
        assert!(catalog.program_exists(3));
        assert!(catalog.teacher_exists(101));
        assert!(!catalog.teacher_exists(1));
    }
}
