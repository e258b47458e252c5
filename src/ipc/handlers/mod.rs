pub mod backup_bundle;
pub mod core;
pub mod courses;
pub mod enrollments;
pub mod evaluations;
pub mod grades;
pub mod reports;
pub mod sections;
pub mod session;
pub mod users;
