pub mod classes;
pub mod core;
pub mod marks;
pub mod reports;
pub mod setup;
pub mod students;
