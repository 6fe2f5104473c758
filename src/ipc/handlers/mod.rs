pub mod core;
pub mod questions;
pub mod results;
pub mod session;
pub mod students;
