pub mod detect;
pub mod detection;
pub mod job;
pub mod submission;
