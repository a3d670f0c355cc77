pub mod artifacts;
pub mod jobs;
pub mod tasks;
