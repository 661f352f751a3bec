pub mod assets;
pub mod jobs;
pub mod merge;
pub mod quota;
pub mod uploads;
