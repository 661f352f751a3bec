pub mod db;
pub mod error;
pub mod kv;
pub mod plans;
pub mod probe;
pub mod throttle;
pub mod transcriber;
