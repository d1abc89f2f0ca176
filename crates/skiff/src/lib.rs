pub mod agent;
pub mod errors;
pub mod models;
pub mod process_store;
pub mod providers;
pub mod run_log;
pub mod tools;
