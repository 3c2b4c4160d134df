pub mod backend;
pub mod config;
pub mod database;
pub mod enrich;
pub mod error;
pub mod expenses;
pub mod limits;
pub mod notify;
