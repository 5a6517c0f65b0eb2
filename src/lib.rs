pub mod auth;
pub mod catalog;
pub mod civil;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod sweep;
pub mod wal;
pub mod wire;
