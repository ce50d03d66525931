pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod export;
pub mod labels;
pub mod limits;
pub mod message;
pub mod model;
pub mod notifier;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod timefmt;
pub mod wal;
pub mod wire;
