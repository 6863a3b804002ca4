pub mod auth;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod ratelimit;
pub mod sql;
pub mod tasks;
pub mod tls;
pub mod wal;
pub mod wire;
