pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod sweeper;
pub mod tenant;
pub mod wal;
