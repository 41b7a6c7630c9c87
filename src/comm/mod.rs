pub mod address;
pub mod connection;
pub mod entropy;
pub mod frame;
pub mod limiter;
pub mod secure;
pub mod send_queue;
pub mod stats;
