pub mod blocklist;
pub mod cache;
pub mod clock;
pub mod config;
pub mod delay;
pub mod forwarder;
pub mod handler;
pub mod health;
pub mod observer;
pub mod packet;
pub mod pool;
