pub mod accounts;
pub mod cli;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod stomp;
pub mod testutil;
pub mod tracker;
pub mod transport;
