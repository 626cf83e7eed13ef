//! passtor node library
//!
//! A passtor node stores signed account records in a Kademlia DHT and serves
//! push/pull requests from clients over TCP.

pub mod config;
pub mod network;
pub mod server;

pub use config::Config;
pub use server::Passtor;
