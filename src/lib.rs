//! live-update library
//!
//! Pushes code changes into a running process without restarting it:
//! - Delta computation over compiled class stores
//! - Reinit classification for fields a new class version introduces
//! - Class swap, live edit, and live literal update requests
//! - Framed channel, host session, and companion server
//! - In-process agent endpoint and outcome interpretation

pub mod activator;
pub mod agent;
pub mod bytecode;
pub mod config;
pub mod delta;
pub mod outcome;
pub mod reinit;
pub mod request;
pub mod server;
pub mod session;
pub mod transport;
