// Larvae Monitoring Stream Server - core library
//
// Ingests sensor readings from the message broker, persists them, and fans
// them out in real time to connected SSE consumers through a bounded,
// self-cleaning client registry.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
