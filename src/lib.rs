// Library crate for integration tests.
// main.rs drives the same modules through this crate.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod log_capture;
pub mod network;
pub mod routes;
pub mod server;
pub mod settings;
pub mod speed_test;
pub mod state;
pub mod store;
