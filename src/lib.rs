// Library crate for the binary and the integration tests.

pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod junit;
pub mod paramedic;
pub mod process;
pub mod reporter;
pub mod resolver;
pub mod routes;
pub mod runner;
pub mod server;
pub mod session;
pub mod toolchain;
