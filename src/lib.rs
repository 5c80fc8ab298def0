pub mod agents;
pub mod config;
pub mod errors;
pub mod hub;
pub mod logging;
pub mod preview;
pub mod project;
pub mod server;
