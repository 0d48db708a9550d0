pub mod cli;
pub mod config;
pub mod logging;
pub mod order;
pub mod predictions;
pub mod service;
pub mod testing;
