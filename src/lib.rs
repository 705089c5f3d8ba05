pub mod cli;
pub mod command;
pub mod config;
pub mod context;
pub mod logging;
pub mod supervisor;
