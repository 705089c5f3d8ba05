pub mod command_os;
pub mod error;
pub mod logging;
pub mod shutdown;
