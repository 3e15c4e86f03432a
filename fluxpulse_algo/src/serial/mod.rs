pub mod command;
pub mod telemetry;

pub use command::CommandParser;
