pub mod command;
pub mod emulator;
pub mod port;
pub mod tunnel;
