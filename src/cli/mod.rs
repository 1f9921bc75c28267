//! Command-line interface

pub mod commands;

pub use commands::{cmd_bits, cmd_eras, cmd_generate, cmd_info, cmd_mine, AppState, CliResult};
