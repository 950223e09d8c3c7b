//! Low-level runtime implementations.
//!
//! Each runtime executes a finished bundle and reports the container's exit
//! code. Only runc-compatible command-line runtimes are supported.

pub mod cli;

pub use self::cli::CliRuntime;
