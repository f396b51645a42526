//! Command handlers behind the CLI subcommands.
//!
//! Each handler returns the process exit code for its command; errors bubble
//! up to `main` as `anyhow::Error` with context attached.

pub mod migration_handlers;
pub mod status_handlers;

/// `run` reached `complete`, or a command finished normally.
pub const EXIT_OK: u8 = 0;
/// Unrecoverable error.
pub const EXIT_ERROR: u8 = 1;
/// `run` stopped with buckets left unfinished; rerun to continue.
pub const EXIT_PAUSED: u8 = 2;
/// Interrupted by Ctrl-C; state is saved at the last checkpoint.
pub const EXIT_INTERRUPTED: u8 = 130;
