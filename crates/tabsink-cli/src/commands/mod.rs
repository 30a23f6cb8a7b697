//! CLI subcommands.

pub mod validate;
pub mod write;
