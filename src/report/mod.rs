//! Human-readable output for the CLI

pub mod table_format;
