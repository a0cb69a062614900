//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "a32t")]
#[command(about = "A32 to AArch64 dynamic binary translator")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary after execution
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate guest code regions into host code units
    Translate {
        /// Raw guest code image
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Guest address the image is loaded at
        #[arg(long, value_parser = parse_address, default_value = "0")]
        base: u32,

        /// Entry point to translate (repeatable; defaults to the base)
        #[arg(long = "entry", value_parser = parse_address)]
        entries: Vec<u32>,

        /// Instruction limit per unit
        #[arg(long, default_value = "1024")]
        max_insns: usize,

        /// Host address of the first runtime helper; helpers follow at 0x100 strides
        #[arg(long, value_parser = parse_host_address, default_value = "0")]
        helper_base: u64,

        /// Host address of the dispatch slot table
        #[arg(long, value_parser = parse_host_address)]
        slot_base: Option<u64>,

        /// Directory to write one `<entry>.bin` per unit into
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u64::from_str_radix(&digits.replace('_', ""), radix).map_err(|e| format!("invalid address '{s}': {e}"))
}

/// Parse a decimal or `0x`-prefixed guest address.
pub fn parse_address(s: &str) -> Result<u32, String> {
    let value = parse_u64(s)?;
    u32::try_from(value).map_err(|_| format!("address '{s}' does not fit in 32 bits"))
}

/// Parse a decimal or `0x`-prefixed host address.
pub fn parse_host_address(s: &str) -> Result<u64, String> {
    parse_u64(s)
}
