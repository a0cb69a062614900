//! Command implementations.

mod translate;

use crate::cli::{Cli, Commands};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Translate { .. } => handle_translate(cli),
    }
}

fn handle_translate(cli: &Cli) -> i32 {
    let Commands::Translate {
        image,
        base,
        entries,
        max_insns,
        helper_base,
        slot_base,
        output,
    } = &cli.command;

    let options = translate::TranslateArgs {
        image,
        base: *base,
        entries,
        max_instructions: *max_insns,
        helper_base: *helper_base,
        slot_base: *slot_base,
        output: output.as_deref(),
    };
    translate::cmd_translate(&options)
}
