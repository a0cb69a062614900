//! Translate command.

use std::fs;
use std::path::Path;

use a32t::{A32Emitter, CodeImage, CompileOptions, CompiledUnit, Compiler, HostHelpers, SlotTable};
use rayon::prelude::*;
use tracing::{error, info};

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS};

/// Spacing between consecutive runtime helpers.
const HELPER_STRIDE: u64 = 0x100;

pub struct TranslateArgs<'a> {
    pub image: &'a Path,
    pub base: u32,
    pub entries: &'a [u32],
    pub max_instructions: usize,
    pub helper_base: u64,
    pub slot_base: Option<u64>,
    pub output: Option<&'a Path>,
}

/// Handle the `translate` command.
pub fn cmd_translate(args: &TranslateArgs<'_>) -> i32 {
    info!(image = %args.image.display(), base = args.base, "translating");

    let bytes = match fs::read(args.image) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, image = %args.image.display(), "failed to read image");
            return EXIT_FAILURE;
        }
    };
    let image = CodeImage::new(args.base, &bytes);
    let entries: Vec<u32> = if args.entries.is_empty() {
        vec![args.base]
    } else {
        args.entries.to_vec()
    };

    let slots = args.slot_base.map(|base| {
        let mut table = SlotTable::new(base);
        for &entry in &entries {
            table.insert(entry);
        }
        table
    });

    let options = CompileOptions::new()
        .with_max_instructions(args.max_instructions)
        .with_helpers(HostHelpers::at_stride(args.helper_base, HELPER_STRIDE));
    let mut compiler = Compiler::new(options, A32Emitter::new());
    if let Some(table) = &slots {
        compiler = compiler.with_dispatch(table);
    }

    let results: Vec<(u32, a32t::Result<CompiledUnit>)> = entries
        .par_iter()
        .map(|&entry| (entry, compiler.translate(&image, entry)))
        .collect();

    let mut failed = 0usize;
    let mut units = Vec::with_capacity(results.len());
    for (entry, result) in results {
        match result {
            Ok(unit) => units.push(unit),
            Err(e) => {
                error!(error = %e, entry, "translation failed");
                a32t::metrics::record_failure(e.kind());
                failed += 1;
            }
        }
    }

    print_units(&units);

    if let Some(dir) = args.output {
        if let Err(e) = write_units(dir, &units) {
            error!(error = %e, output = %dir.display(), "failed to write units");
            return EXIT_FAILURE;
        }
        info!(output = %dir.display(), units = units.len(), "done");
    }

    if failed > 0 { EXIT_FAILURE } else { EXIT_SUCCESS }
}

fn print_units(units: &[CompiledUnit]) {
    println!(
        "{:<10} {:>8} {:>8} {:>7} {:>6} {:>6}",
        "entry", "guest", "host", "fixups", "exits", "trunc"
    );
    for unit in units {
        println!(
            "{:#010x} {:>8} {:>8} {:>7} {:>6} {:>6}",
            unit.start,
            unit.guest_bytes,
            unit.host_bytes(),
            unit.stats.resolve.fixups,
            unit.stats.exits,
            if unit.stats.truncated { "yes" } else { "no" }
        );
    }
}

/// One `<entry>.bin` per unit, code as little-endian words.
fn write_units(dir: &Path, units: &[CompiledUnit]) -> a32t::Result<()> {
    fs::create_dir_all(dir)?;
    for unit in units {
        fs::write(dir.join(format!("{:08x}.bin", unit.start)), unit.to_bytes())?;
    }
    Ok(())
}
