//! Check command handler
//!
//! Binds every function in a declarations file. Binding is all-or-nothing,
//! so the first library that fails to open or the first missing symbol
//! aborts the whole check with that error.

use super::load_declarations;
use crate::cli::CheckArgs;
use crate::config::Config;
use crate::error::Result;
use crate::logging::timing::Timer;
use crate::output::OutputWriter;
use cmarshal_core::{Binding, LoadFlags};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct LibraryReport {
    library: String,
    opened: String,
    flags: LoadFlags,
    functions: Vec<FunctionReport>,
}

#[derive(Debug, Serialize)]
struct FunctionReport {
    name: String,
    signature: String,
    address: String,
    worker: bool,
}

/// Handle the check command
pub fn handle_check(args: CheckArgs, config: &Config, output: &mut OutputWriter) -> Result<()> {
    let path = config.declarations_file(args.declarations)?;
    let declarations = load_declarations(&path)?;
    let search_dirs = config.search_dirs(&args.search_dirs);

    output.info(&format!("Binding declarations from {}", path.display()))?;

    let loaded = {
        let timer = Timer::with_details("bind_declarations", &path.display().to_string());
        let _guard = timer.span().enter();
        declarations.load(&search_dirs)?
    };

    let reports: Vec<LibraryReport> = loaded
        .tables
        .iter()
        .map(|(label, table)| LibraryReport {
            library: label.clone(),
            opened: table.library().name().to_string(),
            flags: table.library().flags(),
            functions: table
                .iter()
                .map(|(name, binding)| FunctionReport {
                    name: name.to_string(),
                    signature: binding.signature().to_string(),
                    address: match binding {
                        Binding::Sync(f) => format!("{:p}", f.address()),
                        Binding::Worker(_) => "-".to_string(),
                    },
                    worker: matches!(binding, Binding::Worker(_)),
                })
                .collect(),
        })
        .collect();

    if !output.is_human() {
        return output.data(&reports);
    }

    let mut bound = 0;
    for report in &reports {
        output.section(&format!("{} ({})", report.library, report.opened))?;
        let rows = report
            .functions
            .iter()
            .map(|f| {
                vec![
                    f.name.clone(),
                    f.signature.clone(),
                    if f.worker { "worker" } else { "sync" }.to_string(),
                ]
            })
            .collect();
        output.table(&["function", "signature", "mode"], rows)?;
        bound += report.functions.len();
    }

    output.success(&format!(
        "✓ Bound {} function(s) from {} librar{} and {} layout(s)",
        bound,
        reports.len(),
        if reports.len() == 1 { "y" } else { "ies" },
        loaded.registry.len()
    ))
}
