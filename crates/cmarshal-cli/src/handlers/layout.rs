//! Layout command handler

use super::load_declarations;
use crate::cli::LayoutArgs;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::OutputWriter;
use cmarshal_core::LayoutDescriptor;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct LayoutReport {
    name: String,
    size: usize,
    align: usize,
    fields: Vec<FieldReport>,
}

#[derive(Debug, Serialize)]
struct FieldReport {
    name: String,
    kind: String,
    offset: usize,
    size: usize,
}

impl From<&LayoutDescriptor> for LayoutReport {
    fn from(layout: &LayoutDescriptor) -> Self {
        Self {
            name: layout.name().to_string(),
            size: layout.size(),
            align: layout.align(),
            fields: layout
                .fields()
                .iter()
                .map(|f| FieldReport {
                    name: f.name().to_string(),
                    kind: f.kind().describe(layout),
                    offset: f.offset(),
                    size: f.size(),
                })
                .collect(),
        }
    }
}

/// Handle the layout command
pub fn handle_layout(args: LayoutArgs, config: &Config, output: &mut OutputWriter) -> Result<()> {
    let path = config.declarations_file(args.declarations)?;
    let registry = load_declarations(&path)?.build_registry()?;

    for name in &args.names {
        if !registry.contains(name) {
            return Err(Error::invalid_args(format!(
                "{} declares no layout named '{}'",
                path.display(),
                name
            )));
        }
    }

    let reports: Vec<LayoutReport> = registry
        .iter()
        .filter(|l| args.names.is_empty() || args.names.iter().any(|n| n == l.name()))
        .map(|l| LayoutReport::from(l.as_ref()))
        .collect();

    if !output.is_human() {
        return output.data(&reports);
    }

    if reports.is_empty() {
        output.warning(&format!("{} declares no layouts", path.display()))?;
    }
    for report in &reports {
        output.section(&format!(
            "{} (size {}, align {})",
            report.name, report.size, report.align
        ))?;
        let rows = report
            .fields
            .iter()
            .map(|f| {
                vec![
                    f.offset.to_string(),
                    f.name.clone(),
                    f.kind.clone(),
                    f.size.to_string(),
                ]
            })
            .collect();
        output.table(&["offset", "field", "kind", "size"], rows)?;
    }
    Ok(())
}
