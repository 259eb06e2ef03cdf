//! Output formatting and writing utilities
//!
//! Human output goes through [`OutputWriter`]'s message helpers and
//! tables; machine formats (JSON, YAML) receive one serialized document per
//! command via [`OutputWriter::data`].

use crate::cli::OutputFormat;
use crate::error::Result;
use cmarshal_core::Value;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use std::io::{self, Write};
use tracing::trace;

/// Trait for formatting serializable output
pub trait OutputFormatter {
    /// Format a serializable value
    fn format<T: Serialize>(&self, value: &T) -> Result<String>;
}

impl OutputFormatter for OutputFormat {
    fn format<T: Serialize>(&self, value: &T) -> Result<String> {
        match self {
            OutputFormat::Json => Ok(serde_json::to_string(value)?),
            OutputFormat::JsonPretty | OutputFormat::Human => {
                Ok(serde_json::to_string_pretty(value)?)
            }
            OutputFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        }
    }
}

/// Output writer that handles different output formats and colors
pub struct OutputWriter {
    format: OutputFormat,
    use_color: bool,
    quiet: bool,
    writer: Box<dyn Write>,
}

impl OutputWriter {
    /// Create a new output writer on stdout
    pub fn new(format: OutputFormat, use_color: bool, quiet: bool) -> Self {
        Self::with_writer(format, use_color, quiet, Box::new(io::stdout()))
    }

    /// Create an output writer with a custom writer
    pub fn with_writer(
        format: OutputFormat,
        use_color: bool,
        quiet: bool,
        writer: Box<dyn Write>,
    ) -> Self {
        Self {
            format,
            use_color,
            quiet,
            writer,
        }
    }

    /// Get the output format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// True when human-readable output is selected
    pub fn is_human(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Write raw output
    pub fn write(&mut self, content: &str) -> Result<()> {
        write!(self.writer, "{}", content)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write a line of output
    pub fn writeln(&mut self, content: &str) -> Result<()> {
        writeln!(self.writer, "{}", content)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write an info message
    pub fn info(&mut self, message: &str) -> Result<()> {
        if self.quiet || !self.is_human() {
            return Ok(());
        }

        if self.use_color {
            self.writeln(&format!("{} {}", "ℹ".blue(), message))
        } else {
            self.writeln(&format!("INFO: {}", message))
        }
    }

    /// Write a success message
    pub fn success(&mut self, message: &str) -> Result<()> {
        if self.quiet || !self.is_human() {
            return Ok(());
        }

        if self.use_color {
            self.writeln(&message.green().to_string())
        } else {
            self.writeln(message)
        }
    }

    /// Write a warning message
    pub fn warning(&mut self, message: &str) -> Result<()> {
        if !self.is_human() {
            return Ok(());
        }

        if self.use_color {
            self.writeln(&message.yellow().to_string())
        } else {
            self.writeln(&format!("WARNING: {}", message))
        }
    }

    /// Write an error message
    pub fn error(&mut self, message: &str) -> Result<()> {
        if !self.is_human() {
            return Ok(());
        }

        if self.use_color {
            self.writeln(&message.red().to_string())
        } else {
            self.writeln(&format!("ERROR: {}", message))
        }
    }

    /// Write a section header
    pub fn section(&mut self, title: &str) -> Result<()> {
        if self.quiet || !self.is_human() {
            return Ok(());
        }

        self.writeln("")?;
        if self.use_color {
            self.writeln(&format!("═══ {} ═══", title).bright_blue().to_string())
        } else {
            self.writeln(&format!("=== {} ===", title))
        }
    }

    /// Write data in a machine format. Human output is left to the caller.
    pub fn data<T: Serialize>(&mut self, value: &T) -> Result<()> {
        if self.is_human() {
            return Ok(());
        }

        let formatted = self.format.format(value)?;
        trace!(bytes = formatted.len(), "writing structured output");

        if formatted.ends_with('\n') {
            self.write(&formatted)
        } else {
            self.writeln(&formatted)
        }
    }

    /// Write a table (human format only)
    pub fn table(&mut self, headers: &[&str], rows: Vec<Vec<String>>) -> Result<()> {
        if self.quiet || !self.is_human() {
            return Ok(());
        }

        let mut widths = headers.iter().map(|h| h.chars().count()).collect::<Vec<_>>();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.chars().count());
                }
            }
        }

        let header_row = headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
            .collect::<Vec<_>>()
            .join(" │ ");
        let header_row = header_row.trim_end();

        if self.use_color {
            self.writeln(&header_row.bold().to_string())?;
        } else {
            self.writeln(header_row)?;
        }

        let separator = widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("─┼─");
        self.writeln(&separator)?;

        for row in rows {
            let row_str = row
                .iter()
                .enumerate()
                .map(|(i, cell)| match widths.get(i) {
                    Some(width) => format!("{:width$}", cell, width = *width),
                    None => cell.clone(),
                })
                .collect::<Vec<_>>()
                .join(" │ ");
            self.writeln(row_str.trim_end())?;
        }

        Ok(())
    }
}

/// JSON rendering of a host value. Records become objects in field order;
/// NULL strings and pointers become `null`.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Void => serde_json::Value::Null,
        Value::Int(i) => json!(i),
        Value::UInt(u) => json!(u),
        Value::Float(x) => json!(x),
        Value::Bool(b) => json!(b),
        Value::Str(s) => json!(s),
        Value::Pointer(0) => serde_json::Value::Null,
        Value::Pointer(p) => json!(format!("{:#x}", p)),
        Value::Record(record) => {
            let fields = record
                .iter()
                .map(|(name, value)| (name.to_string(), value_to_json(value)))
                .collect::<serde_json::Map<_, _>>();
            serde_json::Value::Object(fields)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cmarshal_core::{FieldSpec, LayoutRegistry, Record};
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory sink for inspecting writer output
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn writer(format: OutputFormat) -> (OutputWriter, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let writer = OutputWriter::with_writer(format, false, false, Box::new(buffer.clone()));
        (writer, buffer)
    }

    #[test]
    fn test_human_messages_are_suppressed_in_json() {
        let (mut out, buffer) = writer(OutputFormat::Json);
        out.info("binding").unwrap();
        out.success("done").unwrap();
        out.data(&json!({"ok": true})).unwrap();
        assert_eq!(buffer.contents(), "{\"ok\":true}\n");
    }

    #[test]
    fn test_table_alignment() {
        let (mut out, buffer) = writer(OutputFormat::Human);
        out.table(
            &["name", "kind"],
            vec![
                vec!["len".to_string(), "uint32".to_string()],
                vec!["ptr".to_string(), "string".to_string()],
            ],
        )
        .unwrap();
        let text = buffer.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name │ kind");
        assert_eq!(lines[2], "len  │ uint32");
        assert_eq!(lines[3], "ptr  │ string");
    }

    #[test]
    fn test_record_to_json_keeps_field_order() {
        let mut registry = LayoutRegistry::new();
        let layout = registry
            .define_layout(
                "MyCString",
                [FieldSpec::new("len", "uint32"), FieldSpec::new("ptr", "string")],
            )
            .unwrap();
        let record = Record::new(layout)
            .with("len", 7u32)
            .unwrap()
            .with("ptr", "Hello, world")
            .unwrap();

        let rendered = value_to_json(&Value::Record(record));
        assert_eq!(rendered.to_string(), r#"{"len":7,"ptr":"Hello, world"}"#);
        assert_eq!(value_to_json(&Value::null()), serde_json::Value::Null);
    }
}
