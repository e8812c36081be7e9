//! Display and persistence hints returned by `Device::getformat`.
//!
//! Readings are written by an external file writer as tab-separated text with
//! `#`-prefixed header lines holding the instrument's configuration snapshot.
//! Binary devices instead name a fixed file extension.

use super::options::OptionValues;
use super::Device;
use crate::error::AppResult;
use crate::value::Value;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Produces configuration header lines (without the `#`).
pub type HeaderFn = Arc<dyn Fn(&Device, &OptionValues) -> AppResult<Vec<String>> + Send + Sync>;

/// Fixed extension of binary output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinFormat {
    extension: String,
}

impl BinFormat {
    /// Extension such as `.npy` or `.bin`; `"."` keeps the caller's.
    pub fn new(extension: impl Into<String>) -> Self {
        let mut extension = extension.into();
        if !extension.starts_with('.') {
            extension.insert(0, '.');
        }
        Self { extension }
    }

    /// Extension including the dot.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// `path` with its extension replaced.
    pub fn target_path(&self, path: &Path) -> PathBuf {
        if self.extension == "." {
            path.to_path_buf()
        } else {
            path.with_extension(self.extension.trim_start_matches('.'))
        }
    }
}

/// Static format description declared on the device.
#[derive(Clone, Default)]
pub(crate) struct FormatSpec {
    pub(crate) multi: Option<Vec<String>>,
    pub(crate) graph: Option<Vec<usize>>,
    pub(crate) bin: Option<BinFormat>,
    pub(crate) header: Option<HeaderFn>,
}

/// Format hints for one reading.
#[derive(Clone)]
pub struct DeviceFormat {
    /// Column names when one reading spans several columns.
    pub multi: Option<Vec<String>>,
    /// Columns to plot.
    pub graph: Option<Vec<usize>>,
    /// Binary output, if not text.
    pub bin: Option<BinFormat>,
    /// Options the reading is taken with.
    pub options: OptionValues,
    /// Header callback.
    pub header: Option<HeaderFn>,
}

impl fmt::Debug for DeviceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFormat")
            .field("multi", &self.multi)
            .field("graph", &self.graph)
            .field("bin", &self.bin)
            .field("options", &self.options)
            .field("header", &self.header.is_some())
            .finish()
    }
}

impl DeviceFormat {
    /// Whether the reading is written as a binary file.
    pub fn is_binary(&self) -> bool {
        self.bin.is_some()
    }

    /// Header lines for `device`, without the `#`.
    pub fn header_lines(&self, device: &Device) -> AppResult<Vec<String>> {
        match &self.header {
            Some(header) => header(device, &self.options),
            None => Ok(Vec::new()),
        }
    }

    /// Write the `#` header block: configuration lines, then column names.
    pub fn write_header<W: Write>(&self, device: &Device, out: &mut W) -> AppResult<()> {
        for line in self.header_lines(device)? {
            writeln!(out, "#{line}")?;
        }
        let columns = self
            .multi
            .clone()
            .unwrap_or_else(|| vec![device.name().to_string()]);
        writeln!(out, "#{}", columns.join("\t"))?;
        Ok(())
    }
}

/// Write one tab-separated row; lists and records expand to several columns.
pub fn write_row<W: Write>(out: &mut W, values: &[Value]) -> AppResult<()> {
    let mut cells = Vec::new();
    for value in values {
        match value {
            Value::List(items) => cells.extend(items.iter().map(Value::to_string)),
            Value::Record(fields) => cells.extend(fields.values().map(Value::to_string)),
            other => cells.push(other.to_string()),
        }
    }
    writeln!(out, "{}", cells.join("\t"))?;
    Ok(())
}
