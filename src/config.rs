use serde::{Deserialize, Serialize};

/// Knobs for one compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Name recorded as the code's filename. Defaults to the first form's
    /// file. Which forms count as macro output is always decided by that file.
    pub filename: Option<String>,

    /// Fill the instruction-offset to line table.
    pub record_lines: bool,

    /// Remember regions whose forms come from a different file (macro output).
    pub track_macro_regions: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            filename: None,
            record_lines: true,
            track_macro_regions: true,
        }
    }
}

impl CompileOptions {
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}
