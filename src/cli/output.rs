//! Output formatting for CLI commands.

use serde::Serialize;

use crate::cli::args::{OutputFormat, TesseraArgs};
use crate::error::Result;
use crate::index::commit::CommitDescriptor;
use crate::index::segment::SegmentDescriptor;
use crate::index::IndexStats;

/// One segment as shown by `info`.
#[derive(Debug, Serialize)]
pub struct SegmentSummary {
    pub name: String,
    pub doc_count: u32,
    pub del_count: u32,
    pub del_generation: Option<u64>,
    pub norm_generations: usize,
    pub compound: bool,
}

impl From<&SegmentDescriptor> for SegmentSummary {
    fn from(segment: &SegmentDescriptor) -> Self {
        SegmentSummary {
            name: segment.name.clone(),
            doc_count: segment.doc_count,
            del_count: segment.del_count,
            del_generation: segment.del_generation,
            norm_generations: segment.norm_generations.len(),
            compound: segment.is_compound,
        }
    }
}

/// Result structure for `info`.
#[derive(Debug, Serialize)]
pub struct IndexInfo {
    pub path: String,
    pub locked: bool,
    pub stats: IndexStats,
    pub segments: Vec<SegmentSummary>,
    pub files: Vec<String>,
}

/// One commit as listed by `commits`.
#[derive(Debug, Serialize)]
pub struct CommitSummary {
    pub generation: u64,
    pub version: u64,
    pub segments: usize,
    pub documents: u64,
    pub timestamp: Option<String>,
}

impl From<&CommitDescriptor> for CommitSummary {
    fn from(commit: &CommitDescriptor) -> Self {
        CommitSummary {
            generation: commit.generation,
            version: commit.version,
            segments: commit.segments.len(),
            documents: commit.num_docs(),
            timestamp: commit.timestamp().map(|t| t.to_rfc3339()),
        }
    }
}

/// Result structure for document addition.
#[derive(Debug, Serialize)]
pub struct DocumentAdditionResult {
    pub documents_added: usize,
    pub generation: u64,
    pub duration_ms: u64,
}

/// Result structure for `delete`.
#[derive(Debug, Serialize)]
pub struct DeletionResult {
    pub term: String,
    pub documents_deleted: u32,
    pub generation: u64,
}

/// Result structure for index optimization.
#[derive(Debug, Serialize)]
pub struct OptimizationResult {
    pub segments_before: usize,
    pub segments_after: usize,
    pub generation: u64,
    pub duration_ms: u64,
}

/// Result structure for `gc`.
#[derive(Debug, Serialize)]
pub struct GarbageCollectionResult {
    pub dry_run: bool,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Result structure for `unlock`.
#[derive(Debug, Serialize)]
pub struct UnlockResult {
    pub path: String,
    pub was_locked: bool,
    pub unlocked: bool,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    for line in human_lines(&value, 0) {
        println!("{line}");
    }
    Ok(())
}

/// Render a JSON value as indented `key: value` lines.
fn human_lines(value: &serde_json::Value, indent: usize) -> Vec<String> {
    let spaces = "  ".repeat(indent);
    let mut lines = Vec::new();

    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    serde_json::Value::Object(_) => {
                        lines.push(format!("{spaces}{key}:"));
                        lines.extend(human_lines(val, indent + 1));
                    }
                    serde_json::Value::Array(arr) if arr.iter().any(|v| v.is_object()) => {
                        lines.push(format!("{spaces}{key}:"));
                        for item in arr {
                            lines.push(format!("{spaces}  -"));
                            lines.extend(human_lines(item, indent + 2));
                        }
                    }
                    _ if key.ends_with("size") => {
                        let formatted = val.as_u64().map_or_else(|| format_value(val), format_bytes);
                        lines.push(format!("{spaces}{key}: {formatted}"));
                    }
                    _ => lines.push(format!("{spaces}{key}: {}", format_value(val))),
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr {
                lines.push(format!("{spaces}-"));
                lines.extend(human_lines(item, indent + 1));
            }
        }
        _ => lines.push(format!("{spaces}{}", format_value(value))),
    }
    lines
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &TesseraArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "-".to_string(),
    }
}

/// Format bytes into human-readable format.
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!("test")), "test");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!(["a", "b"])), "[a, b]");
        assert_eq!(format_value(&serde_json::Value::Null), "-");
    }

    #[test]
    fn test_human_lines_nest_objects() {
        let value = json!({
            "generation": 3,
            "stats": { "total_size": 2048 },
            "segments": [{ "name": "_0" }],
            "files": ["_0.seg", "segments_3"]
        });
        let lines = human_lines(&value, 0);
        assert!(lines.contains(&"generation: 3".to_string()));
        assert!(lines.contains(&"  total_size: 2.0 KB".to_string()));
        assert!(lines.contains(&"    name: _0".to_string()));
        assert!(lines.contains(&"files: [_0.seg, segments_3]".to_string()));
    }
}
