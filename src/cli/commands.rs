//! Command implementations for the Tessera CLI.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use serde_json::Value;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::{IndexConfig, OpenMode};
use crate::document::{Document, Term};
use crate::error::{Result, TesseraError};
use crate::index::Index;

/// Execute a CLI command.
pub fn execute_command(args: TesseraArgs) -> Result<()> {
    let config = load_config(&args)?;
    match &args.command {
        Command::Info(info_args) => show_info(info_args, config, &args),
        Command::Commits(commits_args) => list_commits(commits_args, config, &args),
        Command::Check(check_args) => check_index(check_args, config, &args),
        Command::Add(add_args) => add_documents(add_args, config, &args),
        Command::Delete(delete_args) => delete_documents(delete_args, config, &args),
        Command::Optimize(optimize_args) => optimize_index(optimize_args, config, &args),
        Command::Gc(gc_args) => collect_garbage(gc_args, config, &args),
        Command::Unlock(unlock_args) => unlock_index(unlock_args, config, &args),
    }
}

fn load_config(args: &TesseraArgs) -> Result<IndexConfig> {
    match &args.config {
        Some(path) => {
            debug!("Loading configuration from: {}", path.display());
            IndexConfig::from_json_file(path)
        }
        None => Ok(IndexConfig::default()),
    }
}

/// Open an existing index directory without creating it.
fn open_index(path: &Path, config: IndexConfig) -> Result<Index> {
    Index::open_existing_dir(path, config)
}

/// Show the latest commit of an index.
fn show_info(args: &IndexPathArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;
    let commit = index.latest_commit()?;

    let info = IndexInfo {
        path: args.index_path.display().to_string(),
        locked: index.is_locked()?,
        stats: index.stats()?,
        segments: commit.segments.iter().map(SegmentSummary::from).collect(),
        files: commit.files(true),
    };
    output_result("Index information", &info, cli_args)
}

/// List every readable commit.
fn list_commits(args: &IndexPathArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;
    let commits = index.commits()?;
    if commits.is_empty() {
        return Err(TesseraError::index_not_found(args.index_path.display().to_string()));
    }

    let summaries: Vec<CommitSummary> = commits.iter().map(CommitSummary::from).collect();
    output_result(&format!("{} commits", summaries.len()), &summaries, cli_args)
}

/// Verify the latest commit and its files.
fn check_index(args: &IndexPathArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;
    let report = index.check()?;
    output_result("Index check", &report, cli_args)?;

    if report.is_ok() {
        Ok(())
    } else {
        Err(TesseraError::corrupt(format!(
            "{} missing files, {} damaged segments",
            report.missing_files.len(),
            report.segments.iter().filter(|s| s.error.is_some()).count()
        )))
    }
}

/// Parse one JSON Lines record into a document.
///
/// String values are tokenized on whitespace; arrays are taken as terms.
fn parse_document(line: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(fields) = value else {
        return Err(TesseraError::invalid_argument("document must be a JSON object"));
    };

    let mut document = Document::new();
    for (name, value) in fields {
        match value {
            Value::String(text) => document.add_text(name, &text),
            Value::Array(items) => {
                let terms = items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(TesseraError::invalid_argument(format!(
                            "field '{name}': expected string term, got {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                document.add_terms(name, terms);
            }
            other => {
                return Err(TesseraError::invalid_argument(format!(
                    "field '{name}': expected string or array, got {other}"
                )));
            }
        }
    }
    Ok(document)
}

/// Add documents from a JSON Lines file.
fn add_documents(args: &AddArgs, mut config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let start = Instant::now();
    if let Some(batch_size) = args.batch_size {
        config.max_buffered_docs = batch_size;
    }
    if args.create {
        config.open_mode = OpenMode::Create;
    }

    let index = Index::open_dir(&args.index_path, config)?;
    let mut writer = index.writer()?;

    let reader = BufReader::new(File::open(&args.document_file)?);
    let mut added = 0;
    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let document = parse_document(&line).map_err(|e| {
            TesseraError::invalid_argument(format!(
                "{}:{}: {e}",
                args.document_file.display(),
                line_number + 1
            ))
        });
        match document {
            Ok(document) => writer.add_document(document)?,
            Err(e) => {
                writer.rollback()?;
                return Err(e);
            }
        }
        added += 1;
    }
    writer.close()?;
    info!("added {added} documents to {}", args.index_path.display());

    let result = DocumentAdditionResult {
        documents_added: added,
        generation: writer.generation(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    output_result("Documents added", &result, cli_args)
}

/// Delete every document containing a term.
fn delete_documents(args: &DeleteArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;
    let term = Term::new(args.field.as_str(), args.term.as_str());

    let mut reader = index.reader()?;
    let deleted = reader.delete_documents(&term)?;
    reader.close()?;

    let result = DeletionResult {
        term: term.to_string(),
        documents_deleted: deleted,
        generation: index.latest_commit()?.generation,
    };
    output_result("Documents deleted", &result, cli_args)
}

/// Merge all segments into one.
fn optimize_index(args: &IndexPathArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let start = Instant::now();
    let index = open_index(&args.index_path, config)?;

    let mut writer = index.writer_with_mode(OpenMode::Append)?;
    let segments_before = writer.segments().len();
    writer.optimize()?;
    writer.close()?;

    let result = OptimizationResult {
        segments_before,
        segments_after: writer.committed().segments.len(),
        generation: writer.generation(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    output_result("Index optimized", &result, cli_args)
}

/// Remove unreferenced index files.
fn collect_garbage(args: &GcArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;

    let result = if args.dry_run {
        GarbageCollectionResult {
            dry_run: true,
            removed: index.unreferenced_files()?,
            failed: Vec::new(),
        }
    } else {
        let report = index.collect_garbage()?;
        GarbageCollectionResult {
            dry_run: false,
            removed: report.deleted,
            failed: report.failed,
        }
    };
    output_result("Garbage collection", &result, cli_args)
}

/// Remove a leftover write lock.
fn unlock_index(args: &UnlockArgs, config: IndexConfig, cli_args: &TesseraArgs) -> Result<()> {
    let index = open_index(&args.index_path, config)?;
    let was_locked = index.is_locked()?;

    if was_locked && !args.force {
        return Err(TesseraError::invalid_argument(format!(
            "{} is locked; pass --force only if no writer is running",
            args.index_path.display()
        )));
    }
    if was_locked {
        index.unlock()?;
    }

    let result = UnlockResult {
        path: args.index_path.display().to_string(),
        was_locked,
        unlocked: was_locked,
    };
    output_result("Write lock", &result, cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let doc = parse_document(r#"{"id": ["7"], "body": "quick brown fox"}"#).unwrap();
        assert_eq!(doc.field("id").unwrap().terms, vec!["7"]);
        assert_eq!(doc.field("body").unwrap().terms, vec!["quick", "brown", "fox"]);
    }

    #[test]
    fn test_parse_document_rejects_bad_values() {
        assert!(parse_document("[1, 2]").is_err());
        assert!(parse_document(r#"{"id": 7}"#).is_err());
        assert!(parse_document(r#"{"id": [7]}"#).is_err());
        assert!(matches!(parse_document("{"), Err(TesseraError::Json(_))));
    }

    #[test]
    fn test_add_delete_and_gc() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("idx");
        let docs_path = dir.path().join("docs.jsonl");
        std::fs::write(
            &docs_path,
            "{\"id\": [\"1\"], \"body\": \"a b\"}\n\n{\"id\": [\"2\"], \"body\": \"b c\"}\n",
        )
        .unwrap();

        let cli = |argv: &[&str]| {
            use clap::Parser;
            let mut full = vec!["tessera", "--quiet", "--format", "json"];
            full.extend_from_slice(argv);
            TesseraArgs::try_parse_from(full).unwrap()
        };
        let index_arg = index_path.to_str().unwrap();
        let docs_arg = docs_path.to_str().unwrap();

        execute_command(cli(&["add", index_arg, docs_arg])).unwrap();
        execute_command(cli(&["delete", index_arg, "id", "1"])).unwrap();
        execute_command(cli(&["optimize", index_arg])).unwrap();
        execute_command(cli(&["gc", index_arg])).unwrap();
        execute_command(cli(&["check", index_arg])).unwrap();

        let index = Index::open_dir(&index_path, IndexConfig::default()).unwrap();
        let stats = index.stats().unwrap();
        assert_eq!(stats.doc_count, 1);
        assert_eq!(stats.deleted_count, 0);
        assert_eq!(stats.segment_count, 1);
    }

    #[test]
    fn test_read_commands_do_not_create_directory() {
        use clap::Parser;
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let path = missing.to_str().unwrap();

        for command in ["info", "commits", "check", "gc", "unlock"] {
            let args = TesseraArgs::try_parse_from(["tessera", "-q", command, path]).unwrap();
            assert!(
                matches!(execute_command(args), Err(TesseraError::IndexNotFound(_))),
                "{command}"
            );
            assert!(!missing.exists(), "{command}");
        }
    }

    #[test]
    fn test_unlock_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open_dir(dir.path(), IndexConfig::default()).unwrap();
        let writer = index.writer().unwrap();
        std::mem::forget(writer);

        use clap::Parser;
        let path = dir.path().to_str().unwrap();
        let args = TesseraArgs::try_parse_from(["tessera", "-q", "unlock", path]).unwrap();
        assert!(matches!(
            execute_command(args),
            Err(TesseraError::InvalidArgument(_))
        ));

        let args =
            TesseraArgs::try_parse_from(["tessera", "-q", "unlock", path, "--force"]).unwrap();
        execute_command(args).unwrap();
        assert!(!index.is_locked().unwrap());
    }
}
