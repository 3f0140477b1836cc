//! Local file target writes

mod common;

use anyhow::Result;
use common::*;
use reef_import::config::{FileWriteMode, LocalFileFormat, LocalFileTargetConfig, TargetKind};
use reef_import::models::Value;
use reef_import::target::{ImportTarget, ImportWriteContext, LocalFileTarget};
use serde_json::json;
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn file_config(path: &Path, format: LocalFileFormat, mode: FileWriteMode) -> LocalFileTargetConfig {
    LocalFileTargetConfig {
        path: path.display().to_string(),
        format,
        mode,
        delimiter: None,
    }
}

fn context(config: &LocalFileTargetConfig) -> ImportWriteContext {
    let mut profile = csv_to_sqlite_profile(Path::new("unused.csv"), "sqlite::memory:", "unused");
    profile.target.kind = TargetKind::LocalFile;
    profile.target.connection_string = None;
    profile.target.connection_name = None;
    profile.target.file = Some(config.clone());
    ImportWriteContext::from_profile(&profile)
}

fn person(id: i64, name: &str) -> reef_import::Row {
    row(&[("id", Value::Integer(id)), ("name", Value::from(name))])
}

#[tokio::test]
async fn test_json_append_merges_existing_array() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "people.json", r#"[{"id": 0, "name": "existing"}]"#)?;
    let config = file_config(&path, LocalFileFormat::Auto, FileWriteMode::Append);
    let target = LocalFileTarget::new(config.clone());
    let cancel = CancellationToken::new();

    let result = target
        .write_batch(&context(&config), &target_rows(vec![person(1, "ada")]), &cancel)
        .await?;
    assert_eq!(result.inserted, 1);

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(
        written,
        json!([{"id": 0, "name": "existing"}, {"id": 1, "name": "ada"}])
    );
    assert!(!dir.path().join("people.json.tmp").exists());
    Ok(())
}

#[tokio::test]
async fn test_overwrite_truncates_only_on_first_write() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "people.jsonl", "{\"id\":99}\n")?;
    let config = file_config(&path, LocalFileFormat::Auto, FileWriteMode::Overwrite);
    let target = LocalFileTarget::new(config.clone());
    let ctx = context(&config);
    let cancel = CancellationToken::new();

    assert_eq!(target.format(), LocalFileFormat::JsonLines);
    target
        .write_batch(&ctx, &target_rows(vec![person(1, "ada")]), &cancel)
        .await?;
    target
        .write_batch(&ctx, &target_rows(vec![person(2, "grace")]), &cancel)
        .await?;

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)?
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(lines, vec![json!({"id": 1, "name": "ada"}), json!({"id": 2, "name": "grace"})]);
    Ok(())
}

#[tokio::test]
async fn test_csv_creates_file_with_header_union() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out").join("people.csv");
    let config = file_config(&path, LocalFileFormat::Csv, FileWriteMode::Append);
    let target = LocalFileTarget::new(config.clone());
    let cancel = CancellationToken::new();

    let rows = vec![
        person(1, "ada"),
        row(&[("id", Value::Integer(2)), ("email", Value::from("g@example.com"))]),
    ];
    target
        .write_batch(&context(&config), &target_rows(rows), &cancel)
        .await?;

    assert_eq!(
        std::fs::read_to_string(&path)?,
        "id,name,email\n1,ada,\n2,,g@example.com\n"
    );
    Ok(())
}

#[tokio::test]
async fn test_full_replace_and_unsupported_operations() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = write_file(dir.path(), "people.jsonl", "{\"id\":99}\n")?;
    let config = file_config(&path, LocalFileFormat::JsonLines, FileWriteMode::Append);
    let target = LocalFileTarget::new(config.clone());
    let ctx = context(&config);
    let cancel = CancellationToken::new();

    target
        .full_replace(&ctx, &target_rows(vec![person(1, "ada")]), &cancel)
        .await?;
    assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 1);

    assert_eq!(target.apply_deletes(&ctx, &["1".to_string()], "id").await?, 0);
    assert!(target.get_table_schema(&ctx).await?.is_empty());
    assert!(target.test(&ctx).await.ok);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_write_leaves_file_untouched() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("people.jsonl");
    let config = file_config(&path, LocalFileFormat::JsonLines, FileWriteMode::Append);
    let target = LocalFileTarget::new(config.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = target
        .write_batch(&context(&config), &target_rows(vec![person(1, "ada")]), &cancel)
        .await?;

    assert!(result.cancelled);
    assert!(!path.exists());
    Ok(())
}
