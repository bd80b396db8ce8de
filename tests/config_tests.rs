//! Configuration loading from TOML files.

use std::io::Write;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::NamedTempFile;

use saveable_sync::config::{BusyPolicy, ConfigError, QueueConfig, SyncConfig};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_queue_and_transfer_sections_from_file() {
    let file = write_config(
        r#"
        [sync.save_queue]
        max_chunk_size = 4
        pool_size = 2

        [sync.load_queue]
        max_chunk_size = 10

        [sync.transfer]
        busy_policy = "wait"
        "#,
    );

    let config = SyncConfig::from_file(file.path()).unwrap();

    assert_eq!(
        config.save_queue,
        QueueConfig::default().with_max_chunk_size(4).with_pool_size(2)
    );
    assert_eq!(config.load_queue, QueueConfig::default());
    assert_eq!(config.transfer.busy_policy, BusyPolicy::Wait);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = SyncConfig::from_file(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert!(reported.ends_with("absent.toml")),
        other => panic!("expected io error, got {other:?}"),
    }
}

#[rstest]
#[case("[sync.save_queue]\nmax_chunk_size = 0\n", "save_queue.max_chunk_size")]
#[case("[sync.save_queue]\nmax_chunk_size = 11\n", "save_queue.max_chunk_size")]
#[case("[sync.load_queue]\npool_size = 21\n", "load_queue.pool_size")]
#[case("[sync.load_queue]\npool_size = 0\n", "load_queue.pool_size")]
fn out_of_range_values_are_rejected(#[case] contents: &str, #[case] field: &str) {
    let file = write_config(contents);

    let err = SyncConfig::from_file(file.path()).unwrap_err();
    assert!(
        matches!(&err, ConfigError::OutOfRange { field: f, .. } if f == field),
        "unexpected error: {err}"
    );
}

#[rstest]
#[case("[sync\n")]
#[case("[sync.transfer]\nbusy_policy = \"sometimes\"\n")]
#[case("[sync.save_queue]\npool_size = -1\n")]
fn malformed_files_are_parse_errors(#[case] contents: &str) {
    let file = write_config(contents);
    assert!(matches!(
        SyncConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn empty_file_yields_defaults() {
    let file = write_config("");
    assert_eq!(SyncConfig::from_file(file.path()).unwrap(), SyncConfig::default());
}
