//! Store Persistence Integration Tests
//!
//! Crash-consistent reopen of a store directory: acknowledged mutations
//! survive a restart, a log truncated mid-entry recovers to the last
//! fully-written entry, posting-list files inconsistent with the record
//! log are rebuilt, and the version gate refuses foreign directories.

use std::fs;

use oai_jazz::store::{SelectQuery, StorageError};
use oai_jazz::{OaiError, OaiJazz, StoreConfig};

fn select_snapshot(jazz: &OaiJazz, prefix: &str) -> Vec<(String, u64, bool)> {
    let mut query = SelectQuery::new(prefix);
    query.batch_size = 1000;
    match jazz.oai_select(&query) {
        Ok(result) => result
            .records
            .iter()
            .map(|r| (r.identifier.clone(), r.stamp, r.is_deleted()))
            .collect(),
        Err(OaiError::NoRecordsMatch) => Vec::new(),
        Err(other) => panic!("unexpected select error: {}", other),
    }
}

#[test]
fn test_reopen_reproduces_select_results() {
    let dir = tempfile::tempdir().unwrap();

    let before = {
        let mut jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
        jazz.register_metadata_format("oai_dc", "http://example.org/dc.xsd", "urn:dc")
            .unwrap();
        jazz.register_set("top:sub", "A subset").unwrap();
        jazz.add_oai_record("rec:1", &["top:sub"], &["oai_dc"]).unwrap();
        jazz.add_oai_record("rec:2", &[], &["oai_dc", "rdf"]).unwrap();
        jazz.add_oai_record("rec:3", &["top"], &["oai_dc"]).unwrap();
        jazz.delete_oai_record("rec:2").unwrap();
        jazz.commit().unwrap();
        select_snapshot(&jazz, "oai_dc")
    };

    let jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    // INVARIANT: reopen restores identical select output, stamps included.
    assert_eq!(select_snapshot(&jazz, "oai_dc"), before);
    assert_eq!(select_snapshot(&jazz, "rdf").len(), 1);
    assert_eq!(jazz.all_prefixes(), vec!["oai_dc", "rdf"]);
    assert_eq!(jazz.set_name("top:sub"), Some("A subset"));
    assert_eq!(jazz.total_records(), 3);

    let record = jazz.get_record("rec:2").unwrap();
    assert!(record.is_deleted());
    assert_eq!(record.deleted_prefixes, vec!["oai_dc", "rdf"]);
}

#[test]
fn test_new_stamps_keep_increasing_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let first = {
        let mut jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
        jazz.add_oai_record("rec:1", &[], &["p"]).unwrap()
    };
    let mut jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(jazz.newest_stamp(), first);
    let second = jazz.add_oai_record("rec:2", &[], &["p"]).unwrap();
    assert!(second > first);
}

#[test]
fn test_truncated_record_log_recovers_prefix_of_history() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
        jazz.add_oai_record("rec:1", &["s"], &["p"]).unwrap();
        jazz.add_oai_record("rec:2", &["s"], &["p"]).unwrap();
        jazz.add_oai_record("rec:3", &["s"], &["p"]).unwrap();
        jazz.commit().unwrap();
    }

    // Chop bytes off the record log tail, as a crash mid-append would.
    let log = dir.path().join("records.log");
    let data = fs::read(&log).unwrap();
    fs::write(&log, &data[..data.len() - 5]).unwrap();

    let jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    // INVARIANT: recovery keeps every fully-written entry and drops the
    // torn one; list files are rebuilt to agree with the record log.
    assert_eq!(jazz.total_records(), 2);
    let survivors: Vec<(String, u64, bool)> = select_snapshot(&jazz, "p");
    assert_eq!(survivors.len(), 2);
    assert_eq!(survivors[0].0, "rec:1");
    assert_eq!(survivors[1].0, "rec:2");

    let mut query = SelectQuery::new("p");
    query.sets = vec!["s".to_string()];
    assert_eq!(jazz.oai_select(&query).unwrap().records.len(), 2);

    // Reopen is idempotent once rebuilt.
    drop(jazz);
    let jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(jazz.total_records(), 2);
}

#[test]
fn test_corrupt_list_file_is_rebuilt_from_record_log() {
    let dir = tempfile::tempdir().unwrap();
    let before = {
        let mut jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
        jazz.add_oai_record("rec:1", &[], &["p"]).unwrap();
        jazz.add_oai_record("rec:2", &[], &["p"]).unwrap();
        jazz.commit().unwrap();
        select_snapshot(&jazz, "p")
    };

    // Flip a payload byte in the prefix list; its replay now disagrees
    // with the record log.
    let list = dir.path().join("lists").join("p_70.lst");
    let mut data = fs::read(&list).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&list, &data).unwrap();

    let jazz = OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(select_snapshot(&jazz, "p"), before);
}

#[test]
fn test_version_gate_refuses_foreign_directories() {
    let dir = tempfile::tempdir().unwrap();
    OaiJazz::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("oai.version")).unwrap(), "1");

    fs::write(dir.path().join("oai.version"), "0").unwrap();
    match OaiJazz::open(dir.path(), StoreConfig::default()) {
        Err(OaiError::Storage(StorageError::VersionMismatch { found })) => {
            assert_eq!(found, "0");
        }
        other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
    }

    // A non-empty directory that is not a store at all is refused too.
    let stray = tempfile::tempdir().unwrap();
    fs::write(stray.path().join("stray.txt"), "data").unwrap();
    assert!(matches!(
        OaiJazz::open(stray.path(), StoreConfig::default()),
        Err(OaiError::Storage(StorageError::VersionMismatch { .. }))
    ));
}

#[test]
fn test_purge_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        persistent_delete: false,
        ..StoreConfig::default()
    };
    {
        let mut jazz = OaiJazz::open(dir.path(), config.clone()).unwrap();
        jazz.add_oai_record("rec:keep", &[], &["p"]).unwrap();
        jazz.add_oai_record("rec:gone", &["s"], &["p"]).unwrap();
        jazz.purge("rec:gone").unwrap();
        jazz.commit().unwrap();
    }
    let jazz = OaiJazz::open(dir.path(), config).unwrap();
    assert!(jazz.get_record("rec:gone").is_none());
    let snapshot = select_snapshot(&jazz, "p");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, "rec:keep");
}
