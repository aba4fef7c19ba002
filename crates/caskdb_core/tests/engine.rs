//! End-to-end engine behaviour against a real directory.

use caskdb_core::codec::HEADER_SIZE;
use caskdb_core::dir::{self, LOCK_FILE};
use caskdb_core::segment::DataScanner;
use caskdb_core::{Config, CoreError, Engine, SegmentId, Timestamp};
use caskdb_storage::FileBackend;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn small_segments() -> Config {
    Config::default().max_file_size(256)
}

/// Every non-tombstone record on disk for `key`.
fn live_records_on_disk(dir: &Path, key: &[u8]) -> usize {
    let listing = dir::list_segments(dir).unwrap();
    let mut found = 0;
    for id in listing.data_ids {
        let backend = FileBackend::open_read_only(&dir::data_path(dir, id)).unwrap();
        for scanned in DataScanner::new(&backend, id).unwrap() {
            let scanned = scanned.unwrap();
            if scanned.entry.key == key && !scanned.entry.tombstone {
                found += 1;
            }
        }
    }
    found
}

#[test]
fn put_put_delete_then_merge() {
    let temp = tempdir().unwrap();
    {
        let engine = Engine::open(temp.path()).unwrap();
        assert!(engine.put_with_timestamp(b"a", b"1", Timestamp::new(100)).unwrap());
        assert!(engine.put_with_timestamp(b"b", b"2", Timestamp::new(101)).unwrap());
        assert!(engine.delete_with_timestamp(b"a", Timestamp::new(102)).unwrap());

        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
        engine.close().unwrap();
    }

    // Reopening seals the previous active segment so the merge can take it.
    let engine = Engine::open(temp.path()).unwrap();
    let result = engine.merge().unwrap();
    assert_eq!(result.segments_merged, 1);
    assert_eq!(result.records_scanned, 3);
    assert_eq!(result.records_kept, 1);
    assert_eq!(result.records_dropped, 2);

    assert_eq!(engine.get(b"a").unwrap(), None);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(live_records_on_disk(temp.path(), b"a"), 0);
    assert_eq!(live_records_on_disk(temp.path(), b"b"), 1);
    engine.close().unwrap();

    let engine = Engine::open(temp.path()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), None);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.keys().unwrap(), vec![b"b".to_vec()]);
}

#[test]
fn rotation_keeps_every_entry_reachable() {
    let temp = tempdir().unwrap();
    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();

    for i in 0..100u32 {
        engine
            .put(format!("key-{i:03}").as_bytes(), format!("value-{i}").as_bytes())
            .unwrap();
    }

    let ids = engine.segment_ids().unwrap();
    assert!(ids.len() >= 2, "expected rotation, got {ids:?}");
    assert!(engine.stats().rotations >= 1);
    for i in 0..100u32 {
        assert_eq!(
            engine.get(format!("key-{i:03}").as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes())
        );
    }

    // Every data file stays within one entry of the threshold.
    for id in &ids {
        let len = fs::metadata(dir::data_path(temp.path(), *id)).unwrap().len();
        assert!(len <= 256 + (HEADER_SIZE + 32) as u64);
    }
}

#[test]
fn reopen_preserves_data() {
    let temp = tempdir().unwrap();
    {
        let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
        for i in 0..40u32 {
            engine.put(format!("k{i}").as_bytes(), &i.to_le_bytes()).unwrap();
        }
        engine.delete(b"k7").unwrap();
        engine.put(b"k8", b"overwritten").unwrap();
        engine.close().unwrap();
    }
    assert!(!temp.path().join(LOCK_FILE).exists());

    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    assert_eq!(engine.len().unwrap(), 39);
    assert_eq!(engine.get(b"k7").unwrap(), None);
    assert_eq!(engine.get(b"k8").unwrap(), Some(b"overwritten".to_vec()));
    assert_eq!(engine.get(b"k39").unwrap(), Some(39u32.to_le_bytes().to_vec()));
    assert_eq!(engine.recovery_report().from_data, 0);

    // New writes after reopen are newer than anything recovered.
    engine.put(b"k8", b"again").unwrap();
    assert_eq!(engine.get(b"k8").unwrap(), Some(b"again".to_vec()));
}

#[test]
fn corrupt_value_fails_only_its_key() {
    let temp = tempdir().unwrap();
    let segment;
    {
        let engine = Engine::open(temp.path()).unwrap();
        engine.put(b"a", b"alpha").unwrap();
        engine.put(b"b", b"bravo").unwrap();
        engine.put(b"c", b"charlie").unwrap();
        segment = engine.segment_ids().unwrap()[0];
        engine.close().unwrap();
    }

    // Flip the first value byte of "b": entry "a" is 16 + 1 + 5 bytes.
    let path = dir::data_path(temp.path(), segment);
    let mut bytes = fs::read(&path).unwrap();
    bytes[22 + HEADER_SIZE + 1] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let engine = Engine::open(temp.path()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"alpha".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), Some(b"charlie".to_vec()));
    match engine.get(b"b") {
        Err(CoreError::CorruptRecord {
            segment_id, offset, ..
        }) => {
            assert_eq!(segment_id, segment);
            assert_eq!(offset, 22);
        }
        other => panic!("expected CorruptRecord, got {other:?}"),
    }
    assert_eq!(engine.stats().corrupt_reads, 1);
}

#[test]
fn merge_preserves_values_and_shrinks_disk() {
    let temp = tempdir().unwrap();
    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    let mut expected = BTreeMap::new();

    for round in 0..5u32 {
        for i in 0..20u32 {
            let key = format!("key{i}").into_bytes();
            let value = format!("round{round}-{i}").into_bytes();
            engine.put(&key, &value).unwrap();
            expected.insert(key, value);
        }
    }
    for i in (0..20u32).step_by(3) {
        let key = format!("key{i}").into_bytes();
        engine.delete(&key).unwrap();
        expected.remove(&key);
    }

    let before = engine.disk_size().unwrap();
    let result = engine.merge().unwrap();
    let after = engine.disk_size().unwrap();

    assert!(result.segments_merged >= 2);
    assert!(result.records_dropped > 0);
    assert!(after <= before, "disk grew from {before} to {after}");
    assert!(result.bytes_after <= result.bytes_before);

    for (key, value) in &expected {
        assert_eq!(engine.get(key).unwrap().as_ref(), Some(value));
    }
    assert_eq!(engine.len().unwrap(), expected.len());
    assert_eq!(engine.stats().merges, 1);
    engine.close().unwrap();

    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    for (key, value) in &expected {
        assert_eq!(engine.get(key).unwrap().as_ref(), Some(value));
    }
    let keys: Vec<_> = expected.keys().cloned().collect();
    assert_eq!(engine.keys().unwrap(), keys);
}

#[test]
fn interrupted_merge_output_is_discarded() {
    let temp = tempdir().unwrap();
    let last_id;
    {
        let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
        for i in 0..30u32 {
            engine.put(format!("k{i}").as_bytes(), b"value").unwrap();
        }
        last_id = *engine.segment_ids().unwrap().last().unwrap();
        engine.close().unwrap();
    }

    // A crash mid-merge leaves truncated outputs behind.
    let stray = SegmentId::new(last_id.as_u64() + 1);
    fs::write(dir::merge_data_path(temp.path(), stray), [1u8, 2, 3, 4, 5]).unwrap();
    fs::write(dir::merge_hint_path(temp.path(), stray), [9u8; 7]).unwrap();

    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    assert!(!dir::merge_data_path(temp.path(), stray).exists());
    assert!(!dir::merge_hint_path(temp.path(), stray).exists());
    for i in 0..30u32 {
        assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(b"value".to_vec()));
    }

    let result = engine.merge().unwrap();
    assert!(result.records_kept >= 30);
    for i in 0..30u32 {
        assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(b"value".to_vec()));
    }
}

#[test]
fn cancelled_merge_leaves_store_untouched() {
    let temp = tempdir().unwrap();
    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    for i in 0..30u32 {
        engine.put(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    let ids = engine.segment_ids().unwrap();

    let cancel = AtomicBool::new(true);
    assert!(matches!(
        engine.merge_with_cancel(&cancel),
        Err(CoreError::MergeFailed { .. })
    ));

    assert_eq!(engine.segment_ids().unwrap(), ids);
    let listing = dir::list_segments(temp.path()).unwrap();
    assert!(listing.merge_artifacts.is_empty());
    assert_eq!(engine.get(b"k0").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn hint_and_data_recovery_agree() {
    let temp = tempdir().unwrap();
    let mut expected = BTreeMap::new();
    {
        let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
        for i in 0..60u32 {
            let key = format!("key{}", i % 17).into_bytes();
            let value = format!("v{i}").into_bytes();
            engine.put(&key, &value).unwrap();
            expected.insert(key, value);
        }
        engine.delete(b"key3").unwrap();
        expected.remove(b"key3".as_slice());
        engine.close().unwrap();
    }

    let from_hints: BTreeMap<Vec<u8>, Vec<u8>> = {
        let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
        assert_eq!(engine.recovery_report().from_data, 0);
        let keys = engine.keys().unwrap();
        let map = keys
            .into_iter()
            .map(|k| {
                let v = engine.get(&k).unwrap().unwrap();
                (k, v)
            })
            .collect();
        engine.close().unwrap();
        map
    };

    for id in dir::list_segments(temp.path()).unwrap().hint_ids {
        fs::remove_file(dir::hint_path(temp.path(), id)).unwrap();
    }

    let engine = Engine::open_with_config(temp.path(), small_segments()).unwrap();
    let report = engine.recovery_report();
    assert_eq!(report.from_hints, 0);
    assert_eq!(report.from_data, report.segments);

    let keys = engine.keys().unwrap();
    let from_data: BTreeMap<Vec<u8>, Vec<u8>> = keys
        .into_iter()
        .map(|k| {
            let v = engine.get(&k).unwrap().unwrap();
            (k, v)
        })
        .collect();

    assert_eq!(from_hints, from_data);
    assert_eq!(from_data, expected);
}

#[test]
fn second_writer_gets_lock_held() {
    let temp = tempdir().unwrap();
    let _engine = Engine::open(temp.path()).unwrap();

    match Engine::open(temp.path()) {
        Err(CoreError::LockHeld { pid }) => assert_eq!(pid, std::process::id()),
        Err(other) => panic!("expected LockHeld, got {other}"),
        Ok(_) => panic!("second writer opened the store"),
    }
}

#[test]
fn stale_lock_resumes_crashed_active_segment() {
    let temp = tempdir().unwrap();
    let active;
    let clean_len;
    {
        let engine = Engine::open(temp.path()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        active = *engine.segment_ids().unwrap().last().unwrap();
        engine.close().unwrap();
        clean_len = fs::metadata(dir::data_path(temp.path(), active)).unwrap().len();
    }

    // Simulate a writer that died mid-append: a torn record at the tail and
    // a lock file nobody holds.
    let mut data = OpenOptions::new()
        .append(true)
        .open(dir::data_path(temp.path(), active))
        .unwrap();
    data.write_all(&[0x55; HEADER_SIZE - 3]).unwrap();
    drop(data);
    fs::write(temp.path().join(LOCK_FILE), format!("999999\t{active}.data")).unwrap();

    let engine = Engine::open(temp.path()).unwrap();
    assert_eq!(engine.recovery_report().resumed_active, Some(active));
    assert_eq!(*engine.segment_ids().unwrap().last().unwrap(), active);
    assert_eq!(
        fs::metadata(dir::data_path(temp.path(), active)).unwrap().len(),
        clean_len
    );
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));

    // Appends continue in the resumed segment.
    engine.put(b"c", b"3").unwrap();
    assert_eq!(engine.segment_ids().unwrap(), vec![active]);
    let lock = fs::read_to_string(temp.path().join(LOCK_FILE)).unwrap();
    assert_eq!(lock, format!("{}\t{active}.data", std::process::id()));
    engine.close().unwrap();

    let engine = Engine::open(temp.path()).unwrap();
    assert_eq!(engine.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.recovery_report().from_hints, 1);
}

#[test]
fn stale_lock_with_corrupt_active_keeps_later_records() {
    let temp = tempdir().unwrap();
    let active;
    {
        let engine = Engine::open(temp.path()).unwrap();
        engine.put(b"a", b"alpha").unwrap();
        engine.put(b"b", b"bravo").unwrap();
        active = *engine.segment_ids().unwrap().last().unwrap();
        engine.close().unwrap();
    }

    let path = dir::data_path(temp.path(), active);
    let mut bytes = fs::read(&path).unwrap();
    bytes[HEADER_SIZE + 1] ^= 0xff;
    fs::write(&path, &bytes).unwrap();
    fs::write(temp.path().join(LOCK_FILE), format!("999999\t{active}.data")).unwrap();

    let engine = Engine::open(temp.path()).unwrap();
    assert_eq!(engine.recovery_report().resumed_active, None);
    assert_eq!(fs::read(&path).unwrap(), bytes);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"bravo".to_vec()));
    assert!(matches!(
        engine.get(b"a"),
        Err(CoreError::CorruptRecord { offset: 0, .. })
    ));

    // The damaged segment is sealed; writes go to a fresh one.
    engine.put(b"c", b"charlie").unwrap();
    let ids = engine.segment_ids().unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], active);
    assert_eq!(fs::read(&path).unwrap(), bytes);
}

#[test]
fn interrupted_retirement_does_not_resurrect_deleted_key() {
    let temp = tempdir().unwrap();
    let path = temp.path();
    {
        let engine = Engine::open(path).unwrap();
        engine.put(b"a", b"old").unwrap();
        engine.close().unwrap();
    }

    // The merge output gets an id above the active segment.
    let output = {
        let engine = Engine::open(path).unwrap();
        let result = engine.merge().unwrap();
        engine.close().unwrap();
        assert_eq!(result.output_segments.len(), 1);
        result.output_segments[0]
    };
    {
        let engine = Engine::open(path).unwrap();
        engine.delete(b"a").unwrap();
        engine.close().unwrap();
    }

    let saved_data = fs::read(dir::data_path(path, output)).unwrap();
    let saved_hint = fs::read(dir::hint_path(path, output)).unwrap();
    let inputs = {
        let engine = Engine::open(path).unwrap();
        let mut inputs = engine.segment_ids().unwrap();
        inputs.pop();
        assert!(inputs.contains(&output));
        let result = engine.merge().unwrap();
        assert_eq!(result.records_kept, 0);
        assert_eq!(result.records_dropped, 2);
        engine.close().unwrap();
        inputs
    };

    // Crash after the marker was written but before the old output went.
    fs::write(dir::data_path(path, output), saved_data).unwrap();
    fs::write(dir::hint_path(path, output), saved_hint).unwrap();
    dir::write_retire_marker(path, &inputs).unwrap();

    let engine = Engine::open(path).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), None);
    assert!(!dir::data_path(path, output).exists());
    assert!(!dir::hint_path(path, output).exists());
    assert!(!path.join(dir::RETIRE_FILE).exists());
}

#[test]
fn background_merge_with_concurrent_writes() {
    let temp = tempdir().unwrap();
    let engine = Arc::new(Engine::open_with_config(temp.path(), small_segments()).unwrap());

    for i in 0..50u32 {
        engine.put(format!("k{i}").as_bytes(), b"old").unwrap();
    }

    let task = engine.spawn_merge().unwrap();
    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..50u32 {
                engine.put(format!("k{i}").as_bytes(), b"new").unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let value = engine.get(format!("k{i}").as_bytes()).unwrap();
                    assert!(matches!(value.as_deref(), Some(b"old") | Some(b"new")));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    task.join().unwrap();

    for i in 0..50u32 {
        assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(b"new".to_vec()));
    }
}

#[test]
fn empty_active_segment_removed_on_close() {
    let temp = tempdir().unwrap();
    {
        let engine = Engine::open(temp.path()).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }
    for _ in 0..3 {
        let engine = Engine::open(temp.path()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
        engine.close().unwrap();
    }

    let listing = dir::list_segments(temp.path()).unwrap();
    assert_eq!(listing.data_ids.len(), 1);
    assert_eq!(listing.hint_ids.len(), 1);
}
