//! End-to-end tests of the file store, the node store, and the garbage
//! collector.

use arbordb_core::{
    Config, EmptyHook, FileStore, GcOptions, NodeStore, SegmentStore, Value,
};
use std::sync::Arc;
use std::time::Duration;

fn open(directory: &std::path::Path) -> NodeStore {
    NodeStore::new(
        FileStore::open(directory, Config::new().max_file_size(1)).expect("open store"),
    )
}

#[test]
fn persisted_head_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path());
        let mut builder = store.get_root().unwrap().builder();
        builder
            .child("a")
            .unwrap()
            .child("b")
            .unwrap()
            .set_property("done", Value::boolean(true));
        store.merge(&builder, &EmptyHook).unwrap();
        store.file_store().flush().unwrap();
        store.file_store().close().unwrap();
    }

    let store = open(dir.path());
    let root = store.get_root().unwrap();
    let a = root.child("a").unwrap().expect("child a");
    let b = a.child("b").unwrap().expect("child b");
    assert_eq!(b.property("done").unwrap(), Some(Value::boolean(true)));
    store.file_store().close().unwrap();
}

#[test]
fn compaction_reclaims_removed_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let file_store = Arc::clone(store.file_store());

    // A 5 MiB binary property.
    let payload: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 255) as u8).collect();
    let blob = store.create_blob(&mut payload.as_slice()).unwrap();
    let mut builder = store.get_root().unwrap().builder();
    builder.set_property("blob1", Value::binary(blob));
    store.merge(&builder, &EmptyHook).unwrap();
    file_store.flush().unwrap();

    let with_blob = file_store.size();
    assert!(with_blob >= 5 * 1024 * 1024, "blob not persisted");

    // Removing the property does not shrink the store: segments are
    // immutable.
    let mut builder = store.get_root().unwrap().builder();
    builder.remove_property("blob1");
    store.merge(&builder, &EmptyHook).unwrap();
    file_store.flush().unwrap();
    assert!(file_store.size() >= with_blob);

    // Two full GC cycles age the blob's generation out of retention.
    assert!(file_store.compact());
    file_store.cleanup().unwrap();
    assert!(file_store.compact());
    file_store.cleanup().unwrap();

    let after = file_store.size();
    assert!(
        after < with_blob / 2,
        "blob was not reclaimed: {after} of {with_blob} bytes left"
    );

    // The store still works.
    assert_eq!(store.get_root().unwrap().property("blob1").unwrap(), None);
    file_store.close().unwrap();
}

#[test]
fn concurrent_commits_during_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(dir.path()));
    let file_store = Arc::clone(store.file_store());

    // Seed some content so compaction has work to do.
    let mut builder = store.get_root().unwrap().builder();
    for i in 0..20 {
        builder
            .child(&format!("seed-{i}"))
            .unwrap()
            .set_property("v", Value::long(i));
    }
    store.merge(&builder, &EmptyHook).unwrap();
    let before_root = store.get_root().unwrap().record_id().clone();

    let compactor = {
        let file_store = Arc::clone(&file_store);
        std::thread::spawn(move || file_store.compact())
    };

    let mut writers = Vec::new();
    for i in 0..10 {
        let store = Arc::clone(&store);
        writers.push(std::thread::spawn(move || -> arbordb_core::Result<()> {
            for j in 0..5 {
                let mut builder = store.get_root()?.builder();
                builder
                    .child(&format!("b-{i}-{j}"))
                    .unwrap()
                    .set_property("j", Value::long(j));
                store.merge(&builder, &EmptyHook)?;
            }
            Ok(())
        }));
    }

    let mut failed_commits = 0;
    for writer in writers {
        if writer.join().expect("writer thread panicked").is_err() {
            failed_commits += 1;
        }
    }
    let compacted = compactor.join().expect("compactor thread panicked");
    assert_eq!(failed_commits, 0, "commits failed during compaction");

    // Every commit survived, whichever side of the compaction it landed
    // on.
    let root = store.get_root().unwrap();
    for i in 0..10 {
        for j in 0..5 {
            assert!(
                root.child(&format!("b-{i}-{j}")).unwrap().is_some(),
                "lost commit b-{i}-{j}"
            );
        }
    }

    if compacted {
        // The compacted root lives in a fresh segment.
        assert_ne!(
            root.record_id().segment_id(),
            before_root.segment_id(),
            "compaction did not rewrite the root"
        );
    }
    file_store.close().unwrap();
}

#[test]
fn journal_lines_are_well_formed() {
    let dir = tempfile::tempdir().unwrap();
    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;

    let store = open(dir.path());
    for i in 0..5 {
        let mut builder = store.get_root().unwrap().builder();
        builder.set_property("i", Value::long(i));
        store.merge(&builder, &EmptyHook).unwrap();
        store.file_store().flush().unwrap();
    }
    store.file_store().close().unwrap();

    let journal = std::fs::read_to_string(dir.path().join("journal.log")).unwrap();
    let lines: Vec<&str> = journal.lines().collect();
    assert!(lines.len() >= 5);

    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(tokens.len(), 3, "malformed journal line: {line}");
        assert_eq!(tokens[1], "root");
        let millis: u64 = tokens[2].parse().expect("timestamp token");
        assert!(millis >= start, "timestamp before test start");
    }
}

#[test]
fn cleanup_preserves_references_across_segments() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path());
        // A child subtree committed first; the parent commit references it
        // from a later segment.
        let mut builder = store.get_root().unwrap().builder();
        builder
            .child("child")
            .unwrap()
            .set_property("payload", Value::string("x".repeat(1000)));
        store.merge(&builder, &EmptyHook).unwrap();
        store.file_store().flush().unwrap();

        let mut builder = store.get_root().unwrap().builder();
        builder
            .child("parent")
            .unwrap()
            .set_property("note", Value::string("refers to earlier segments"));
        store.merge(&builder, &EmptyHook).unwrap();
        store.file_store().flush().unwrap();
        store.file_store().close().unwrap();
    }

    let store = open(dir.path());
    store.file_store().cleanup().unwrap();

    let root = store.get_root().unwrap();
    let child = root.child("child").unwrap().expect("child reachable");
    assert_eq!(
        child.property("payload").unwrap(),
        Some(Value::string("x".repeat(1000)))
    );
    assert!(root.child("parent").unwrap().is_some());
    store.file_store().close().unwrap();
}

#[test]
fn checkpoint_deduplicated_with_compacted_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let file_store = Arc::clone(store.file_store());

    let mut builder = store.get_root().unwrap().builder();
    builder.set_property("state", Value::string("checkpointed"));
    store.merge(&builder, &EmptyHook).unwrap();

    let checkpoint = store.checkpoint(Duration::from_secs(3600)).unwrap();
    assert!(file_store.compact());

    let snapshot = store
        .retrieve(&checkpoint)
        .unwrap()
        .expect("checkpoint resolves after compaction");
    let root = store.get_root().unwrap();
    assert_eq!(
        snapshot.record_id(),
        root.record_id(),
        "structurally equal checkpoint was not deduplicated"
    );
    file_store.close().unwrap();
}

#[test]
fn cancelled_compaction_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let file_store = Arc::clone(store.file_store());

    let mut builder = store.get_root().unwrap().builder();
    for i in 0..50 {
        builder
            .child(&format!("n{i}"))
            .unwrap()
            .set_property("v", Value::long(i));
    }
    store.merge(&builder, &EmptyHook).unwrap();
    let head_before = file_store.head_id();

    // Shutdown is one of the cancellation conditions; closing the store
    // mid-test is awkward, so drive the writer directly with an
    // always-cancelled signal instead.
    let result = file_store
        .segment_writer()
        .write_node(
            &*file_store,
            file_store.writer_pool(),
            "c",
            file_store.head_generation().unwrap() + 1,
            &head_before,
            &|| true,
        )
        .unwrap();
    assert!(result.is_none(), "cancelled compaction produced a root");
    assert_eq!(file_store.head_id(), head_before, "head moved");

    // The aborted generation is unreachable; cleanup gets rid of it and
    // the content stays intact.
    file_store.cleanup().unwrap();
    assert_eq!(store.get_root().unwrap().child_count().unwrap(), 50);
    file_store.close().unwrap();
}

#[test]
fn generations_age_out_after_repeated_gc() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let file_store = Arc::clone(store.file_store());

    let mut builder = store.get_root().unwrap().builder();
    builder.set_property("keep", Value::string("me"));
    store.merge(&builder, &EmptyHook).unwrap();

    for expected in 1..=3u32 {
        assert!(file_store.compact());
        file_store.cleanup().unwrap();
        assert_eq!(file_store.head_generation().unwrap(), expected);
    }

    // Retention: everything reachable is within the retained window.
    let root = store.get_root().unwrap();
    let generation = file_store
        .read_segment(root.record_id().segment_id())
        .unwrap()
        .generation();
    assert!(generation >= 2, "root generation {generation} too old");
    assert_eq!(root.property("keep").unwrap(), Some(Value::string("me")));
    file_store.close().unwrap();
}

#[test]
fn paused_gc_skips_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new()
        .max_file_size(1)
        .gc_options(GcOptions::new().paused(true).gain_threshold(0));
    let file_store = FileStore::open(dir.path(), config).unwrap();
    let store = NodeStore::new(Arc::clone(&file_store));

    let mut builder = store.get_root().unwrap().builder();
    builder.set_property("a", Value::long(1));
    store.merge(&builder, &EmptyHook).unwrap();

    let generation = file_store.head_generation().unwrap();
    file_store.maybe_compact(true);
    assert_eq!(
        file_store.head_generation().unwrap(),
        generation,
        "paused gc compacted anyway"
    );
    file_store.close().unwrap();
}

#[test]
fn estimation_reports_reclaimable_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let file_store = Arc::clone(store.file_store());

    // Produce garbage by overwriting the same property repeatedly.
    for i in 0..50 {
        let mut builder = store.get_root().unwrap().builder();
        builder.set_property("counter", Value::string("x".repeat(2000 + i)));
        store.merge(&builder, &EmptyHook).unwrap();
    }
    file_store.flush().unwrap();

    let (reachable, total) = file_store.estimate_reachability();
    assert!(total > 0);
    assert!(
        reachable < total,
        "estimation found no garbage: {reachable}/{total}"
    );
    file_store.close().unwrap();
}
