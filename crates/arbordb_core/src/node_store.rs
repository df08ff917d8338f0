//! The node store: root access, merges, checkpoints and blobs.
//!
//! The head record of the file store points at a *super-root* with two
//! children: `root`, the user-visible content tree, and `checkpoints`,
//! named snapshots of earlier roots. Commits write the proposed tree and
//! advance the head by compare-and-set, rebasing and retrying on conflict.

use crate::error::{Error, Result};
use crate::journal::unix_millis;
use crate::node::{Blob, NodeBuilder, NodeState, Value};
use crate::record::RecordId;
use crate::store::file_store::{CHECKPOINTS_NODE, ROOT_NODE};
use crate::store::{FileStore, SegmentStore};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Number of rebase attempts before a commit conflict is surfaced.
const COMMIT_RETRIES: usize = 16;

/// Processes a change set right before it is committed.
///
/// Hooks run on every commit attempt, including rebased retries, and may
/// mutate the builder (validation, normalization, derived content).
pub trait CommitHook: Send + Sync {
    /// Inspects or adjusts the changes about to be committed.
    fn process(&self, builder: &mut NodeBuilder) -> Result<()>;
}

/// A hook that accepts every change set unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHook;

impl CommitHook for EmptyHook {
    fn process(&self, _builder: &mut NodeBuilder) -> Result<()> {
        Ok(())
    }
}

/// An external store for large binaries, addressed by opaque references.
pub trait BlobStore: Send + Sync {
    /// Stores a stream and returns its reference.
    fn write(&self, stream: &mut dyn Read) -> Result<String>;

    /// Reads back the content behind a reference.
    fn read(&self, reference: &str) -> Result<Vec<u8>>;
}

/// The content-tree API over a [`FileStore`].
pub struct NodeStore {
    store: Arc<FileStore>,
    blob_store: Option<Arc<dyn BlobStore>>,
    /// Serializes commits from this node store: the head CAS then only
    /// races with compaction, keeping commit retries bounded.
    commit_semaphore: parking_lot::Mutex<()>,
}

impl NodeStore {
    /// Creates a node store over a file store; blobs are stored inline.
    #[must_use]
    pub fn new(store: Arc<FileStore>) -> Self {
        Self {
            store,
            blob_store: None,
            commit_semaphore: parking_lot::Mutex::new(()),
        }
    }

    /// Creates a node store that sends blob streams to an external store.
    #[must_use]
    pub fn with_blob_store(store: Arc<FileStore>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blob_store: Some(blob_store),
            commit_semaphore: parking_lot::Mutex::new(()),
        }
    }

    /// Returns the underlying file store.
    #[must_use]
    pub fn file_store(&self) -> &Arc<FileStore> {
        &self.store
    }

    fn store_arc(&self) -> Arc<dyn SegmentStore> {
        Arc::clone(&self.store) as Arc<dyn SegmentStore>
    }

    fn super_root(&self) -> NodeState {
        NodeState::new(self.store_arc(), self.store.head_id())
    }

    fn child_of(&self, state: &NodeState, name: &str) -> Result<NodeState> {
        state.child(name)?.ok_or_else(|| {
            Error::corruption(format!("super-root is missing its {name} child"))
        })
    }

    /// Returns the current root of the content tree.
    pub fn get_root(&self) -> Result<NodeState> {
        self.child_of(&self.super_root(), ROOT_NODE)
    }

    /// Commits a change set against the root, running `hook` on each
    /// attempt.
    ///
    /// The builder's changes are rebased onto the latest root before every
    /// attempt, so commits that lose the head race are retried rather than
    /// failed; after [`COMMIT_RETRIES`] lost races the commit surfaces
    /// [`Error::CommitConflict`].
    pub fn merge(&self, builder: &NodeBuilder, hook: &dyn CommitHook) -> Result<NodeState> {
        let _commit = self.commit_semaphore.lock();
        for _ in 0..COMMIT_RETRIES {
            let head = self.store.head_id();
            let super_state = NodeState::new(self.store_arc(), head.clone());
            let current_root = self.child_of(&super_state, ROOT_NODE)?;

            let mut proposed = builder.rebase(Some(current_root))?;
            hook.process(&mut proposed)?;

            let new_root = self.write(&proposed)?;
            let mut super_builder = super_state.builder();
            super_builder.set_child(ROOT_NODE, NodeState::new(self.store_arc(), new_root.clone()));

            let new_head = self.write(&super_builder)?;
            if self.store.set_head(&head, &new_head) {
                return Ok(NodeState::new(self.store_arc(), new_root));
            }
        }
        Err(Error::CommitConflict)
    }

    fn write(&self, builder: &NodeBuilder) -> Result<RecordId> {
        let generation = self.store.head_generation()?;
        self.store.segment_writer().write_builder(
            &*self.store,
            self.store.writer_pool(),
            "sys",
            generation,
            builder,
        )
    }

    /// Creates a checkpoint of the current root and returns its name.
    ///
    /// The checkpoint records its creation time and the requested lifetime
    /// and snapshots the root by reference; compaction deduplicates the
    /// snapshot against the live root for as long as they stay equal.
    pub fn checkpoint(&self, lifetime: Duration) -> Result<String> {
        let name = uuid::Uuid::new_v4().to_string();

        let _commit = self.commit_semaphore.lock();
        for _ in 0..COMMIT_RETRIES {
            let head = self.store.head_id();
            let super_state = NodeState::new(self.store_arc(), head.clone());
            let current_root = self.child_of(&super_state, ROOT_NODE)?;

            let mut super_builder = super_state.builder();
            let checkpoint = super_builder.child(CHECKPOINTS_NODE)?.child(&name)?;
            checkpoint.set_property("created", Value::long(unix_millis() as i64));
            checkpoint.set_property(
                "lifetime",
                Value::long(i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX)),
            );
            checkpoint.set_child(ROOT_NODE, current_root);

            let new_head = self.write(&super_builder)?;
            if self.store.set_head(&head, &new_head) {
                return Ok(name);
            }
        }
        Err(Error::CommitConflict)
    }

    /// Resolves the root snapshot stored under a checkpoint.
    pub fn retrieve(&self, checkpoint: &str) -> Result<Option<NodeState>> {
        let checkpoints = self.child_of(&self.super_root(), CHECKPOINTS_NODE)?;
        match checkpoints.child(checkpoint)? {
            Some(entry) => entry.child(ROOT_NODE),
            None => Ok(None),
        }
    }

    /// Removes a checkpoint. Returns `false` if it did not exist.
    pub fn release(&self, checkpoint: &str) -> Result<bool> {
        let _commit = self.commit_semaphore.lock();
        for _ in 0..COMMIT_RETRIES {
            let head = self.store.head_id();
            let super_state = NodeState::new(self.store_arc(), head.clone());
            let checkpoints = self.child_of(&super_state, CHECKPOINTS_NODE)?;
            if !checkpoints.has_child(checkpoint)? {
                return Ok(false);
            }

            let mut super_builder = super_state.builder();
            super_builder
                .child(CHECKPOINTS_NODE)?
                .remove_child(checkpoint);

            let new_head = self.write(&super_builder)?;
            if self.store.set_head(&head, &new_head) {
                return Ok(true);
            }
        }
        Err(Error::CommitConflict)
    }

    /// Stores a binary stream and returns a blob usable as a property
    /// value.
    ///
    /// With an external blob store configured the stream goes there and
    /// only the reference is kept; otherwise the stream is chunked into
    /// bulk segments.
    pub fn create_blob(&self, stream: &mut dyn Read) -> Result<Blob> {
        if let Some(blob_store) = &self.blob_store {
            let reference = blob_store.write(stream)?;
            return Ok(Blob::External(reference));
        }

        let generation = self.store.head_generation()?;
        self.store.segment_writer().write_stream(
            &*self.store,
            self.store.writer_pool(),
            "sys",
            generation,
            stream,
        )
    }

    /// Reads the full content of a blob, resolving external references
    /// through the configured blob store.
    pub fn read_blob(&self, blob: &Blob) -> Result<Vec<u8>> {
        match blob {
            Blob::External(reference) => match &self.blob_store {
                Some(blob_store) => blob_store.read(reference),
                None => Err(Error::corruption(format!(
                    "blob {reference} requires an external blob store"
                ))),
            },
            other => other.read(&*self.store),
        }
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("store", &self.store)
            .field("external_blobs", &self.blob_store.is_some())
            .finish()
    }
}
