//! The node model: immutable node states and in-memory builders.
//!
//! A [`NodeState`] is a read-only view of a node record; it resolves its
//! template, properties and children lazily through the store. A
//! [`NodeBuilder`] accumulates changes against a base state (or from
//! scratch) purely in memory; the record writer turns a builder into new
//! records when the change set is committed.

use crate::error::{Error, Result};
use crate::record::template::{MIXIN_TYPES_NAME, PRIMARY_TYPE_NAME};
use crate::record::{ChildName, RecordId};
use crate::store::SegmentStore;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Scalar type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Long,
    /// 64-bit IEEE float; the exact bit pattern is preserved.
    Double,
    /// Boolean.
    Boolean,
    /// Binary stream.
    Binary,
}

/// A single property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// A string value.
    String(String),
    /// A long value.
    Long(i64),
    /// A double value.
    Double(f64),
    /// A boolean value.
    Boolean(bool),
    /// A binary value.
    Binary(Blob),
}

impl Scalar {
    /// Returns the scalar's type.
    #[must_use]
    pub fn ty(&self) -> Type {
        match self {
            Self::String(_) => Type::String,
            Self::Long(_) => Type::Long,
            Self::Double(_) => Type::Double,
            Self::Boolean(_) => Type::Boolean,
            Self::Binary(_) => Type::Binary,
        }
    }
}

/// A property value: one scalar or a typed list of scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A single value.
    Single(Scalar),
    /// Zero or more values of one type.
    Multi(Type, Vec<Scalar>),
}

impl Value {
    /// Returns the scalar type of the value.
    #[must_use]
    pub fn ty(&self) -> Type {
        match self {
            Self::Single(scalar) => scalar.ty(),
            Self::Multi(ty, _) => *ty,
        }
    }

    /// Checks whether this is a multi-valued property.
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        matches!(self, Self::Multi(..))
    }

    /// Convenience constructor for a string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Single(Scalar::String(value.into()))
    }

    /// Convenience constructor for a long value.
    #[must_use]
    pub fn long(value: i64) -> Self {
        Self::Single(Scalar::Long(value))
    }

    /// Convenience constructor for a boolean value.
    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::Single(Scalar::Boolean(value))
    }

    /// Convenience constructor for a binary value.
    #[must_use]
    pub fn binary(blob: Blob) -> Self {
        Self::Single(Scalar::Binary(blob))
    }

    /// Returns the string content of a single string value.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Single(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the content of a single long value.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Single(Scalar::Long(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the blob of a single binary value.
    #[must_use]
    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Self::Single(Scalar::Binary(blob)) => Some(blob),
            _ => None,
        }
    }
}

/// A binary value.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
    /// Bytes held in memory, not yet persisted.
    Inline(Vec<u8>),
    /// A persisted value record.
    Record {
        /// The value record holding the stream.
        id: RecordId,
        /// Stream length in bytes.
        length: u64,
    },
    /// A reference into an external blob store.
    External(String),
}

impl Blob {
    /// Returns the blob length, if known without consulting an external
    /// blob store.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        match self {
            Self::Inline(bytes) => Some(bytes.len() as u64),
            Self::Record { length, .. } => Some(*length),
            Self::External(_) => None,
        }
    }

    /// Returns the external reference, if this blob lives outside the
    /// store.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::External(reference) => Some(reference),
            _ => None,
        }
    }

    /// Reads the full blob content from the store.
    ///
    /// Fails for external blobs; resolve those through the blob store.
    pub fn read(&self, store: &dyn SegmentStore) -> Result<Vec<u8>> {
        match self {
            Self::Inline(bytes) => Ok(bytes.clone()),
            Self::Record { id, .. } => store.record_reader().read_value_bytes(store, id),
            Self::External(reference) => Err(Error::corruption(format!(
                "blob {reference} lives in an external blob store"
            ))),
        }
    }
}

/// A named property.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: Value,
}

/// An immutable view of a node record.
#[derive(Clone)]
pub struct NodeState {
    store: Arc<dyn SegmentStore>,
    id: RecordId,
}

impl NodeState {
    /// Creates a node state over an existing node record.
    #[must_use]
    pub fn new(store: Arc<dyn SegmentStore>, id: RecordId) -> Self {
        Self { store, id }
    }

    /// Returns the record id of the node.
    #[must_use]
    pub fn record_id(&self) -> &RecordId {
        &self.id
    }

    pub(crate) fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    /// Returns the names of the node's properties, including the folded
    /// type properties.
    pub fn property_names(&self) -> Result<Vec<String>> {
        let reader = self.store.record_reader();
        let node = reader.read_node(&*self.store, &self.id)?;
        let mut names = Vec::new();
        if node.template.primary_type.is_some() {
            names.push(PRIMARY_TYPE_NAME.to_string());
        }
        if !node.template.mixin_types.is_empty() {
            names.push(MIXIN_TYPES_NAME.to_string());
        }
        names.extend(node.template.properties.iter().map(|p| p.name.clone()));
        Ok(names)
    }

    /// Reads a property value by name.
    pub fn property(&self, name: &str) -> Result<Option<Value>> {
        let reader = self.store.record_reader();
        let node = reader.read_node(&*self.store, &self.id)?;

        if name == PRIMARY_TYPE_NAME {
            if let Some(ty) = &node.template.primary_type {
                return Ok(Some(Value::string(ty.clone())));
            }
        }
        if name == MIXIN_TYPES_NAME && !node.template.mixin_types.is_empty() {
            let mixins = node
                .template
                .mixin_types
                .iter()
                .map(|m| Scalar::String(m.clone()))
                .collect();
            return Ok(Some(Value::Multi(Type::String, mixins)));
        }

        let Some(slot) = node
            .template
            .properties
            .iter()
            .position(|p| p.name == name)
        else {
            return Ok(None);
        };
        let template = &node.template.properties[slot];
        let value = reader.read_property(
            &*self.store,
            &node.property_values[slot],
            template.ty,
            template.multiple,
        )?;
        Ok(Some(value))
    }

    /// Reads all properties of the node.
    pub fn properties(&self) -> Result<Vec<Property>> {
        let mut properties = Vec::new();
        for name in self.property_names()? {
            if let Some(value) = self.property(&name)? {
                properties.push(Property { name, value });
            }
        }
        Ok(properties)
    }

    /// Returns the number of child nodes.
    pub fn child_count(&self) -> Result<u64> {
        let reader = self.store.record_reader();
        let node = reader.read_node(&*self.store, &self.id)?;
        match node.child {
            ChildSlot::Zero => Ok(0),
            ChildSlot::One(_) => Ok(1),
            ChildSlot::Map(map_id) => {
                Ok(u64::from(reader.map(&*self.store, &map_id)?.size()))
            }
        }
    }

    /// Checks whether a child with the given name exists.
    pub fn has_child(&self, name: &str) -> Result<bool> {
        Ok(self.child(name)?.is_some())
    }

    /// Resolves a child node by name.
    pub fn child(&self, name: &str) -> Result<Option<NodeState>> {
        let reader = self.store.record_reader();
        let node = reader.read_node(&*self.store, &self.id)?;
        let child_id = match &node.child {
            ChildSlot::Zero => None,
            ChildSlot::One(id) => match &node.template.child_name {
                ChildName::One(child_name) if child_name == name => Some(id.clone()),
                _ => None,
            },
            ChildSlot::Map(map_id) => reader
                .map(&*self.store, map_id)?
                .get(&*self.store, name)?,
        };
        Ok(child_id.map(|id| NodeState::new(Arc::clone(&self.store), id)))
    }

    /// Returns the names of all child nodes.
    pub fn child_names(&self) -> Result<Vec<String>> {
        let reader = self.store.record_reader();
        let node = reader.read_node(&*self.store, &self.id)?;
        match &node.child {
            ChildSlot::Zero => Ok(Vec::new()),
            ChildSlot::One(_) => match &node.template.child_name {
                ChildName::One(name) => Ok(vec![name.clone()]),
                _ => Err(Error::corruption("single-child template without a name")),
            },
            ChildSlot::Map(map_id) => {
                let entries = reader.map(&*self.store, map_id)?.entries(&*self.store)?;
                Ok(entries.into_iter().map(|(name, _)| name).collect())
            }
        }
    }

    /// Starts a builder on top of this state.
    #[must_use]
    pub fn builder(&self) -> NodeBuilder {
        NodeBuilder {
            base: Some(self.clone()),
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeState({})", self.id)
    }
}

/// The decoded child slot of a node record.
#[derive(Debug, Clone)]
pub(crate) enum ChildSlot {
    Zero,
    One(RecordId),
    Map(RecordId),
}

/// A pending change to one child slot of a builder.
#[derive(Debug)]
pub(crate) enum ChildChange {
    /// The child was replaced or created from an existing state.
    State(NodeState),
    /// The child is being edited through a nested builder.
    Builder(NodeBuilder),
}

/// An in-memory set of changes against a base node state.
///
/// Builders are cheap: nothing is written until the builder is merged
/// through the node store. Children untouched by the builder keep their
/// record ids and are shared structurally with the base revision.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    pub(crate) base: Option<NodeState>,
    /// Pending property changes; `None` removes the property.
    pub(crate) properties: BTreeMap<String, Option<Value>>,
    /// Pending child changes; `None` removes the child.
    pub(crate) children: BTreeMap<String, Option<ChildChange>>,
}

impl NodeBuilder {
    /// Creates a builder for a brand-new node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the base state this builder edits, if any.
    #[must_use]
    pub fn base(&self) -> Option<&NodeState> {
        self.base.as_ref()
    }

    /// Checks whether the builder carries any changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        if !self.properties.is_empty() {
            return true;
        }
        self.children.iter().any(|(_, change)| match change {
            Some(ChildChange::Builder(builder)) => builder.has_changes() || builder.base.is_none(),
            _ => true,
        })
    }

    /// Sets a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.properties.insert(name.into(), Some(value));
        self
    }

    /// Removes a property.
    pub fn remove_property(&mut self, name: &str) -> &mut Self {
        self.properties.insert(name.to_string(), None);
        self
    }

    /// Reads a property as the builder would write it.
    pub fn property(&self, name: &str) -> Result<Option<Value>> {
        if let Some(change) = self.properties.get(name) {
            return Ok(change.clone());
        }
        match &self.base {
            Some(base) => base.property(name),
            None => Ok(None),
        }
    }

    /// Replaces or creates a child from an existing node state.
    pub fn set_child(&mut self, name: impl Into<String>, state: NodeState) -> &mut Self {
        self.children
            .insert(name.into(), Some(ChildChange::State(state)));
        self
    }

    /// Removes a child node.
    pub fn remove_child(&mut self, name: &str) -> &mut Self {
        self.children.insert(name.to_string(), None);
        self
    }

    /// Returns a nested builder for a child, creating the child if it does
    /// not exist.
    pub fn child(&mut self, name: &str) -> Result<&mut NodeBuilder> {
        if !matches!(
            self.children.get(name),
            Some(Some(ChildChange::Builder(_)))
        ) {
            let nested = match self.children.remove(name) {
                Some(Some(ChildChange::State(state))) => state.builder(),
                Some(Some(ChildChange::Builder(builder))) => builder,
                Some(None) => NodeBuilder::new(),
                None => match &self.base {
                    Some(base) => match base.child(name)? {
                        Some(state) => state.builder(),
                        None => NodeBuilder::new(),
                    },
                    None => NodeBuilder::new(),
                },
            };
            self.children
                .insert(name.to_string(), Some(ChildChange::Builder(nested)));
        }

        match self.children.get_mut(name) {
            Some(Some(ChildChange::Builder(builder))) => Ok(builder),
            _ => unreachable!("child change was just inserted"),
        }
    }

    /// Checks whether a child exists as the builder would write it.
    pub fn has_child(&self, name: &str) -> Result<bool> {
        match self.children.get(name) {
            Some(Some(_)) => Ok(true),
            Some(None) => Ok(false),
            None => match &self.base {
                Some(base) => base.has_child(name),
                None => Ok(false),
            },
        }
    }

    /// Replays this builder's changes onto a different base.
    ///
    /// Used to rebase a commit after losing the head compare-and-set.
    /// Conflicts resolve last-writer-wins at the granularity of individual
    /// property and child changes.
    pub(crate) fn rebase(&self, new_base: Option<NodeState>) -> Result<NodeBuilder> {
        let mut children = BTreeMap::new();
        for (name, change) in &self.children {
            let rebased = match change {
                None => None,
                Some(ChildChange::State(state)) => Some(ChildChange::State(state.clone())),
                Some(ChildChange::Builder(builder)) => {
                    let child_base = match &new_base {
                        Some(base) => base.child(name)?,
                        None => None,
                    };
                    Some(ChildChange::Builder(builder.rebase(child_base)?))
                }
            };
            children.insert(name.clone(), rebased);
        }
        Ok(NodeBuilder {
            base: new_base,
            properties: self.properties.clone(),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_tracks_property_changes() {
        let mut builder = NodeBuilder::new();
        assert!(!builder.has_changes());

        builder.set_property("a", Value::long(1));
        assert!(builder.has_changes());
        assert_eq!(builder.property("a").unwrap(), Some(Value::long(1)));

        builder.remove_property("a");
        assert_eq!(builder.property("a").unwrap(), None);
    }

    #[test]
    fn nested_child_builders() {
        let mut builder = NodeBuilder::new();
        builder
            .child("a")
            .unwrap()
            .child("b")
            .unwrap()
            .set_property("x", Value::boolean(true));

        assert!(builder.has_child("a").unwrap());
        assert!(builder.child("a").unwrap().has_child("b").unwrap());
    }

    #[test]
    fn removed_child_reported_absent() {
        let mut builder = NodeBuilder::new();
        builder.child("a").unwrap();
        builder.remove_child("a");
        assert!(!builder.has_child("a").unwrap());
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::string("x").as_string(), Some("x"));
        assert_eq!(Value::long(7).as_long(), Some(7));
        assert_eq!(Value::string("x").as_long(), None);
        assert_eq!(Value::long(7).ty(), Type::Long);
        assert!(Value::Multi(Type::String, Vec::new()).is_multiple());
    }

    #[test]
    fn blob_length() {
        assert_eq!(Blob::Inline(vec![1, 2, 3]).length(), Some(3));
        assert_eq!(Blob::External("ref".to_string()).length(), None);
        assert_eq!(
            Blob::External("ref".to_string()).reference(),
            Some("ref")
        );
    }
}
