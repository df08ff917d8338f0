//! Node templates.
//!
//! A template captures the *shape* of a node: its property names and types,
//! the designated `primaryType`/`mixinTypes` values, and whether it has
//! zero, one, or many child nodes. Nodes with identical shape share a
//! single template record.
//!
//! On the wire a template is a head word followed by string record ids:
//!
//! ```text
//! head u32:
//!   bit 31      has primary type
//!   bit 30      has mixin types
//!   bit 29      zero child nodes
//!   bit 28      many child nodes
//!   bits 27..18 mixin count
//!   bits 17..0  property count
//! | primary id? | mixin ids* | child name id? | (prop name id, type byte)* |
//! ```
//!
//! The type byte carries the scalar type in the low bits and the
//! multi-valued flag in bit 7.

use crate::node::Type;

/// Property name whose value is folded into the template as the primary
/// type.
pub const PRIMARY_TYPE_NAME: &str = "primaryType";

/// Property name whose values are folded into the template as mixin types.
pub const MIXIN_TYPES_NAME: &str = "mixinTypes";

pub(crate) const HEAD_PRIMARY: u32 = 1 << 31;
pub(crate) const HEAD_MIXINS: u32 = 1 << 30;
pub(crate) const HEAD_ZERO_CHILDREN: u32 = 1 << 29;
pub(crate) const HEAD_MANY_CHILDREN: u32 = 1 << 28;
pub(crate) const MIXIN_COUNT_SHIFT: u32 = 18;
pub(crate) const MIXIN_COUNT_MAX: usize = (1 << 10) - 1;
pub(crate) const PROPERTY_COUNT_MAX: usize = (1 << 18) - 1;

/// The child-node shape of a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChildName {
    /// The node has no child nodes.
    Zero,
    /// The node has exactly one child node, with this name.
    One(String),
    /// The node has more than one child node; names live in the child map.
    Many,
}

/// One property slot of a template: name, scalar type and multiplicity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyTemplate {
    /// Property name.
    pub name: String,
    /// Scalar type of the property values.
    pub ty: Type,
    /// Whether the property holds a list of values.
    pub multiple: bool,
}

/// The deduplicated shape descriptor of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Template {
    /// Primary type, if the node has a `primaryType` property.
    pub primary_type: Option<String>,
    /// Mixin types from the `mixinTypes` property, sorted.
    pub mixin_types: Vec<String>,
    /// Child-node shape.
    pub child_name: ChildName,
    /// Property slots in name order, excluding the folded type properties.
    pub properties: Vec<PropertyTemplate>,
}

impl Template {
    /// Encodes the head word of this template.
    #[must_use]
    pub(crate) fn head(&self) -> u32 {
        let mut head = self.properties.len() as u32;
        head |= (self.mixin_types.len() as u32) << MIXIN_COUNT_SHIFT;
        if self.primary_type.is_some() {
            head |= HEAD_PRIMARY;
        }
        if !self.mixin_types.is_empty() {
            head |= HEAD_MIXINS;
        }
        match self.child_name {
            ChildName::Zero => head |= HEAD_ZERO_CHILDREN,
            ChildName::Many => head |= HEAD_MANY_CHILDREN,
            ChildName::One(_) => {}
        }
        head
    }

    /// Checks whether the node has a child map record.
    #[must_use]
    pub fn has_child_map(&self) -> bool {
        self.child_name == ChildName::Many
    }
}

/// Encodes the type byte for a property slot.
#[must_use]
pub(crate) fn encode_type(ty: Type, multiple: bool) -> u8 {
    let tag = match ty {
        Type::String => 1,
        Type::Long => 2,
        Type::Double => 3,
        Type::Boolean => 4,
        Type::Binary => 5,
    };
    if multiple {
        tag | 0x80
    } else {
        tag
    }
}

/// Decodes a property type byte into `(type, multiple)`.
pub(crate) fn decode_type(byte: u8) -> Option<(Type, bool)> {
    let ty = match byte & 0x7F {
        1 => Type::String,
        2 => Type::Long,
        3 => Type::Double,
        4 => Type::Boolean,
        5 => Type::Binary,
        _ => return None,
    };
    Some((ty, byte & 0x80 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_flags() {
        let template = Template {
            primary_type: Some("folder".to_string()),
            mixin_types: vec!["referenceable".to_string()],
            child_name: ChildName::Many,
            properties: vec![PropertyTemplate {
                name: "title".to_string(),
                ty: Type::String,
                multiple: false,
            }],
        };

        let head = template.head();
        assert!(head & HEAD_PRIMARY != 0);
        assert!(head & HEAD_MIXINS != 0);
        assert!(head & HEAD_MANY_CHILDREN != 0);
        assert_eq!(head & 0x3FFFF, 1);
        assert_eq!((head >> MIXIN_COUNT_SHIFT) & 0x3FF, 1);
    }

    #[test]
    fn zero_children_flag() {
        let template = Template {
            primary_type: None,
            mixin_types: Vec::new(),
            child_name: ChildName::Zero,
            properties: Vec::new(),
        };
        assert!(template.head() & HEAD_ZERO_CHILDREN != 0);
        assert!(!template.has_child_map());
    }

    #[test]
    fn type_byte_round_trip() {
        for ty in [Type::String, Type::Long, Type::Double, Type::Boolean, Type::Binary] {
            for multiple in [false, true] {
                assert_eq!(decode_type(encode_type(ty, multiple)), Some((ty, multiple)));
            }
        }
        assert_eq!(decode_type(0), None);
        assert_eq!(decode_type(9), None);
    }

    #[test]
    fn identical_shapes_are_equal() {
        let a = Template {
            primary_type: None,
            mixin_types: Vec::new(),
            child_name: ChildName::One("docs".to_string()),
            properties: vec![PropertyTemplate {
                name: "n".to_string(),
                ty: Type::Long,
                multiple: true,
            }],
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
