//! The tag/template data model: decoded symbol types, the tag
//! tree the resolver builds, and the structure definitions it's built
//! from.
//!
//! Grounded on `clx.py`'s `_parse_instance_attribute_list`/`_parse_template`
//! return shapes, recast as owned Rust structs rather than dynamically-typed
//! dicts. Arrays of child tags are kept as flat `Vec`s rather than an
//! arena-indexed tree, since a single-pass resolver build doesn't need
//! pointer-stable cross-references between nodes; see `DESIGN.md` for that
//! tradeoff.

use crate::codec::AtomicType;

/// The decoded form of a CIP symbol-type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SymbolType {
    /// `true` for a structured (template-backed) tag, `false` for atomic.
    pub structured: bool,
    /// Array dimension count, 0..=3, from bits 14-13.
    pub dimensions: u8,
    /// `true` if bit 12 (system tag) is set. System tags are filtered out
    /// of the resolved tree but the bit is kept here for completeness.
    pub system: bool,
    /// For structured tags: the template instance id (bits 11-0). For
    /// atomic tags: the raw 8-bit data-type code (bits 7-0 of the same
    /// field).
    pub raw_type_or_template: u16,
}

impl SymbolType {
    /// Decode a raw 16-bit symbol-type word.
    pub fn decode(word: u16) -> Self {
        SymbolType {
            structured: word & 0x8000 != 0,
            dimensions: ((word & 0x6000) >> 13) as u8,
            system: word & 0x1000 != 0,
            raw_type_or_template: word & 0x0FFF,
        }
    }

    /// The template instance id, if this is a structured symbol.
    pub fn template_id(self) -> Option<u16> {
        self.structured.then_some(self.raw_type_or_template)
    }

    /// The atomic data-type code, if this is an atomic symbol.
    pub fn atomic_code(self) -> Option<u8> {
        (!self.structured).then_some((self.raw_type_or_template & 0x00FF) as u8)
    }
}

/// Whether a tag's value is a single atomic CIP type or a structure
/// instance backed by a `Template`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TagType {
    /// A plain scalar value (or array of one).
    Atomic,
    /// A structure instance described by a cached `Template`.
    Struct,
}

/// One member record from a `Template`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TemplateMember {
    /// The member's name, from the template's NUL-separated name table.
    pub name: String,
    /// For a `BOOL` member: the bit index within the byte at `offset`.
    /// For any other member with `dimensions>0`: the array length. Zero
    /// otherwise. This field is overloaded depending on the member's type.
    pub info: u16,
    /// Atomic or struct.
    pub tag_type: TagType,
    /// Data-type code: an `AtomicType` code when `tag_type==Atomic`, or
    /// the nested template's instance id when `tag_type==Struct`.
    pub data_type: u16,
    /// Array dimension count for this member, 0..=3.
    pub dimensions: u8,
    /// Byte offset of this member within the containing struct instance.
    pub offset: u32,
}

/// A structure ("template") definition, fetched once per instance id and
/// memoized by the resolver for the lifetime of one tag-list build.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Template {
    /// The structure's name, the first string in its name table.
    pub name: String,
    /// Opaque handle returned by the Template Object's attribute 1.
    pub struct_handle: u16,
    /// Size in bytes of one instance of this structure.
    pub struct_size: u32,
    /// Size in 32-bit words of the Template Object's definition, used to
    /// derive the byte count for `read_template` requests and, for
    /// top-level array members, the element count
    /// (`obj_def_size / struct_size`).
    pub obj_def_size: u32,
    /// Declared member count; must match `members.len()`.
    pub member_cnt: u16,
    /// The member table, in declaration order.
    pub members: Vec<TemplateMember>,
}

/// A decoded tag value: either a resolved atomic value or a structure
/// instance whose members have themselves been decoded.
///
/// A tagged union over the atomic CIP types plus `Struct` and `Array`,
/// rather than a dynamically-typed dict-of-dicts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TagValue {
    /// A single atomic value.
    Atomic(crate::codec::AtomicValue),
    /// A structure instance: one decoded value per member, in the
    /// template's member order.
    Struct(Vec<TagValue>),
    /// A homogeneous array of values, one per index.
    Array(Vec<TagValue>),
}

/// A resolved tag node in the tree the resolver builds. The root tags returned by
/// `get_tag_list`/`get_tag_struct` and every synthetic array-index or
/// struct-member child share this shape.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tag {
    /// The tag's own name component (not prefix-joined).
    pub tag_name: String,
    /// Fully qualified name, prefix-joined step 8
    /// (`Name[0].Field`, not `Name.[0].Field`).
    pub full_name: String,
    /// Symbol-object instance id this tag was enumerated under. `None`
    /// for synthetic children (array elements, struct members) that were
    /// never themselves symbol-table entries.
    pub instance_id: Option<u32>,
    /// The raw decoded symbol-type word, if this tag came from the
    /// symbol table directly.
    pub symbol_type: Option<SymbolType>,
    /// Atomic or struct.
    pub tag_type: TagType,
    /// Atomic data-type code, or the backing template's instance id for
    /// struct tags.
    pub data_type: u16,
    /// Array dimension count, 0 for a scalar.
    pub dimensions: u8,
    /// Element count for array tags (`dimensions>0`); 0 otherwise.
    pub length: u32,
    /// The backing template's cached member list, deep-copied in for
    /// struct tags step 2.
    pub members: Option<Vec<TemplateMember>>,
    /// Cached `get_tag_struct` attributes for struct tags: `struct_size`
    /// and `obj_def_size`, needed to derive nested array lengths.
    pub attrs: Option<(u32, u32)>,
    /// The decoded value, once read.
    pub value: Option<TagValue>,
    /// Byte offset within a containing struct, for tags that are
    /// themselves struct members rather than root tags.
    pub offset: Option<u32>,
    /// `BOOL` bit index or non-BOOL array length, carried down from the
    /// originating `TemplateMember::info` for member-derived tags.
    pub info: Option<u16>,
}

impl Tag {
    /// `true` if this tag's symbol type marks it a system tag.
    pub fn is_system(&self) -> bool {
        self.symbol_type.map(|s| s.system).unwrap_or(false)
    }

    /// `true` if this tag should be excluded from the user-visible tree:
    /// a system tag, a name starting with `__`, or a name containing
    /// `:`.
    pub fn is_hidden(&self) -> bool {
        self.is_system() || self.tag_name.starts_with("__") || self.tag_name.contains(':')
    }

    /// Resolve this tag's atomic type, if it is atomic.
    pub fn atomic_type(&self) -> Option<AtomicType> {
        (self.tag_type == TagType::Atomic).then(|| AtomicType::from_code(self.data_type)).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_type_decodes_struct_with_array() {
        // 0x8B50: structured, dims=(0x8B50&0x6000)>>13=1, template=0x0B50
        let st = SymbolType::decode(0x8B50);
        assert!(st.structured);
        assert_eq!(st.dimensions, 1);
        assert!(!st.system);
        assert_eq!(st.template_id(), Some(0x0B50));
    }

    #[test]
    fn symbol_type_decodes_atomic_dint() {
        let st = SymbolType::decode(0x00C4);
        assert!(!st.structured);
        assert_eq!(st.dimensions, 0);
        assert_eq!(st.atomic_code(), Some(0xC4));
    }

    #[test]
    fn symbol_type_flags_system_tag() {
        let st = SymbolType::decode(0x1003);
        assert!(st.system);
    }

    #[test]
    fn hidden_tags_are_filtered() {
        let mut tag = sample_tag("Normal");
        assert!(!tag.is_hidden());
        tag.tag_name = "__Internal".into();
        assert!(tag.is_hidden());
        tag.tag_name = "Module:1:I".into();
        assert!(tag.is_hidden());
    }

    fn sample_tag(name: &str) -> Tag {
        Tag {
            tag_name: name.to_string(),
            full_name: name.to_string(),
            instance_id: Some(1),
            symbol_type: Some(SymbolType::decode(0x00C4)),
            tag_type: TagType::Atomic,
            data_type: 0xC4,
            dimensions: 0,
            length: 0,
            members: None,
            attrs: None,
            value: None,
            offset: None,
            info: None,
        }
    }
}
