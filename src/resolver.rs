//! Metadata resolver (C5): walk the controller's symbol object list,
//! fetch structure ("template") definitions, and materialize a flat tag
//! list with array lengths probed and struct members expanded.
//!
//! Request/reply layouts are grounded on `clx.py::get_tag_list`,
//! `get_tag_struct`, `read_template`, and their `_parse_*` counterparts.
//! Unlike the source's recursive dict-of-dicts built with `deepcopy`, every node
//! (root tag, array element, struct member) is pushed as its own `Tag`
//! into one flat `Vec`, addressed by its dotted/bracketed `full_name`,
//! matching `model::Tag`'s flat shape (see that module's doc comment for
//! why an arena wasn't needed here).

use std::collections::HashMap;

use log::{trace, warn};

use crate::codec;
use crate::codec::AtomicType;
use crate::error::CipError;
use crate::model::{SymbolType, Tag, TagType, TagValue, Template, TemplateMember};
use crate::service;
use crate::session::{self, service_code, Session, GENERAL_STATUS_MORE_DATA, GENERAL_STATUS_SUCCESS};
use crate::transport::Transport;

const SYMBOL_OBJECT_CLASS: u8 = 0x6B;
const TEMPLATE_OBJECT_CLASS: u8 = 0x6C;

/// One raw entry from the symbol object list, before hiding/filtering.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    /// Symbol object instance id.
    pub instance_id: u32,
    /// Tag name as stored in the symbol table.
    pub tag_name: String,
    /// Raw, undecoded symbol-type word.
    pub symbol_type: u16,
}

/// Enumerate every entry in the controller's symbol object list
/// (`get_tag_list`), paging with `Get Instance Attribute List` until
/// the peer reports success. The 16-bit instance slot in the request
/// path is the paging cursor (`last_instance`, 0 meaning "start of
/// list"); the requested attribute ids are `[1, 2]` (symbol name, symbol
/// type).
pub fn get_tag_list<T: Transport>(session: &mut Session<T>) -> Result<Vec<SymbolEntry>, CipError> {
    service::ensure_connected(session, "get_tag_list")?;
    let mut entries = Vec::new();
    let mut last_instance: u32 = 0;
    loop {
        let mut msg = Vec::new();
        msg.push(service_code::GET_INSTANCE_ATTRIBUTE_LIST);
        msg.push(3);
        msg.extend_from_slice(&session::class_instance16_path(
            SYMBOL_OBJECT_CLASS,
            last_instance.min(u16::MAX as u32) as u16,
        ));
        msg.extend_from_slice(&codec::pack_u16(2));
        msg.extend_from_slice(&codec::pack_u16(1));
        msg.extend_from_slice(&codec::pack_u16(2));

        let reply = session.send_unit_data(&msg)?;
        let mut data = &reply.data[..];
        let mut last_seen_instance = last_instance;
        while !data.is_empty() {
            if data.len() < 6 {
                return Err(CipError::Resolver("tag list entry truncated".into()));
            }
            let instance = codec::unpack_u32(&data[0..4]);
            let name_len = codec::unpack_u16(&data[4..6]) as usize;
            let name_start = 6;
            let name_end = name_start + name_len;
            let name_bytes = data
                .get(name_start..name_end)
                .ok_or_else(|| CipError::Resolver("tag list name truncated".into()))?;
            let tag_name = String::from_utf8_lossy(name_bytes).into_owned();
            let type_start = name_end;
            let type_end = type_start + 2;
            let symbol_type = codec::unpack_u16(
                data.get(type_start..type_end)
                    .ok_or_else(|| CipError::Resolver("tag list symbol type truncated".into()))?,
            );
            entries.push(SymbolEntry {
                instance_id: instance,
                tag_name,
                symbol_type,
            });
            last_seen_instance = instance;
            data = &data[type_end..];
        }

        match reply.status {
            GENERAL_STATUS_SUCCESS => break,
            GENERAL_STATUS_MORE_DATA => last_instance = last_seen_instance + 1,
            other => {
                return Err(CipError::CipService {
                    service: reply.service,
                    status: other,
                    extended: None,
                })
            }
        }
    }
    trace!("get_tag_list: {} entries", entries.len());
    Ok(entries)
}

/// Cached attribute set for one template instance, from `get_tag_struct`:
/// object definition size (32-bit words), structure size (bytes), member
/// count, and structure handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateAttrs {
    /// Attribute 4: object definition size, in 32-bit words.
    pub obj_def_size: u32,
    /// Attribute 5: structure size, in bytes.
    pub struct_size: u32,
    /// Attribute 2: member count.
    pub member_cnt: u16,
    /// Attribute 1: structure handle.
    pub struct_handle: u16,
}

/// Fetch a template's attribute set via `Get Attribute List` on the
/// Template Object. Each requested attribute is prefixed by
/// `attr_id u16 | status u16`; attributes with non-zero status carry no
/// value and are left unset.
pub fn get_tag_struct<T: Transport>(session: &mut Session<T>, template_id: u16) -> Result<TemplateAttrs, CipError> {
    service::ensure_connected(session, "get_tag_struct")?;
    let mut msg = Vec::new();
    msg.push(service_code::GET_ATTRIBUTE_LIST);
    msg.push(3);
    msg.extend_from_slice(&session::class_instance16_path(TEMPLATE_OBJECT_CLASS, template_id));
    msg.extend_from_slice(&codec::pack_u16(4));
    msg.extend_from_slice(&codec::pack_u16(4)); // object definition size
    msg.extend_from_slice(&codec::pack_u16(5)); // structure size
    msg.extend_from_slice(&codec::pack_u16(2)); // member count
    msg.extend_from_slice(&codec::pack_u16(1)); // structure handle

    let reply = session.send_unit_data(&msg)?;
    let data = &reply.data[..];
    if data.len() < 2 {
        return Err(CipError::Resolver("get_tag_struct reply missing attribute count".into()));
    }
    let count = codec::unpack_u16(&data[0..2]) as usize;
    let mut pos = 2;
    let mut obj_def_size = 0u32;
    let mut struct_size = 0u32;
    let mut member_cnt = 0u16;
    let mut struct_handle = 0u16;
    for _ in 0..count {
        let attr_id = codec::unpack_u16(data.get(pos..pos + 2).ok_or_else(attr_truncated)?);
        let status = codec::unpack_u16(data.get(pos + 2..pos + 4).ok_or_else(attr_truncated)?);
        pos += 4;
        if status != 0 {
            warn!("get_tag_struct: attribute {attr_id} failed, status 0x{status:04x}");
            continue;
        }
        match attr_id {
            4 => {
                obj_def_size = codec::unpack_u32(data.get(pos..pos + 4).ok_or_else(attr_truncated)?);
                pos += 4;
            }
            5 => {
                struct_size = codec::unpack_u32(data.get(pos..pos + 4).ok_or_else(attr_truncated)?);
                pos += 4;
            }
            2 => {
                member_cnt = codec::unpack_u16(data.get(pos..pos + 2).ok_or_else(attr_truncated)?);
                pos += 2;
            }
            1 => {
                struct_handle = codec::unpack_u16(data.get(pos..pos + 2).ok_or_else(attr_truncated)?);
                pos += 2;
            }
            other => return Err(CipError::Resolver(format!("unexpected attribute id {other} in get_tag_struct reply"))),
        }
    }
    Ok(TemplateAttrs {
        obj_def_size,
        struct_size,
        member_cnt,
        struct_handle,
    })
}

fn attr_truncated() -> CipError {
    CipError::Resolver("get_tag_struct attribute value truncated".into())
}

/// Fetch and parse a template's member table and name table. `byte_count`
/// is `obj_def_size*4 - 21`: the Template Object's definition size, in
/// bytes, minus the fixed 21-byte prefix the controller never returns.
pub fn read_template<T: Transport>(
    session: &mut Session<T>,
    template_id: u16,
    byte_count: u32,
    member_count: u16,
) -> Result<(String, Vec<TemplateMember>), CipError> {
    service::ensure_connected(session, "read_template")?;
    let mut buffer = Vec::new();
    let mut offset: u32 = 0;
    loop {
        let mut msg = Vec::new();
        msg.push(service_code::READ_TAG); // Read Template shares the Read Tag service code (0x4C)
        msg.push(3);
        msg.extend_from_slice(&session::class_instance16_path(TEMPLATE_OBJECT_CLASS, template_id));
        msg.extend_from_slice(&codec::pack_u32(offset));
        msg.extend_from_slice(&codec::pack_u16((byte_count.saturating_sub(offset)) as u16));

        let reply = session.send_unit_data(&msg)?;
        buffer.extend_from_slice(&reply.data);
        match reply.status {
            GENERAL_STATUS_SUCCESS => break,
            GENERAL_STATUS_MORE_DATA => offset += reply.data.len() as u32,
            other => {
                return Err(CipError::CipService {
                    service: reply.service,
                    status: other,
                    extended: None,
                })
            }
        }
    }
    parse_template_buffer(&buffer, member_count)
}

fn parse_template_buffer(buffer: &[u8], member_count: u16) -> Result<(String, Vec<TemplateMember>), CipError> {
    let mut idx = 0usize;
    let mut members = Vec::with_capacity(member_count as usize);
    for _ in 0..member_count {
        let info = codec::unpack_u16(buffer.get(idx..idx + 2).ok_or_else(member_truncated)?);
        idx += 2;
        let raw_symbol_type = codec::unpack_u16(buffer.get(idx..idx + 2).ok_or_else(member_truncated)?);
        idx += 2;
        let offset = codec::unpack_u32(buffer.get(idx..idx + 4).ok_or_else(member_truncated)?);
        idx += 4;
        let st = SymbolType::decode(raw_symbol_type);
        let (tag_type, data_type) = if st.structured {
            (TagType::Struct, st.raw_type_or_template)
        } else {
            (TagType::Atomic, st.atomic_code().unwrap_or(0) as u16)
        };
        members.push(TemplateMember {
            name: String::new(),
            info,
            tag_type,
            data_type,
            dimensions: st.dimensions,
            offset,
        });
    }

    let name_table = buffer.get(idx..).unwrap_or(&[]);
    let raw = std::str::from_utf8(name_table).map_err(|e| CipError::Resolver(format!("template name table not utf-8: {e}")))?;
    let mut names: Vec<&str> = raw.split('\0').collect();
    // The table ends with a trailing NUL, which produces one extra empty
    // element after the final split; drop it before the length check.
    if names.last() == Some(&"") {
        names.pop();
    }
    if names.len() != member_count as usize + 1 {
        return Err(CipError::Resolver(format!(
            "template name table mismatch: expected {} names, got {}",
            member_count as usize + 1,
            names.len()
        )));
    }
    let struct_name = names[0].to_string();
    for (member, name) in members.iter_mut().zip(&names[1..]) {
        member.name = name.to_string();
    }
    Ok((struct_name, members))
}

fn member_truncated() -> CipError {
    CipError::Resolver("template member record truncated".into())
}

/// Probe an array tag's element count by exponential-then-binary search
/// over `read_array`: double `k` until the peer rejects, then bisect to
/// the exact boundary.
pub fn probe_array_length<T: Transport>(session: &mut Session<T>, name: &str) -> Result<u32, CipError> {
    let mut lower: u32 = 0;
    let mut k: u32 = 100;
    loop {
        match service::read_array(session, name, k.min(u16::MAX as u32) as u16) {
            Ok(_) => {
                lower = k;
                if k > u32::MAX / 2 {
                    return Err(CipError::Resolver(format!(
                        "array length probe for '{name}' exceeded the overflow guard"
                    )));
                }
                k *= 2;
            }
            Err(_) => break,
        }
    }
    let mut upper = k;
    while upper - lower > 1 {
        let mid = lower + (upper - lower) / 2;
        match service::read_array(session, name, mid.min(u16::MAX as u32) as u16) {
            Ok(_) => lower = mid,
            Err(_) => upper = mid,
        }
    }
    Ok(lower)
}

/// Template cache, scoped to one resolver pass.
#[derive(Default)]
pub struct TemplateCache {
    templates: HashMap<u16, Template>,
}

impl TemplateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        TemplateCache::default()
    }

    /// Fetch a template by instance id, using the cached copy if already
    /// fetched this pass.
    pub fn get_or_fetch<T: Transport>(&mut self, session: &mut Session<T>, template_id: u16) -> Result<&Template, CipError> {
        if !self.templates.contains_key(&template_id) {
            let attrs = get_tag_struct(session, template_id)?;
            let byte_count = attrs.obj_def_size.saturating_mul(4).saturating_sub(21);
            let (name, members) = read_template(session, template_id, byte_count, attrs.member_cnt)?;
            self.templates.insert(
                template_id,
                Template {
                    name,
                    struct_handle: attrs.struct_handle,
                    struct_size: attrs.struct_size,
                    obj_def_size: attrs.obj_def_size,
                    member_cnt: attrs.member_cnt,
                    members,
                },
            );
        }
        Ok(self.templates.get(&template_id).expect("just inserted"))
    }

    /// Snapshot the cache for use by `decode_struct_value`, which needs
    /// to look up nested templates by id without borrowing a `Session`.
    pub fn snapshot(&self) -> HashMap<u16, Template> {
        self.templates.clone()
    }
}

/// Whether a raw symbol/tag name should be excluded from the resolved
/// tree.
fn is_hidden_name(name: &str, system: bool) -> bool {
    system || name.starts_with("__") || name.contains(':')
}

fn empty_tag(tag_name: String, full_name: String) -> Tag {
    Tag {
        tag_name,
        full_name,
        instance_id: None,
        symbol_type: None,
        tag_type: TagType::Atomic,
        data_type: 0,
        dimensions: 0,
        length: 0,
        members: None,
        attrs: None,
        value: None,
        offset: None,
        info: None,
    }
}

/// Build the resolved, flat tag list for every root tag in
/// `get_tag_list`. Structs are expanded via the template cache;
/// top-level arrays have their length probed; nested arrays derive their
/// length from the containing template's attributes. Every synthesized
/// array element or struct member is appended to the result alongside
/// its root, addressed by its full dotted/bracketed name.
pub fn build_tag_tree<T: Transport>(session: &mut Session<T>, cache: &mut TemplateCache) -> Result<Vec<Tag>, CipError> {
    let entries = get_tag_list(session)?;
    let mut tags = Vec::new();
    for entry in entries {
        let st = SymbolType::decode(entry.symbol_type);
        if is_hidden_name(&entry.tag_name, st.system) {
            continue;
        }
        materialize_root_tag(session, cache, &entry, st, &mut tags)?;
    }
    Ok(tags)
}

fn materialize_root_tag<T: Transport>(
    session: &mut Session<T>,
    cache: &mut TemplateCache,
    entry: &SymbolEntry,
    st: SymbolType,
    out: &mut Vec<Tag>,
) -> Result<(), CipError> {
    let mut tag = empty_tag(entry.tag_name.clone(), entry.tag_name.clone());
    tag.instance_id = Some(entry.instance_id);
    tag.symbol_type = Some(st);
    tag.tag_type = if st.structured { TagType::Struct } else { TagType::Atomic };
    tag.data_type = if st.structured {
        st.raw_type_or_template
    } else {
        st.atomic_code().unwrap_or(0) as u16
    };
    tag.dimensions = st.dimensions;

    if st.structured {
        let template = cache.get_or_fetch(session, st.raw_type_or_template)?.clone();
        tag.members = Some(template.members.clone());
        tag.attrs = Some((template.struct_size, template.obj_def_size));
    }

    let full_name = tag.full_name.clone();
    let members = tag.members.clone();
    let tag_type = tag.tag_type;
    let data_type = tag.data_type;
    out.push(tag);

    if st.dimensions > 0 {
        let length = probe_array_length(session, &entry.tag_name)?;
        out.last_mut().unwrap().length = length;
        for i in 0..length {
            expand_element(session, cache, &format!("{full_name}[{i}]"), tag_type, data_type, members.clone(), out)?;
        }
    } else if st.structured {
        expand_struct_members(session, cache, &full_name, &members.unwrap_or_default(), out)?;
    }

    Ok(())
}

/// Expand one array element.
fn expand_element<T: Transport>(
    session: &mut Session<T>,
    cache: &mut TemplateCache,
    full_name: &str,
    tag_type: TagType,
    data_type: u16,
    members: Option<Vec<TemplateMember>>,
    out: &mut Vec<Tag>,
) -> Result<(), CipError> {
    let tag_name = full_name.rsplit('.').next().unwrap_or(full_name).to_string();
    let mut tag = empty_tag(tag_name, full_name.to_string());
    tag.tag_type = tag_type;
    tag.data_type = data_type;
    tag.members = members.clone();
    out.push(tag);
    if tag_type == TagType::Struct {
        expand_struct_members(session, cache, full_name, &members.unwrap_or_default(), out)?;
    }
    Ok(())
}

/// Recursively expand a struct tag's members, turning struct-typed
/// members into nested child tags via the template cache, and deriving
/// nested array lengths from the containing template's
/// `obj_def_size/struct_size` ratio.
fn expand_struct_members<T: Transport>(
    session: &mut Session<T>,
    cache: &mut TemplateCache,
    parent_full_name: &str,
    members: &[TemplateMember],
    out: &mut Vec<Tag>,
) -> Result<(), CipError> {
    for member in members {
        let full_name = format!("{parent_full_name}.{}", member.name);
        if member.tag_type == TagType::Struct {
            let nested = cache.get_or_fetch(session, member.data_type)?.clone();
            if member.dimensions > 0 {
                let element_count = if nested.struct_size > 0 {
                    nested.obj_def_size * 4 / nested.struct_size
                } else {
                    0
                };
                for i in 0..element_count {
                    let element_name = format!("{full_name}[{i}]");
                    let mut child = empty_tag(format!("{}[{i}]", member.name), element_name.clone());
                    child.tag_type = TagType::Struct;
                    child.data_type = member.data_type;
                    child.members = Some(nested.members.clone());
                    child.attrs = Some((nested.struct_size, nested.obj_def_size));
                    child.offset = Some(member.offset);
                    out.push(child);
                    expand_struct_members(session, cache, &element_name, &nested.members, out)?;
                }
            } else {
                let mut child = empty_tag(member.name.clone(), full_name.clone());
                child.tag_type = TagType::Struct;
                child.data_type = member.data_type;
                child.members = Some(nested.members.clone());
                child.attrs = Some((nested.struct_size, nested.obj_def_size));
                child.offset = Some(member.offset);
                out.push(child);
                expand_struct_members(session, cache, &full_name, &nested.members, out)?;
            }
        } else if member.dimensions > 1 {
            // Arrays of arrays: unsupported, logged and skipped.
            warn!("skipping unsupported nested array-of-array member '{}' on '{parent_full_name}'", member.name);
        } else {
            let mut child = empty_tag(member.name.clone(), full_name);
            child.tag_type = TagType::Atomic;
            child.data_type = member.data_type;
            child.dimensions = member.dimensions;
            child.length = if member.dimensions > 0 { member.info as u32 } else { 0 };
            child.offset = Some(member.offset);
            child.info = Some(member.info);
            out.push(child);
        }
    }
    Ok(())
}

/// Decode one struct instance's raw bytes into per-member values. `BOOL`
/// members read their bit index from `member.info`; struct-typed members
/// recurse using their own `Template`.
pub fn decode_struct_value(buf: &[u8], members: &[TemplateMember], templates: &HashMap<u16, Template>) -> Result<Vec<TagValue>, CipError> {
    let mut values = Vec::with_capacity(members.len());
    for member in members {
        if member.dimensions == 0 {
            let size = if member.tag_type == TagType::Struct {
                templates.get(&member.data_type).map(|t| t.struct_size as usize).unwrap_or(0)
            } else {
                AtomicType::from_code(member.data_type).map(|t| t.size()).unwrap_or(1)
            };
            let slice = buf
                .get(member.offset as usize..member.offset as usize + size)
                .ok_or_else(|| CipError::Resolver(format!("struct member '{}' out of bounds", member.name)))?;
            if member.tag_type == TagType::Struct {
                let nested = templates
                    .get(&member.data_type)
                    .ok_or_else(|| CipError::Resolver(format!("template {} not cached", member.data_type)))?;
                values.push(TagValue::Struct(decode_struct_value(slice, &nested.members, templates)?));
            } else if AtomicType::from_code(member.data_type) == Some(AtomicType::Bool) {
                let bit = (slice[0] >> (member.info & 0x7)) & 1;
                values.push(TagValue::Atomic(codec::AtomicValue::Bool(bit != 0)));
            } else {
                let ty = AtomicType::from_code(member.data_type).ok_or(crate::error::CodecError::UnknownDataType(member.data_type))?;
                values.push(TagValue::Atomic(codec::unpack(ty, slice)?));
            }
        } else if member.tag_type == TagType::Struct {
            let nested = templates
                .get(&member.data_type)
                .ok_or_else(|| CipError::Resolver(format!("template {} not cached", member.data_type)))?;
            let count = member.info as usize;
            let mut elements = Vec::with_capacity(count);
            for i in 0..count {
                let start = member.offset as usize + i * nested.struct_size as usize;
                let end = start + nested.struct_size as usize;
                let slice = buf
                    .get(start..end)
                    .ok_or_else(|| CipError::Resolver(format!("struct array member '{}' out of bounds", member.name)))?;
                elements.push(TagValue::Struct(decode_struct_value(slice, &nested.members, templates)?));
            }
            values.push(TagValue::Array(elements));
        } else {
            warn!("skipping unsupported nested array-of-array member '{}'", member.name);
            values.push(TagValue::Array(Vec::new()));
        }
    }
    Ok(values)
}
