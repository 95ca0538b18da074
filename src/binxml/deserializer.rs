use crate::ChunkOffset;
use crate::binxml::name::BinXmlName;
use crate::binxml::value_variant::{BinXmlValue, BinXmlValueType, read_guid};
use crate::err::{DeserializationError, DeserializationResult as Result};
use crate::evtx_chunk::EvtxChunk;
use crate::evtx_parser::Strictness;
use crate::model::deserialized::{
    BXmlNode, BinXMLAttribute, BinXMLFragmentHeader, BinXMLOpenStartElement, BinXmlFragment,
    BinXmlTemplateDefinitionHeader, BinXmlTemplateInstance, BinXmlTemplateNode, NodeArena,
    NodeId, NodeKind, RootNode, SubstitutionValue, TemplateDefinition, TemplatePlaceholder,
    TemplateSubstitutionDescriptor,
};
use crate::model::raw::{AttributeTokenMeta, BinXMLRawToken, OpenStartElementTokenMeta};
use crate::utils::ByteCursor;

use log::{trace, warn};
use std::mem;

/// Decodes the BXML fragment of a record.
///
/// `offset` and `len` delimit the fragment inside the chunk; nothing outside that range is read
/// except names and shared templates, which are resolved through the chunk caches.
pub(crate) fn read_fragment(
    chunk: &EvtxChunk<'_>,
    offset: ChunkOffset,
    len: u32,
) -> Result<BinXmlFragment> {
    let mut cursor =
        ByteCursor::with_pos(chunk.data, 0)?.sub_range(offset as usize, len as usize, "record data")?;

    let mut deserializer = BinXmlDeserializer::new(chunk);
    let root = deserializer.read_root(&mut cursor, chunk.settings.get_max_depth())?;

    Ok(BinXmlFragment {
        arena: deserializer.arena,
        root,
    })
}

/// Decodes the non-resident template definition stored at `offset`.
///
/// The result is shared by every record of the chunk, so it never sees any record's
/// substitution values. It gets a depth budget of its own, less the level taken by the
/// fragment root that instantiates it, so that a definition decoded here also fits when a
/// record expands it.
pub(crate) fn read_template_definition(
    chunk: &EvtxChunk<'_>,
    offset: ChunkOffset,
) -> Result<TemplateDefinition> {
    let mut cursor = ByteCursor::with_pos(chunk.data, offset as usize)?;

    let mut deserializer = BinXmlDeserializer::new(chunk);
    deserializer.inside_definition = true;
    let depth = chunk.settings.get_max_depth().saturating_sub(1);
    let (root, template) = deserializer.read_template(&mut cursor, depth)?;

    Ok(TemplateDefinition {
        offset,
        arena: deserializer.arena,
        root,
        header: template.header,
        placeholders: template.placeholders,
    })
}

/// Recursive-descent decoder building one arena-owned tree.
///
/// Every recursion level (fragment root, template, element) consumes one unit of the depth
/// budget; running out fails with `DepthExceeded`.
struct BinXmlDeserializer<'c> {
    chunk: &'c EvtxChunk<'c>,
    arena: NodeArena,
    /// Substitution placeholders are only valid directly inside a template body.
    in_template: bool,
    /// Set while decoding a template definition and anything nested in it.
    inside_definition: bool,
    /// Placeholders of the template body currently being decoded, in document order.
    placeholders: Vec<TemplatePlaceholder>,
}

impl<'c> BinXmlDeserializer<'c> {
    fn new(chunk: &'c EvtxChunk<'c>) -> Self {
        BinXmlDeserializer {
            chunk,
            arena: NodeArena::new(),
            in_template: false,
            inside_definition: false,
            placeholders: Vec::new(),
        }
    }

    fn alloc(&mut self, start: usize, end: usize, kind: NodeKind, children: Vec<NodeId>) -> NodeId {
        self.arena.alloc(BXmlNode {
            offset: start as ChunkOffset,
            length: (end - start) as u32,
            kind,
            children,
        })
    }

    fn descend(&self, depth: u32, kind: &'static str, offset: u64) -> Result<u32> {
        depth
            .checked_sub(1)
            .ok_or_else(|| DeserializationError::DepthExceeded {
                kind,
                offset,
                limit: self.chunk.settings.get_max_depth(),
            })
    }

    fn read_name(&self, cursor: &mut ByteCursor<'_>) -> Result<BinXmlName> {
        BinXmlName::from_binxml_cursor(cursor, self.chunk.data, &self.chunk.string_cache)
    }

    /// Reads one node (and everything below it), returning its id and the token it was read
    /// from so that the enclosing sequence can check what is allowed where.
    fn read_node(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: u32,
    ) -> Result<(NodeId, BinXMLRawToken)> {
        let start = cursor.pos();
        let tag = cursor.peek_u8("binxml token")?;
        let token = BinXMLRawToken::from_u8(tag).ok_or(DeserializationError::UnknownNodeType {
            value: tag,
            offset: cursor.position(),
        })?;
        cursor.advance(1, "binxml token")?;

        trace!("Offset `0x{:08x} ({})`: {:?}", start, start, token);

        let (kind, children) = match token {
            BinXMLRawToken::EndOfStream => (NodeKind::EndOfStream, vec![]),
            BinXMLRawToken::StartOfStream => {
                let major_version = cursor.u8_named("fragment major version")?;
                let minor_version = cursor.u8_named("fragment minor version")?;
                let flags = cursor.u8_named("fragment flags")?;
                (
                    NodeKind::StreamStart(BinXMLFragmentHeader {
                        major_version,
                        minor_version,
                        flags,
                    }),
                    vec![],
                )
            }
            BinXMLRawToken::OpenStartElement(meta) => {
                return Ok((self.read_element(cursor, start, meta, depth)?, token));
            }
            BinXMLRawToken::CloseStartElement => (NodeKind::CloseStartElement, vec![]),
            BinXMLRawToken::CloseEmptyElement => (NodeKind::CloseEmptyElement, vec![]),
            BinXMLRawToken::CloseElement => (NodeKind::CloseElement, vec![]),
            BinXMLRawToken::Value => self.read_value(cursor, depth)?,
            BinXMLRawToken::Attribute(meta) => self.read_attribute(cursor, start, meta, depth)?,
            BinXMLRawToken::CDataSection => (
                NodeKind::CDataSection(cursor.len_prefixed_utf16_string(false, "cdata")?),
                vec![],
            ),
            BinXMLRawToken::CharReference => (
                NodeKind::CharacterReference(cursor.u16_named("character reference")?),
                vec![],
            ),
            BinXMLRawToken::EntityReference => {
                (NodeKind::EntityReference(self.read_name(cursor)?), vec![])
            }
            BinXMLRawToken::ProcessingInstructionTarget => (
                NodeKind::ProcessingInstructionTarget(self.read_name(cursor)?),
                vec![],
            ),
            BinXMLRawToken::ProcessingInstructionData => (
                NodeKind::ProcessingInstructionData(
                    cursor.len_prefixed_utf16_string(false, "processing instruction data")?,
                ),
                vec![],
            ),
            BinXMLRawToken::TemplateInstance => {
                self.read_template_instance(cursor, start, depth)?
            }
            BinXMLRawToken::NormalSubstitution | BinXMLRawToken::ConditionalSubstitution => {
                let optional = token == BinXMLRawToken::ConditionalSubstitution;
                let descriptor = self.read_substitution_descriptor(cursor, start, optional)?;
                let kind = if optional {
                    NodeKind::ConditionalSubstitution(descriptor)
                } else {
                    NodeKind::NormalSubstitution(descriptor)
                };

                let id = self.alloc(start, cursor.pos(), kind, vec![]);
                self.placeholders
                    .push(TemplatePlaceholder { node: id, descriptor });
                return Ok((id, token));
            }
        };

        Ok((self.alloc(start, cursor.pos(), kind, children), token))
    }

    /// Decodes an independently rooted fragment: a node sequence that ends with `EndOfStream`
    /// or right after a template instance, in which case the fragment's substitution array
    /// follows.
    fn read_root(&mut self, cursor: &mut ByteCursor<'c>, depth: u32) -> Result<NodeId> {
        let start = cursor.pos();
        let depth = self.descend(depth, "RootNode", cursor.position())?;

        // A nested fragment binds its own substitution array, never the enclosing template's.
        let was_in_template = mem::replace(&mut self.in_template, false);
        let result = self.read_root_sequence(cursor, start, depth);
        self.in_template = was_in_template;
        result
    }

    fn read_root_sequence(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        start: usize,
        depth: u32,
    ) -> Result<NodeId> {
        let mut children = vec![];
        let mut instantiates_template = false;

        loop {
            let child_offset = cursor.position();
            let (child, token) = self.read_node(cursor, depth)?;
            children.push(child);

            match token {
                BinXMLRawToken::EndOfStream => break,
                BinXMLRawToken::TemplateInstance => {
                    instantiates_template = true;
                    break;
                }
                other => check_top_level_token("RootNode", other, child_offset)?,
            }
        }

        let substitutions = if instantiates_template {
            self.read_substitution_array(cursor, depth)?
        } else {
            vec![]
        };

        Ok(self.alloc(
            start,
            cursor.pos(),
            NodeKind::Root(RootNode { substitutions }),
            children,
        ))
    }

    fn read_element(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        start: usize,
        meta: OpenStartElementTokenMeta,
        depth: u32,
    ) -> Result<NodeId> {
        const KIND: &str = "OpenStartElementNode";

        let offset = start as u64;
        let depth = self.descend(depth, KIND, offset)?;

        let dependency_id = cursor.u16_named("element dependency id")?;
        let data_size = cursor.u32_named("element data size")?;
        let declared_end = cursor.pos() + data_size as usize;
        if declared_end > cursor.bound() {
            return Err(DeserializationError::mismatch(
                KIND,
                offset,
                format!(
                    "element declares {} bytes of data but only {} remain",
                    data_size,
                    cursor.remaining()
                ),
            ));
        }

        let name = self.read_name(cursor)?;
        let attribute_list_size = if meta.has_attributes {
            Some(cursor.u32_named("attribute list size")?)
        } else {
            None
        };
        let attributes_start = cursor.pos();

        trace!("\t element `{}` declares {} bytes", name, data_size);

        let mut children = vec![];
        let mut in_content = false;

        loop {
            let child_offset = cursor.position();
            let (child, token) = self.read_node(cursor, depth)?;
            children.push(child);

            let fail = |message: &str| {
                Err(DeserializationError::mismatch(
                    KIND,
                    child_offset,
                    format!("element `{}`: {}", name, message),
                ))
            };

            match token {
                BinXMLRawToken::Attribute(_) if in_content => {
                    return fail("attribute after the start tag was closed");
                }
                BinXMLRawToken::Attribute(_) => {}
                BinXMLRawToken::CloseStartElement | BinXMLRawToken::CloseEmptyElement
                    if in_content =>
                {
                    return fail("start tag closed twice");
                }
                BinXMLRawToken::CloseStartElement | BinXMLRawToken::CloseEmptyElement => {
                    if let Some(declared) = attribute_list_size {
                        let used = child_offset as usize - attributes_start;
                        if used != declared as usize {
                            self.chunk.settings.size_disagreement(
                                KIND,
                                child_offset,
                                format!(
                                    "attribute list of `{}` uses {} bytes but declares {}",
                                    name, used, declared
                                ),
                            )?;
                        }
                    }

                    if token == BinXMLRawToken::CloseEmptyElement {
                        break;
                    }
                    in_content = true;
                }
                BinXMLRawToken::CloseElement if !in_content => {
                    return fail("end tag before the start tag was closed");
                }
                BinXMLRawToken::CloseElement => break,
                BinXMLRawToken::EndOfStream => return fail("stream ended inside the element"),
                BinXMLRawToken::TemplateInstance | BinXMLRawToken::StartOfStream => {
                    return fail(&format!("unexpected `{}`", token.node_name()));
                }
                _ if !in_content => return fail("content before the start tag was closed"),
                _ => {}
            }
        }

        if cursor.pos() != declared_end {
            self.chunk.settings.size_disagreement(
                KIND,
                offset,
                format!(
                    "element `{}` used {} bytes but declares {}",
                    name,
                    cursor.pos() - (declared_end - data_size as usize),
                    data_size
                ),
            )?;
        }

        let element = BinXMLOpenStartElement {
            dependency_id,
            data_size,
            name,
            attribute_list_size,
        };

        Ok(self.alloc(
            start,
            cursor.pos(),
            NodeKind::OpenStartElement(element),
            children,
        ))
    }

    fn read_attribute(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        start: usize,
        meta: AttributeTokenMeta,
        depth: u32,
    ) -> Result<(NodeKind, Vec<NodeId>)> {
        let name = self.read_name(cursor)?;

        let value_offset = cursor.position();
        let (value, token) = self.read_node(cursor, depth)?;
        match token {
            BinXMLRawToken::Value
            | BinXMLRawToken::NormalSubstitution
            | BinXMLRawToken::ConditionalSubstitution
            | BinXMLRawToken::CharReference
            | BinXMLRawToken::EntityReference => {}
            other => {
                return Err(DeserializationError::mismatch(
                    "AttributeNode",
                    value_offset,
                    format!(
                        "attribute `{}` (at {}) cannot take a `{}` as its value",
                        name,
                        start,
                        other.node_name()
                    ),
                ));
            }
        }

        Ok((
            NodeKind::Attribute(BinXMLAttribute {
                name,
                more_attributes_expected: meta.more_attributes_expected,
            }),
            vec![value],
        ))
    }

    fn read_value(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: u32,
    ) -> Result<(NodeKind, Vec<NodeId>)> {
        let type_offset = cursor.position();
        let raw_type = cursor.u8_named("value type")?;
        let value_type = BinXmlValueType::from_u8(raw_type).ok_or(
            DeserializationError::UnsupportedVariantType {
                value: raw_type,
                offset: type_offset,
            },
        )?;

        let variant_start = cursor.pos();
        let (value, variant_children) = if value_type == BinXmlValueType::BinXmlType {
            let nested = self.read_root(cursor, depth)?;
            (BinXmlValue::BinXmlType(nested), vec![nested])
        } else {
            let value = BinXmlValue::from_cursor(
                value_type,
                cursor,
                None,
                self.chunk.settings.get_ansi_codec(),
            )?;
            (value, vec![])
        };

        let variant = self.alloc(
            variant_start,
            cursor.pos(),
            NodeKind::Variant(value),
            variant_children,
        );
        Ok((NodeKind::Value(value_type), vec![variant]))
    }

    fn read_substitution_descriptor(
        &self,
        cursor: &mut ByteCursor<'_>,
        start: usize,
        optional: bool,
    ) -> Result<TemplateSubstitutionDescriptor> {
        if !self.in_template {
            return Err(DeserializationError::mismatch(
                if optional {
                    "ConditionalSubstitutionNode"
                } else {
                    "NormalSubstitutionNode"
                },
                start as u64,
                "substitution outside of a template definition",
            ));
        }

        let substitution_index = cursor.u16_named("substitution index")?;
        let type_offset = cursor.position();
        let raw_type = cursor.u8_named("substitution value type")?;
        let value_type = BinXmlValueType::from_u8(raw_type).ok_or(
            DeserializationError::UnsupportedVariantType {
                value: raw_type,
                offset: type_offset,
            },
        )?;

        Ok(TemplateSubstitutionDescriptor {
            substitution_index,
            value_type,
            optional,
        })
    }

    fn read_template_instance(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        start: usize,
        depth: u32,
    ) -> Result<(NodeKind, Vec<NodeId>)> {
        const KIND: &str = "TemplateInstanceNode";

        // A shared definition is decoded under its own cache slot; letting it reach another
        // template could wait on itself.
        if self.inside_definition {
            return Err(DeserializationError::mismatch(
                KIND,
                start as u64,
                "template instance inside a template definition",
            ));
        }

        let _unknown = cursor.u8_named("template instance unknown")?;
        let template_id = cursor.u32_named("template id")?;
        let template_offset = cursor.u32_named("template offset")?;

        // The definition follows the instance iff it is stored right here.
        let resident = template_offset as usize == cursor.pos();

        trace!(
            "\t template instance {} at {}, resident: {}",
            template_id, template_offset, resident
        );

        if resident {
            self.inside_definition = true;
            let template = self.read_template(cursor, depth);
            self.inside_definition = false;
            let (template, _) = template?;

            return Ok((
                NodeKind::TemplateInstance(BinXmlTemplateInstance {
                    template_id,
                    template_offset,
                    resident,
                    definition: None,
                }),
                vec![template],
            ));
        }

        self.descend(depth, "TemplateNode", u64::from(template_offset))?;
        let chunk = self.chunk;
        let definition = chunk
            .template_cache
            .get_or_decode(template_offset, || {
                read_template_definition(chunk, template_offset)
            })?;

        Ok((
            NodeKind::TemplateInstance(BinXmlTemplateInstance {
                template_id,
                template_offset,
                resident,
                definition: Some(definition),
            }),
            vec![],
        ))
    }

    /// Decodes a template definition (header and body) at the cursor, leaving the cursor at the
    /// end of the declared body.
    fn read_template(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: u32,
    ) -> Result<(NodeId, BinXmlTemplateNode)> {
        const KIND: &str = "TemplateNode";

        let start = cursor.pos();
        let depth = self.descend(depth, KIND, cursor.position())?;

        let next_template_offset = cursor.u32_named("next template offset")?;
        let guid_offset = cursor.position();
        let guid = read_guid(&cursor.array::<16>("template guid")?, guid_offset)?;
        let data_size = cursor.u32_named("template data size")?;

        let body_start = cursor.pos();
        let mut body = cursor.sub_range(body_start, data_size as usize, "template body")?;

        let was_in_template = mem::replace(&mut self.in_template, true);
        let enclosing_placeholders = mem::take(&mut self.placeholders);
        let children = self.read_template_body(&mut body, depth);
        self.in_template = was_in_template;
        let placeholders = mem::replace(&mut self.placeholders, enclosing_placeholders);
        let children = children?;

        if body.remaining() != 0 {
            self.chunk.settings.size_disagreement(
                KIND,
                body.position(),
                format!(
                    "template body used {} of {} declared bytes",
                    body.pos() - body_start,
                    data_size
                ),
            )?;
        }
        cursor.set_pos(body_start + data_size as usize, "template body")?;

        let template = BinXmlTemplateNode {
            header: BinXmlTemplateDefinitionHeader {
                next_template_offset,
                guid,
                data_size,
            },
            placeholders,
        };
        let id = self.alloc(
            start,
            cursor.pos(),
            NodeKind::Template(template.clone()),
            children,
        );

        Ok((id, template))
    }

    fn read_template_body(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: u32,
    ) -> Result<Vec<NodeId>> {
        let mut children = vec![];

        loop {
            let child_offset = cursor.position();
            let (child, token) = self.read_node(cursor, depth)?;
            children.push(child);

            if token == BinXMLRawToken::EndOfStream {
                return Ok(children);
            }
            check_top_level_token("TemplateNode", token, child_offset)?;
        }
    }

    /// Reads `count`, then `count` (size, type) descriptors, then the values back to back.
    fn read_substitution_array(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: u32,
    ) -> Result<Vec<SubstitutionValue>> {
        let array_offset = cursor.pos();
        let count = cursor.u32_named("substitution count")? as usize;

        let descriptors_len = count.saturating_mul(4);
        if descriptors_len > cursor.remaining() {
            return Err(DeserializationError::OutOfBounds {
                what: "substitution descriptors",
                offset: cursor.position(),
                need: descriptors_len,
                have: cursor.remaining(),
            });
        }

        let mut descriptors = Vec::with_capacity(count);
        for _ in 0..count {
            let size = cursor.u16_named("substitution value size")?;
            let type_tag = cursor.u8_named("substitution value type")?;
            let _padding = cursor.u8_named("substitution descriptor padding")?;
            descriptors.push((size, type_tag));
        }

        trace!(
            "\t substitution array at {} with {} values",
            array_offset,
            descriptors.len()
        );

        let mut substitutions = Vec::with_capacity(count);
        for (size, type_tag) in descriptors {
            let value_start = cursor.pos();
            let mut slot = cursor.sub_range(value_start, usize::from(size), "substitution value")?;
            let value = self.read_substitution_value(&mut slot, size, type_tag, depth)?;
            cursor.set_pos(value_start + usize::from(size), "substitution value")?;

            substitutions.push(SubstitutionValue {
                offset: value_start as ChunkOffset,
                size,
                type_tag,
                value,
            });
        }

        Ok(substitutions)
    }

    fn read_substitution_value(
        &mut self,
        slot: &mut ByteCursor<'c>,
        size: u16,
        type_tag: u8,
        depth: u32,
    ) -> Result<BinXmlValue> {
        let offset = slot.position();

        if type_tag == BinXmlValueType::BinXmlType.tag() {
            return Ok(BinXmlValue::BinXmlType(self.read_root(slot, depth)?));
        }

        let raw = *slot;
        let decoded = BinXmlValueType::from_u8(type_tag)
            .ok_or(DeserializationError::UnsupportedVariantType {
                value: type_tag,
                offset,
            })
            .and_then(|value_type| {
                BinXmlValue::from_cursor(
                    value_type,
                    slot,
                    Some(size),
                    self.chunk.settings.get_ansi_codec(),
                )
            });

        match decoded {
            Ok(value) => {
                if slot.remaining() != 0 && !value.is_null() {
                    self.chunk.settings.size_disagreement(
                        "SubstitutionValue",
                        offset,
                        format!(
                            "`{}` used {} of {} declared bytes",
                            value.node_name(),
                            usize::from(size) - slot.remaining(),
                            size
                        ),
                    )?;
                }
                Ok(value)
            }
            Err(e)
                if self.chunk.settings.get_strictness() == Strictness::Lenient
                    && e.is_recoverable_leaf_error() =>
            {
                warn!(
                    "offset {}: substitution value of type 0x{:02x} could not be decoded, keeping raw bytes: {}",
                    offset, type_tag, e
                );
                let mut raw = raw;
                Ok(BinXmlValue::Undecodable {
                    value_type: type_tag,
                    bytes: raw.take_bytes(usize::from(size), "substitution value")?.to_vec(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Tokens that may not appear directly in a root or template body sequence.
fn check_top_level_token(kind: &'static str, token: BinXMLRawToken, offset: u64) -> Result<()> {
    match token {
        BinXMLRawToken::CloseStartElement
        | BinXMLRawToken::CloseEmptyElement
        | BinXMLRawToken::CloseElement
        | BinXMLRawToken::Attribute(_) => Err(DeserializationError::mismatch(
            kind,
            offset,
            format!("`{}` outside of an element", token.node_name()),
        )),
        _ => Ok(()),
    }
}
