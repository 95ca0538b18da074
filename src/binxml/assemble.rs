use crate::binxml::template::{bind, check_coverage, resolve_instance};
use crate::binxml::value_variant::BinXmlValue;
use crate::err::{DeserializationError, DeserializationResult as Result};
use crate::model::deserialized::{
    BinXmlFragment, NodeArena, NodeId, NodeKind, SubstitutionValue,
};
use crate::model::xml::{XmlAttribute, XmlDocument, XmlElement, XmlNode};

use log::trace;

/// Materializes a decoded fragment: template instances are expanded, placeholders are bound to
/// the substitution array of the fragment that instantiated the template, and nested fragments
/// are spliced where they are referenced.
pub fn assemble_fragment(fragment: &BinXmlFragment, max_depth: u32) -> Result<XmlDocument> {
    let assembler = Assembler { limit: max_depth };

    let mut nodes = vec![];
    assembler.fragment(fragment.arena(), fragment.root_id(), max_depth, &mut nodes)?;

    Ok(XmlDocument { nodes })
}

/// The values placeholders bind to, together with the arena owning their nested fragments.
#[derive(Clone, Copy)]
struct Bindings<'a> {
    arena: &'a NodeArena,
    substitutions: &'a [SubstitutionValue],
}

struct Assembler {
    limit: u32,
}

impl Assembler {
    fn descend(&self, depth: u32, kind: &'static str, offset: u32) -> Result<u32> {
        depth
            .checked_sub(1)
            .ok_or(DeserializationError::DepthExceeded {
                kind,
                offset: u64::from(offset),
                limit: self.limit,
            })
    }

    fn fragment(
        &self,
        arena: &NodeArena,
        root_id: NodeId,
        depth: u32,
        out: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let root = &arena[root_id];
        let depth = self.descend(depth, "RootNode", root.offset)?;

        let NodeKind::Root(payload) = &root.kind else {
            return Err(DeserializationError::mismatch(
                "RootNode",
                u64::from(root.offset),
                format!("expected a fragment root, found `{}`", root.kind.name()),
            ));
        };

        let bindings = Bindings {
            arena,
            substitutions: &payload.substitutions,
        };

        for &child in &root.children {
            if matches!(arena[child].kind, NodeKind::TemplateInstance(_)) {
                self.template_instance(arena, child, bindings, depth, out)?;
            } else {
                self.node(arena, child, None, depth, out)?;
            }
        }

        Ok(())
    }

    fn template_instance(
        &self,
        arena: &NodeArena,
        instance: NodeId,
        bindings: Bindings<'_>,
        depth: u32,
        out: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let offset = arena[instance].offset;
        let (template_arena, template_id, template) = resolve_instance(arena, instance)?;
        let depth = self.descend(depth, "TemplateNode", template_arena[template_id].offset)?;

        check_coverage(
            &template.placeholders,
            bindings.substitutions,
            u64::from(offset),
        )?;

        trace!(
            "expanding template {} with {} substitutions",
            template.header.guid,
            bindings.substitutions.len()
        );

        for &child in &template_arena[template_id].children {
            self.node(template_arena, child, Some(bindings), depth, out)?;
        }

        Ok(())
    }

    /// Appends the resolved form of one node to `out`. Markers produce nothing, a bound
    /// nested fragment may produce several nodes.
    fn node(
        &self,
        arena: &NodeArena,
        id: NodeId,
        bindings: Option<Bindings<'_>>,
        depth: u32,
        out: &mut Vec<XmlNode>,
    ) -> Result<()> {
        let node = &arena[id];

        match &node.kind {
            NodeKind::StreamStart(_)
            | NodeKind::EndOfStream
            | NodeKind::CloseStartElement
            | NodeKind::CloseEmptyElement
            | NodeKind::CloseElement => {}
            NodeKind::OpenStartElement(_) => {
                out.push(XmlNode::Element(self.element(arena, id, bindings, depth)?));
            }
            NodeKind::Value(_) => {
                for &variant in &node.children {
                    self.node(arena, variant, bindings, depth, out)?;
                }
            }
            NodeKind::Variant(BinXmlValue::BinXmlType(nested)) => {
                self.fragment(arena, *nested, depth, out)?;
            }
            NodeKind::Variant(value) => out.push(XmlNode::Value(value.clone())),
            NodeKind::CDataSection(text) => out.push(XmlNode::CData(text.clone())),
            NodeKind::CharacterReference(c) => out.push(XmlNode::CharRef(*c)),
            NodeKind::EntityReference(name) => out.push(XmlNode::EntityRef(name.to_string())),
            NodeKind::ProcessingInstructionTarget(target) => {
                out.push(XmlNode::ProcessingInstruction {
                    target: target.to_string(),
                    data: String::new(),
                });
            }
            NodeKind::ProcessingInstructionData(text) => match out.last_mut() {
                Some(XmlNode::ProcessingInstruction { data, .. }) if data.is_empty() => {
                    data.clone_from(text);
                }
                _ => out.push(XmlNode::ProcessingInstruction {
                    target: String::new(),
                    data: text.clone(),
                }),
            },
            NodeKind::NormalSubstitution(descriptor)
            | NodeKind::ConditionalSubstitution(descriptor) => {
                let bindings = bindings.ok_or_else(|| {
                    DeserializationError::mismatch(
                        node.kind.name(),
                        u64::from(node.offset),
                        "placeholder outside of a template expansion",
                    )
                })?;

                if let Some(slot) = bind(descriptor, bindings.substitutions, u64::from(node.offset))? {
                    match &slot.value {
                        BinXmlValue::BinXmlType(nested) => {
                            self.fragment(bindings.arena, *nested, depth, out)?;
                        }
                        value => out.push(XmlNode::Value(value.clone())),
                    }
                }
            }
            NodeKind::Root(_) => self.fragment(arena, id, depth, out)?,
            NodeKind::Attribute(_) | NodeKind::TemplateInstance(_) | NodeKind::Template(_) => {
                return Err(DeserializationError::mismatch(
                    node.kind.name(),
                    u64::from(node.offset),
                    "node cannot be materialized at this position",
                ));
            }
        }

        Ok(())
    }

    fn element(
        &self,
        arena: &NodeArena,
        id: NodeId,
        bindings: Option<Bindings<'_>>,
        depth: u32,
    ) -> Result<XmlElement> {
        let node = &arena[id];
        let depth = self.descend(depth, "OpenStartElementNode", node.offset)?;

        let NodeKind::OpenStartElement(open) = &node.kind else {
            return Err(DeserializationError::mismatch(
                "OpenStartElementNode",
                u64::from(node.offset),
                format!("expected an element, found `{}`", node.kind.name()),
            ));
        };

        let mut attributes = vec![];
        let mut children = vec![];

        for &child in &node.children {
            let child_node = &arena[child];
            let NodeKind::Attribute(attribute) = &child_node.kind else {
                self.node(arena, child, bindings, depth, &mut children)?;
                continue;
            };

            let mut values = vec![];
            for &value in &child_node.children {
                self.node(arena, value, bindings, depth, &mut values)?;
            }

            // An omitted conditional value drops the attribute.
            match values.len() {
                0 => {}
                1 if !matches!(values[0], XmlNode::Element(_)) => {
                    attributes.push(XmlAttribute {
                        name: attribute.name.clone(),
                        value: values.remove(0),
                    });
                }
                _ => {
                    return Err(DeserializationError::mismatch(
                        "AttributeNode",
                        u64::from(child_node.offset),
                        format!(
                            "value of attribute `{}` does not resolve to a single value",
                            attribute.name
                        ),
                    ));
                }
            }
        }

        Ok(XmlElement {
            name: open.name.clone(),
            attributes,
            children,
        })
    }
}
