//! Phase-1 output: the structural BXML tree.
//!
//! Nodes live in a [`NodeArena`] and reference their children by [`NodeId`], so every tree
//! decoded for one record (or one shared template) is dropped together with its arena.
//! Substitution placeholders are kept as-is here; binding them to values happens in a separate
//! pass (see `binxml::assemble`).

use crate::ChunkOffset;
use crate::binxml::name::BinXmlName;
use crate::binxml::value_variant::{BinXmlValue, BinXmlValueType};

use std::fmt::{self, Formatter};
use std::ops::Index;
use std::sync::Arc;
use winstructs::guid::Guid;

/// Index of a node inside its [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeArena {
    nodes: Vec<BXmlNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        NodeArena::default()
    }

    pub(crate) fn alloc(&mut self, node: BXmlNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&BXmlNode> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BXmlNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }
}

impl Index<NodeId> for NodeArena {
    type Output = BXmlNode;

    fn index(&self, id: NodeId) -> &BXmlNode {
        &self.nodes[id.index()]
    }
}

/// One decoded node.
///
/// `offset` and `length` give the byte span of the node and all of its descendants (for a root,
/// including its substitution array). Leaf kinds have no children.
#[derive(Debug, Clone, PartialEq)]
pub struct BXmlNode {
    pub offset: ChunkOffset,
    pub length: u32,
    pub kind: NodeKind,
    pub children: Vec<NodeId>,
}

impl BXmlNode {
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Root(RootNode),
    StreamStart(BinXMLFragmentHeader),
    EndOfStream,
    OpenStartElement(BinXMLOpenStartElement),
    CloseStartElement,
    CloseEmptyElement,
    CloseElement,
    /// Wraps exactly one [`NodeKind::Variant`] child.
    Value(BinXmlValueType),
    /// A typed leaf. A `BinXmlType` value has the nested root as its only child.
    Variant(BinXmlValue),
    Attribute(BinXMLAttribute),
    CDataSection(String),
    CharacterReference(u16),
    EntityReference(BinXmlName),
    ProcessingInstructionTarget(BinXmlName),
    ProcessingInstructionData(String),
    TemplateInstance(BinXmlTemplateInstance),
    Template(BinXmlTemplateNode),
    NormalSubstitution(TemplateSubstitutionDescriptor),
    ConditionalSubstitution(TemplateSubstitutionDescriptor),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Root(_) => "RootNode",
            NodeKind::StreamStart(_) => "StreamStartNode",
            NodeKind::EndOfStream => "EndOfStreamNode",
            NodeKind::OpenStartElement(_) => "OpenStartElementNode",
            NodeKind::CloseStartElement => "CloseStartElementNode",
            NodeKind::CloseEmptyElement => "CloseEmptyElementNode",
            NodeKind::CloseElement => "CloseElementNode",
            NodeKind::Value(_) => "ValueNode",
            NodeKind::Variant(value) => value.node_name(),
            NodeKind::Attribute(_) => "AttributeNode",
            NodeKind::CDataSection(_) => "CDataSectionNode",
            NodeKind::CharacterReference(_) => "CharacterReferenceNode",
            NodeKind::EntityReference(_) => "EntityReferenceNode",
            NodeKind::ProcessingInstructionTarget(_) => "ProcessingInstructionTargetNode",
            NodeKind::ProcessingInstructionData(_) => "ProcessingInstructionDataNode",
            NodeKind::TemplateInstance(_) => "TemplateInstanceNode",
            NodeKind::Template(_) => "TemplateNode",
            NodeKind::NormalSubstitution(_) => "NormalSubstitutionNode",
            NodeKind::ConditionalSubstitution(_) => "ConditionalSubstitutionNode",
        }
    }
}

/// An independently rooted fragment: a record's document, or a nested `BinXmlType` value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RootNode {
    /// The trailing substitution array, empty when the fragment instantiates no template.
    pub substitutions: Vec<SubstitutionValue>,
}

/// One slot of a substitution array.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionValue {
    pub offset: ChunkOffset,
    /// Declared size in bytes.
    pub size: u16,
    /// Declared type tag, validated against the placeholder that binds the slot.
    pub type_tag: u8,
    pub value: BinXmlValue,
}

impl SubstitutionValue {
    pub fn value_type(&self) -> Option<BinXmlValueType> {
        BinXmlValueType::from_u8(self.type_tag)
    }

    pub fn is_null(&self) -> bool {
        self.type_tag == BinXmlValueType::NullType.tag()
    }
}

/// Fragment header at the start of a BinXML stream.
#[derive(Debug, PartialOrd, PartialEq, Eq, Clone)]
pub struct BinXMLFragmentHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u8,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BinXMLOpenStartElement {
    pub dependency_id: u16,
    /// Bytes following this field up to and including the element's closing marker.
    pub data_size: u32,
    pub name: BinXmlName,
    pub attribute_list_size: Option<u32>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BinXMLAttribute {
    pub name: BinXmlName,
    pub more_attributes_expected: bool,
}

/// Template instance payload.
///
/// A resident template is decoded inline and is the instance's only child. A non-resident one
/// is shared through the chunk's template cache and referenced through `definition`.
#[derive(Debug, PartialEq, Clone)]
pub struct BinXmlTemplateInstance {
    pub template_id: u32,
    pub template_offset: ChunkOffset,
    pub resident: bool,
    pub definition: Option<Arc<TemplateDefinition>>,
}

/// Template definition header stored in the chunk template table.
#[derive(Debug, PartialEq, Clone)]
pub struct BinXmlTemplateDefinitionHeader {
    /// A pointer to the next template in the bucket.
    pub next_template_offset: ChunkOffset,
    pub guid: Guid,
    pub data_size: u32,
}

impl fmt::Display for BinXmlTemplateDefinitionHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BinXmlTemplateDefinitionHeader - id: {guid}, data_size: {size}>",
            guid = self.guid,
            size = self.data_size
        )
    }
}

/// Placeholder descriptor within a template definition.
#[derive(Debug, PartialOrd, PartialEq, Eq, Clone, Copy)]
pub struct TemplateSubstitutionDescriptor {
    // Zero-based (0 is first replacement)
    pub substitution_index: u16,
    pub value_type: BinXmlValueType,
    /// True for conditional substitutions, which are omitted when bound to a null value.
    pub optional: bool,
}

/// A substitution node occurrence inside a template body, in document order.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TemplatePlaceholder {
    pub node: NodeId,
    pub descriptor: TemplateSubstitutionDescriptor,
}

#[derive(Debug, PartialEq, Clone)]
pub struct BinXmlTemplateNode {
    pub header: BinXmlTemplateDefinitionHeader,
    pub placeholders: Vec<TemplatePlaceholder>,
}

/// A decoded tree together with the arena that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct BinXmlFragment {
    pub(crate) arena: NodeArena,
    pub(crate) root: NodeId,
}

impl BinXmlFragment {
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> &BXmlNode {
        &self.arena[self.root]
    }

    pub fn node(&self, id: NodeId) -> &BXmlNode {
        &self.arena[id]
    }

    /// The substitution array of the fragment's root.
    pub fn substitutions(&self) -> &[SubstitutionValue] {
        match &self.root().kind {
            NodeKind::Root(root) => &root.substitutions,
            _ => &[],
        }
    }

    /// Sum of the byte spans of the root's direct children and its substitution array.
    pub fn byte_span(&self) -> u32 {
        self.root().length
    }
}

/// A non-resident template, decoded once per chunk and shared between records.
#[derive(Debug, PartialEq)]
pub struct TemplateDefinition {
    pub(crate) offset: ChunkOffset,
    pub(crate) arena: NodeArena,
    /// The `Template` node.
    pub(crate) root: NodeId,
    pub(crate) header: BinXmlTemplateDefinitionHeader,
    pub(crate) placeholders: Vec<TemplatePlaceholder>,
}

impl TemplateDefinition {
    pub fn offset(&self) -> ChunkOffset {
        self.offset
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn header(&self) -> &BinXmlTemplateDefinitionHeader {
        &self.header
    }

    pub fn guid(&self) -> &Guid {
        &self.header.guid
    }

    pub fn placeholders(&self) -> &[TemplatePlaceholder] {
        &self.placeholders
    }
}
