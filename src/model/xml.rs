//! Phase-2 output: a resolved tree with templates expanded and substitutions bound.

use crate::binxml::name::BinXmlName;
use crate::binxml::value_variant::BinXmlValue;

use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlDocument {
    pub nodes: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    /// A literal or substituted value. Never a nested fragment, those are spliced in place.
    Value(BinXmlValue),
    CData(String),
    CharRef(u16),
    EntityRef(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: BinXmlName,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlAttribute {
    pub name: BinXmlName,
    pub value: XmlNode,
}

impl XmlDocument {
    /// The first top-level element, usually `Event`.
    pub fn root_element(&self) -> Option<&XmlElement> {
        self.nodes.iter().find_map(XmlNode::as_element)
    }
}

impl XmlNode {
    pub fn as_element(&self) -> Option<&XmlElement> {
        match self {
            XmlNode::Element(e) => Some(e),
            _ => None,
        }
    }

    /// Text content of a leaf node. Elements and processing instructions have none.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            XmlNode::Value(value) => value.as_cow_str(),
            XmlNode::CData(s) => Cow::Borrowed(s),
            XmlNode::CharRef(c) => Cow::Owned(
                char::from_u32(u32::from(*c))
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
                    .to_string(),
            ),
            XmlNode::EntityRef(name) => Cow::Owned(format!("&{};", name)),
            XmlNode::Element(_) | XmlNode::ProcessingInstruction { .. } => Cow::Borrowed(""),
        }
    }
}

impl XmlElement {
    pub fn attribute(&self, name: &str) -> Option<&XmlAttribute> {
        self.attributes.iter().find(|a| a.name.as_str() == name)
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(XmlNode::as_element)
    }

    /// The first child element called `name`.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name.as_str() == name)
    }

    /// Concatenated text of the direct non-element children.
    pub fn text(&self) -> String {
        self.children.iter().map(|child| child.text()).collect()
    }
}
