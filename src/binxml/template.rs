//! Template expansion and positional substitution binding.

use crate::err::{DeserializationError, DeserializationResult as Result};
use crate::model::deserialized::{
    BinXmlTemplateNode, NodeArena, NodeId, NodeKind, SubstitutionValue, TemplatePlaceholder,
    TemplateSubstitutionDescriptor,
};

use log::warn;

/// The template a `TemplateInstance` node expands to.
///
/// A resident template lives in the instance's own arena as its only child. A shared one lives in
/// the arena of its cached definition.
pub(crate) fn resolve_instance(
    arena: &NodeArena,
    instance: NodeId,
) -> Result<(&NodeArena, NodeId, &BinXmlTemplateNode)> {
    let node = &arena[instance];
    let not_expandable = |message: &str| {
        DeserializationError::mismatch("TemplateInstanceNode", u64::from(node.offset), message)
    };

    let NodeKind::TemplateInstance(payload) = &node.kind else {
        return Err(not_expandable("node is not a template instance"));
    };

    let (template_arena, template_id) = match &payload.definition {
        Some(definition) => (definition.arena(), definition.root_id()),
        None => {
            let id = *node
                .children
                .first()
                .ok_or_else(|| not_expandable("resident template is missing"))?;
            (arena, id)
        }
    };

    match &template_arena[template_id].kind {
        NodeKind::Template(template) => Ok((template_arena, template_id, template)),
        _ => Err(not_expandable("instance does not point at a template")),
    }
}

/// Checks that every placeholder of a template addresses a slot of the substitution array.
pub(crate) fn check_coverage(
    placeholders: &[TemplatePlaceholder],
    substitutions: &[SubstitutionValue],
    offset: u64,
) -> Result<()> {
    match placeholders
        .iter()
        .find(|p| usize::from(p.descriptor.substitution_index) >= substitutions.len())
    {
        Some(uncovered) => Err(DeserializationError::SubstitutionIndexOutOfRange {
            index: uncovered.descriptor.substitution_index,
            len: substitutions.len(),
            offset,
        }),
        None => Ok(()),
    }
}

/// Binds one placeholder to its slot.
///
/// Returns `None` when a conditional placeholder meets a null slot, in which case nothing is
/// rendered. A normal placeholder always binds, even to a null slot.
pub(crate) fn bind<'s>(
    descriptor: &TemplateSubstitutionDescriptor,
    substitutions: &'s [SubstitutionValue],
    offset: u64,
) -> Result<Option<&'s SubstitutionValue>> {
    let index = descriptor.substitution_index;
    let value = substitutions.get(usize::from(index)).ok_or(
        DeserializationError::SubstitutionIndexOutOfRange {
            index,
            len: substitutions.len(),
            offset,
        },
    )?;

    if value.is_null() {
        return Ok(if descriptor.optional { None } else { Some(value) });
    }

    if value.type_tag != descriptor.value_type.tag() {
        warn!(
            "offset {}: substitution {} is declared as {:?} but holds a value of type 0x{:02x}",
            offset, index, descriptor.value_type, value.type_tag
        );
    }

    Ok(Some(value))
}
