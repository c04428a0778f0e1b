//! Element — a node (building, room, device) of an owner's inventory tree.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HomeBusError, ValidationError};
use crate::id::{ElementId, OwnerId};
use crate::time::{Timestamp, now};

/// Kind of inventory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[default]
    Other,
    Building,
    Room,
    Device,
}

impl ElementType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Building => "building",
            Self::Room => "room",
            Self::Device => "device",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ElementType {
    type Err = UnknownElementType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "other" => Ok(Self::Other),
            "building" => Ok(Self::Building),
            "room" => Ok(Self::Room),
            "device" => Ok(Self::Device),
            other => Err(UnknownElementType(other.to_string())),
        }
    }
}

/// Returned when parsing an unknown [`ElementType`] name.
#[derive(Debug, thiserror::Error)]
#[error("unknown element type {0:?}")]
pub struct UnknownElementType(pub String);

/// A node of the inventory tree.
///
/// An element is a root iff its `parent_id` equals its own `element_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub element_id: ElementId,
    pub parent_id: ElementId,
    pub owner: OwnerId,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub name: String,
    /// Free-text device class reported by the bus (e.g. `"switch"`).
    pub category: String,
    /// Dense position in the breadth-first ordering of the owner's tree.
    pub tree_index: u32,
    /// Distance from the root; roots have depth 0.
    pub tree_depth: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Element {
    /// Create a builder for constructing an [`Element`].
    #[must_use]
    pub fn builder() -> ElementBuilder {
        ElementBuilder::default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.element_id == self.parent_id
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Validation`] when the id is empty.
    pub fn validate(&self) -> Result<(), HomeBusError> {
        if self.element_id.is_empty() || self.parent_id.is_empty() {
            return Err(ValidationError::EmptyElementId.into());
        }
        Ok(())
    }

    /// Order used among siblings: display name first, id as tie-breaker.
    #[must_use]
    pub fn display_order(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.element_id.cmp(&other.element_id))
    }

    pub(crate) fn touch(&mut self, at: Timestamp) {
        self.modified = at;
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tree_index, self.name)
    }
}

/// Step-by-step builder for [`Element`].
///
/// Without an explicit id a fresh one is generated; without a parent the
/// element becomes a root.
#[derive(Debug, Default)]
pub struct ElementBuilder {
    element_id: Option<ElementId>,
    parent_id: Option<ElementId>,
    owner: Option<OwnerId>,
    element_type: ElementType,
    name: Option<String>,
    category: Option<String>,
    created: Option<Timestamp>,
}

impl ElementBuilder {
    #[must_use]
    pub fn element_id(mut self, id: impl Into<ElementId>) -> Self {
        self.element_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn parent_id(mut self, id: impl Into<ElementId>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn created(mut self, created: Timestamp) -> Self {
        self.created = Some(created);
        self
    }

    /// Consume the builder, validate, and return an [`Element`].
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Validation`] if an explicit id is empty.
    pub fn build(self) -> Result<Element, HomeBusError> {
        let element_id = self.element_id.unwrap_or_else(ElementId::generate);
        let parent_id = self.parent_id.unwrap_or_else(|| element_id.clone());
        let created = self.created.unwrap_or_else(now);
        let element = Element {
            element_id,
            parent_id,
            owner: self.owner.unwrap_or_default(),
            element_type: self.element_type,
            name: self.name.unwrap_or_default(),
            category: self.category.unwrap_or_default(),
            tree_index: 0,
            tree_depth: 0,
            created,
            modified: created,
        };
        element.validate()?;
        Ok(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_build_root_when_parent_missing() {
        let building = Element::builder()
            .element_type(ElementType::Building)
            .build()
            .unwrap();
        assert!(building.is_root());
        assert_eq!(building.name, "");
    }

    #[test]
    fn should_build_child_with_explicit_parent() {
        let room = Element::builder()
            .element_id("R1")
            .parent_id("B1")
            .element_type(ElementType::Room)
            .name("Kitchen")
            .build()
            .unwrap();
        assert!(!room.is_root());
        assert_eq!(room.parent_id.as_str(), "B1");
    }

    #[test]
    fn should_reject_empty_element_id() {
        let result = Element::builder().element_id("").build();
        assert!(matches!(
            result,
            Err(HomeBusError::Validation(ValidationError::EmptyElementId))
        ));
    }

    #[test]
    fn should_order_siblings_by_name_then_id() {
        let a = Element::builder().element_id("2").name("Attic").build().unwrap();
        let b = Element::builder().element_id("1").name("Bath").build().unwrap();
        let c = Element::builder().element_id("0").name("Bath").build().unwrap();
        assert_eq!(a.display_order(&b), Ordering::Less);
        assert_eq!(b.display_order(&c), Ordering::Greater);
    }

    #[test]
    fn should_parse_element_type_names() {
        for kind in [
            ElementType::Other,
            ElementType::Building,
            ElementType::Room,
            ElementType::Device,
        ] {
            assert_eq!(kind.as_str().parse::<ElementType>().unwrap(), kind);
        }
        assert!("garage".parse::<ElementType>().is_err());
    }
}
