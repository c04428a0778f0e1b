//! Inventory — remote room/device listing and its reconciliation into the
//! persisted element tree.
//!
//! A bus answers the `inventory` command with two flat maps keyed by remote
//! id: `rooms` (`{name, location}`) and `inventory` (`{name, room,
//! devicetype}`). [`reconcile`] merges such a snapshot into the elements
//! already known for an owner and recomputes the breadth-first ordering of the
//! whole tree.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::element::{Element, ElementType};
use crate::id::{ElementId, OwnerId};
use crate::message::{Payload, is_acknowledgement_payload};
use crate::time::{Timestamp, now};

/// Name of the building that collects everything without a known location.
pub const DEFAULT_BUILDING_NAME: &str = "";

/// A room as reported by the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomReport {
    #[serde(default)]
    pub name: Option<String>,
    /// Name of the building the room belongs to.
    #[serde(default)]
    pub location: Option<String>,
}

/// A device as reported by the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    #[serde(default)]
    pub name: Option<String>,
    /// Remote id of the room the device sits in.
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default, rename = "devicetype")]
    pub category: Option<String>,
}

/// Parsed reply to the `inventory` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(default)]
    rooms: Option<BTreeMap<String, RoomReport>>,
    #[serde(default)]
    inventory: Option<BTreeMap<String, DeviceReport>>,
}

impl InventorySnapshot {
    /// Parse the snapshot out of a reply payload. Unrelated keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] when `rooms` or `inventory` is present
    /// but not shaped as a map of reports, or when the payload is a bare
    /// acknowledgement.
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        if is_acknowledgement_payload(payload) {
            return Err(serde::de::Error::custom(
                "acknowledgement received instead of an inventory",
            ));
        }
        serde_json::from_value(Value::Object(payload.clone()))
    }

    #[must_use]
    pub fn with_room(mut self, id: impl Into<String>, room: RoomReport) -> Self {
        self.rooms.get_or_insert_with(BTreeMap::new).insert(id.into(), room);
        self
    }

    #[must_use]
    pub fn with_device(mut self, id: impl Into<String>, device: DeviceReport) -> Self {
        self.inventory
            .get_or_insert_with(BTreeMap::new)
            .insert(id.into(), device);
        self
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&String, &RoomReport)> {
        self.rooms.iter().flatten()
    }

    pub fn devices(&self) -> impl Iterator<Item = (&String, &DeviceReport)> {
        self.inventory.iter().flatten()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms().next().is_none() && self.devices().next().is_none()
    }
}

/// Result of [`reconcile`].
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Every element of the owner, updated and ordered by `tree_index`.
    pub elements: Vec<Element>,
    /// Last tree index assigned; pass it as `start_index` for the next bus.
    pub next_index: u32,
}

/// Merge `snapshot` into the owner's `existing` elements.
///
/// Reported rooms and devices are created or updated in place; elements the
/// snapshot does not mention are kept. Rooms with an unknown location and
/// devices with an unknown room land under the default building, as does any
/// element whose parent is missing or unreachable from a root. Tree indices
/// are assigned breadth first starting at `start_index + 1`, siblings ordered
/// by [`Element::display_order`].
#[must_use]
pub fn reconcile(
    owner: OwnerId,
    existing: Vec<Element>,
    snapshot: &InventorySnapshot,
    start_index: u32,
) -> Reconciled {
    let at = now();
    let mut tree = Tree::new(owner, existing, at);
    let default_building = tree.default_building();

    for (room_id, report) in snapshot.rooms() {
        if room_id.is_empty() {
            tracing::warn!("skipping reported room with empty id");
            continue;
        }
        let location = report.location.as_deref().unwrap_or(DEFAULT_BUILDING_NAME);
        let building = tree
            .building_named(location)
            .unwrap_or_else(|| default_building.clone());
        let name = report.name.clone().unwrap_or_default();
        tree.upsert(ElementId::new(room_id.as_str()), ElementType::Room, |room| {
            room.parent_id = building;
            room.name = name;
        });
    }

    for (device_id, report) in snapshot.devices() {
        if device_id.is_empty() {
            tracing::warn!("skipping reported device with empty id");
            continue;
        }
        let device_id = ElementId::new(device_id.as_str());
        let parent = report
            .room
            .as_deref()
            .map(ElementId::new)
            .filter(|room| *room != device_id && tree.contains(room))
            .unwrap_or_else(|| default_building.clone());
        let name = report.name.clone().unwrap_or_default();
        let category = report.category.clone().unwrap_or_default();
        tree.upsert(device_id, ElementType::Device, |device| {
            device.parent_id = parent;
            device.name = name;
            device.category = category;
            device.element_type = ElementType::Device;
        });
    }

    tree.attach_orphans(&default_building);
    let next_index = tree.assign_order(start_index);
    let mut elements = tree.elements;
    elements.sort_by_key(|element| element.tree_index);
    Reconciled {
        elements,
        next_index,
    }
}

struct Tree {
    owner: OwnerId,
    at: Timestamp,
    elements: Vec<Element>,
    index: HashMap<ElementId, usize>,
}

impl Tree {
    fn new(owner: OwnerId, mut elements: Vec<Element>, at: Timestamp) -> Self {
        elements.sort_by(|a, b| a.element_id.cmp(&b.element_id));
        elements.dedup_by(|a, b| a.element_id == b.element_id);
        let index = elements
            .iter()
            .enumerate()
            .map(|(position, element)| (element.element_id.clone(), position))
            .collect();
        Self {
            owner,
            at,
            elements,
            index,
        }
    }

    fn contains(&self, id: &ElementId) -> bool {
        self.index.contains_key(id)
    }

    fn building_named(&self, name: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|element| {
                element.element_type == ElementType::Building
                    && element.is_root()
                    && element.name == name
            })
            .map(|building| building.element_id.clone())
    }

    fn default_building(&mut self) -> ElementId {
        if let Some(id) = self.building_named(DEFAULT_BUILDING_NAME) {
            return id;
        }
        let id = ElementId::generate();
        self.insert(Element {
            element_id: id.clone(),
            parent_id: id.clone(),
            owner: self.owner,
            element_type: ElementType::Building,
            name: DEFAULT_BUILDING_NAME.to_string(),
            category: String::new(),
            tree_index: 0,
            tree_depth: 0,
            created: self.at,
            modified: self.at,
        });
        id
    }

    fn insert(&mut self, element: Element) {
        self.index
            .insert(element.element_id.clone(), self.elements.len());
        self.elements.push(element);
    }

    /// Apply `update` to the element with `id`, creating it with
    /// `element_type` first when unknown. `modified` moves only on change.
    fn upsert(
        &mut self,
        id: ElementId,
        element_type: ElementType,
        update: impl FnOnce(&mut Element),
    ) {
        if let Some(&position) = self.index.get(&id) {
            let element = &mut self.elements[position];
            let before = element.clone();
            update(element);
            if *element != before {
                element.touch(self.at);
            }
            return;
        }
        let mut element = Element {
            element_id: id.clone(),
            parent_id: id,
            owner: self.owner,
            element_type,
            name: String::new(),
            category: String::new(),
            tree_index: 0,
            tree_depth: 0,
            created: self.at,
            modified: self.at,
        };
        update(&mut element);
        self.insert(element);
    }

    /// Re-parent every element whose ancestry does not end at a root.
    fn attach_orphans(&mut self, default_building: &ElementId) {
        for start in 0..self.elements.len() {
            let mut seen = HashSet::new();
            let mut current = start;
            loop {
                let element = &self.elements[current];
                if element.is_root() {
                    break;
                }
                let parent = self.index.get(&element.parent_id).copied();
                if !seen.insert(current) || parent.is_none() {
                    let orphan = &mut self.elements[current];
                    tracing::debug!(element_id = %orphan.element_id, parent_id = %orphan.parent_id, "attaching orphan to default building");
                    orphan.parent_id = default_building.clone();
                    orphan.touch(self.at);
                    break;
                }
                if let Some(parent) = parent {
                    current = parent;
                }
            }
        }
    }

    /// Breadth-first numbering from the roots. Returns the last index used.
    fn assign_order(&mut self, start_index: u32) -> u32 {
        let mut roots = Vec::new();
        let mut children: HashMap<&ElementId, Vec<usize>> = HashMap::new();
        for (position, element) in self.elements.iter().enumerate() {
            if element.is_root() {
                roots.push(position);
            } else {
                children.entry(&element.parent_id).or_default().push(position);
            }
        }
        let by_display = |a: &usize, b: &usize| self.elements[*a].display_order(&self.elements[*b]);
        roots.sort_by(by_display);
        for siblings in children.values_mut() {
            siblings.sort_by(by_display);
        }
        let children: HashMap<ElementId, Vec<usize>> = children
            .into_iter()
            .map(|(parent, siblings)| (parent.clone(), siblings))
            .collect();

        let mut queue: VecDeque<(usize, u32)> = roots.into_iter().map(|root| (root, 0)).collect();
        let mut tree_index = start_index;
        while let Some((position, depth)) = queue.pop_front() {
            tree_index += 1;
            let element = &mut self.elements[position];
            if element.tree_index != tree_index || element.tree_depth != depth {
                element.tree_index = tree_index;
                element.tree_depth = depth;
                element.touch(self.at);
            }
            if let Some(siblings) = children.get(&element.element_id) {
                queue.extend(siblings.iter().map(|child| (*child, depth + 1)));
            }
        }
        tree_index
    }
}
