//! The sample-changer component tree and its bookkeeping.
//!
//! [`ChangerModel`] owns every component in an arena indexed by
//! [`ComponentId`]. Parents own their children; the selection and the loaded
//! sample are stored as ids, never as owning references.
//!
//! # Invariants
//!
//! - At most one sample has `loaded == true`, and `loaded_sample()` returns it.
//! - A holder with `present == false` has only non-present, barcode-less
//!   samples below it.
//! - The selected sample, if any, lies below the selected holder.
//!
//! [`ChangerModel::check_invariants`] verifies all three and is used by the
//! test suites after every mutation sequence.

use std::collections::HashMap;

use serde::Serialize;

use super::address::{
    basket_address, cell_address, drop_address, pin_address, row_letter, xtal_address,
};
use super::component::{Component, ComponentId, ComponentKind};
use super::geometry::Geometry;
use crate::error::{ScError, ScResult};

/// What a caller may pass to `select`, `load` and `scan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Component id from this tree.
    Id(ComponentId),
    /// Address string such as `"2:05"` or `"B3:2-1"`.
    Address(String),
    /// 1-based `[row, col]`: basket/pin numbers for dewars, plate row/column
    /// for plates.
    Location {
        /// Basket number or plate row.
        row: usize,
        /// Pin number or plate column.
        col: usize,
    },
}

impl From<ComponentId> for Target {
    fn from(id: ComponentId) -> Self {
        Target::Id(id)
    }
}

impl From<&str> for Target {
    fn from(address: &str) -> Self {
        Target::Address(address.to_string())
    }
}

impl From<String> for Target {
    fn from(address: String) -> Self {
        Target::Address(address)
    }
}

impl From<(usize, usize)> for Target {
    fn from((row, col): (usize, usize)) -> Self {
        Target::Location { row, col }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Id(id) => write!(f, "#{}", id.0),
            Target::Address(a) => f.write_str(a),
            Target::Location { row, col } => write!(f, "[{}, {}]", row, col),
        }
    }
}

/// Currently selected holder and sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Selection {
    /// Selected holder.
    pub basket: Option<ComponentId>,
    /// Selected sample.
    pub sample: Option<ComponentId>,
}

/// Result of replacing the loaded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedChange {
    /// Sample loaded before.
    pub previous: Option<ComponentId>,
    /// Sample loaded now.
    pub current: Option<ComponentId>,
}

/// Plate dimensions reported by plate manipulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlateInfo {
    /// Row count.
    pub rows: usize,
    /// Column count.
    pub cols: usize,
    /// Drops per cell.
    pub drops: usize,
}

/// In-memory tree of dewar, holders and samples.
#[derive(Debug, Clone)]
pub struct ChangerModel {
    name: String,
    geometry: Geometry,
    components: Vec<Component>,
    by_address: HashMap<String, ComponentId>,
    holders: Vec<ComponentId>,
    selection: Selection,
    loaded: Option<ComponentId>,
}

impl ChangerModel {
    /// Build the tree for `geometry`. All info fields start cleared.
    pub fn new(name: impl Into<String>, geometry: Geometry) -> ScResult<Self> {
        geometry.validate().map_err(ScError::Configuration)?;

        let name = name.into();
        let mut model = Self {
            name: name.clone(),
            geometry: geometry.clone(),
            components: Vec::new(),
            by_address: HashMap::new(),
            holders: Vec::new(),
            selection: Selection::default(),
            loaded: None,
        };

        let root = model.push(ComponentKind::Dewar, name, None);

        match &geometry {
            Geometry::Pucks { .. } | Geometry::Mixed { .. } => {
                for (i, basket_type) in geometry.basket_types().iter().enumerate() {
                    let basket_no = i + 1;
                    let basket =
                        model.push(ComponentKind::Basket, basket_address(basket_no), Some(root));
                    model.holders.push(basket);
                    for sample_no in 1..=basket_type.samples() {
                        model.push(
                            ComponentKind::Pin,
                            pin_address(basket_no, sample_no),
                            Some(basket),
                        );
                    }
                }
            }
            Geometry::Plate { rows, cols, drops } => {
                for row in 1..=*rows {
                    for col in 1..=*cols {
                        let cell_addr = cell_address(row, col);
                        let cell = model.push(ComponentKind::Cell, cell_addr.clone(), Some(root));
                        model.holders.push(cell);
                        for drop_no in 1..=*drops {
                            let drop_addr = drop_address(&cell_addr, drop_no);
                            let drop =
                                model.push(ComponentKind::Drop, drop_addr.clone(), Some(cell));
                            model.push(ComponentKind::Xtal, xtal_address(&drop_addr, 1), Some(drop));
                        }
                    }
                }
            }
        }

        model.reset_contents();
        Ok(model)
    }

    fn push(
        &mut self,
        kind: ComponentKind,
        address: String,
        parent: Option<ComponentId>,
    ) -> ComponentId {
        let id = ComponentId(self.components.len());
        let index = match parent {
            Some(p) => {
                let siblings = &mut self.components[p.0].children;
                siblings.push(id);
                siblings.len() - 1
            }
            None => 0,
        };
        self.by_address.insert(address.clone(), id);
        self.components
            .push(Component::new(id, kind, address, index, parent));
        id
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Changer name, the root address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layout the tree was built from.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The dewar or plate at the top of the tree.
    pub fn root(&self) -> ComponentId {
        ComponentId(0)
    }

    /// Component by id, `None` for ids from another tree.
    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(id.0)
    }

    fn node(&self, id: ComponentId) -> ScResult<&Component> {
        self.components
            .get(id.0)
            .ok_or_else(|| ScError::UnknownComponent(format!("#{}", id.0)))
    }

    fn node_mut(&mut self, id: ComponentId) -> ScResult<&mut Component> {
        self.components
            .get_mut(id.0)
            .ok_or_else(|| ScError::UnknownComponent(format!("#{}", id.0)))
    }

    /// Address of `id`, or an empty string for foreign ids.
    pub fn address(&self, id: ComponentId) -> &str {
        self.get(id).map(|c| c.address.as_str()).unwrap_or("")
    }

    /// Component at `address`.
    pub fn by_address(&self, address: &str) -> Option<ComponentId> {
        self.by_address.get(address).copied()
    }

    /// Resolve a target to a component of this tree.
    pub fn resolve(&self, target: &Target) -> ScResult<ComponentId> {
        match target {
            Target::Id(id) => self.node(*id).map(|c| c.id),
            Target::Address(address) => self
                .by_address(address)
                .ok_or_else(|| ScError::UnknownComponent(address.clone())),
            Target::Location { row, col } => {
                let address = if self.geometry.is_plate() {
                    cell_address(*row, *col)
                } else {
                    pin_address(*row, *col)
                };
                if *row == 0 || *col == 0 || (self.geometry.is_plate() && *row > 26) {
                    return Err(ScError::UnknownComponent(target.to_string()));
                }
                self.by_address(&address)
                    .ok_or(ScError::UnknownComponent(address))
            }
        }
    }

    /// Top-level holders (baskets or plate cells) in dewar order.
    pub fn holders(&self) -> &[ComponentId] {
        &self.holders
    }

    /// All components, root first.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// All sample leaves in tree order.
    pub fn samples(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(|c| c.is_sample())
    }

    /// Sample leaves below `id` (including `id` itself if it is a sample).
    pub fn descendant_samples(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            if node.is_sample() {
                out.push(current);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Enclosing basket or cell of `id` (itself when `id` is a holder).
    pub fn holder_of(&self, id: ComponentId) -> Option<ComponentId> {
        let mut current = self.get(id)?;
        loop {
            if current.kind.is_holder() {
                return Some(current.id);
            }
            current = self.get(current.parent?)?;
        }
    }

    /// `(holder number, position number)` of a sample, both 1-based.
    ///
    /// Pins report basket and vial numbers; crystals report cell number and
    /// drop number.
    pub fn location_of(&self, sample: ComponentId) -> Option<(usize, usize)> {
        let node = self.get(sample)?;
        if !node.is_sample() {
            return None;
        }
        let holder = self.get(self.holder_of(sample)?)?;
        let position = match node.kind {
            ComponentKind::Xtal => self.get(node.parent?)?.number(),
            _ => node.number(),
        };
        Some((holder.number(), position))
    }

    /// Row/column/drops of a plate geometry.
    pub fn plate_info(&self) -> Option<PlateInfo> {
        match self.geometry {
            Geometry::Plate { rows, cols, drops } => Some(PlateInfo { rows, cols, drops }),
            _ => None,
        }
    }

    /// Crystal at 0-based plate `row`/`col` and 1-based `drop`.
    pub fn plate_sample(&self, row: usize, col: usize, drop: usize) -> Option<ComponentId> {
        let info = self.plate_info()?;
        if row >= info.rows || col >= info.cols || drop == 0 || drop > info.drops {
            return None;
        }
        let cell = format!("{}{}", row_letter(row + 1), col + 1);
        self.by_address(&xtal_address(&drop_address(&cell, drop), 1))
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Current selection.
    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Selected holder, if any.
    pub fn selected_basket(&self) -> Option<ComponentId> {
        self.selection.basket
    }

    /// Selected sample, if any.
    pub fn selected_sample(&self) -> Option<ComponentId> {
        self.selection.sample
    }

    /// Work out the `(holder, sample)` pair a target stands for.
    pub fn selection_for(&self, target: &Target) -> ScResult<Selection> {
        let id = self.resolve(target)?;
        let node = self.node(id)?;
        let selection = match node.kind {
            ComponentKind::Dewar => {
                return Err(ScError::InvalidSelection(format!(
                    "{} is the dewar, select a basket or a sample",
                    node.address
                )))
            }
            ComponentKind::Basket | ComponentKind::Cell => Selection {
                basket: Some(id),
                sample: None,
            },
            ComponentKind::Drop => Selection {
                basket: self.holder_of(id),
                sample: node.children.first().copied(),
            },
            ComponentKind::Pin | ComponentKind::Xtal => Selection {
                basket: self.holder_of(id),
                sample: Some(id),
            },
        };
        Ok(selection)
    }

    /// Select `target`. Returns `true` if the selection changed.
    pub fn select(&mut self, target: &Target) -> ScResult<bool> {
        let selection = self.selection_for(target)?;
        if selection == self.selection {
            return Ok(false);
        }
        self.apply_selection(selection);
        Ok(true)
    }

    /// Drop the current selection. Returns `true` if something was selected.
    pub fn clear_selection(&mut self) -> bool {
        if self.selection == Selection::default() {
            return false;
        }
        self.apply_selection(Selection::default());
        true
    }

    fn apply_selection(&mut self, selection: Selection) {
        for id in [self.selection.basket, self.selection.sample]
            .into_iter()
            .flatten()
        {
            self.components[id.0].selected = false;
        }
        for id in [selection.basket, selection.sample].into_iter().flatten() {
            self.components[id.0].selected = true;
        }
        self.selection = selection;
    }

    // =========================================================================
    // Loaded sample
    // =========================================================================

    /// Sample on the goniometer.
    pub fn loaded_sample(&self) -> Option<ComponentId> {
        self.loaded
    }

    /// Whether any sample is on the goniometer.
    pub fn has_loaded_sample(&self) -> bool {
        self.loaded.is_some()
    }

    /// Set the goniometer flags of one sample.
    ///
    /// Loading a sample first unloads whichever other sample carried the flag
    /// (keeping its `has_been_loaded` history). Returns the displaced sample.
    pub fn set_loaded(
        &mut self,
        sample: ComponentId,
        loaded: bool,
        has_been_loaded: bool,
    ) -> ScResult<Option<ComponentId>> {
        self.require_sample(sample)?;

        let mut displaced = None;
        if loaded {
            if let Some(previous) = self.loaded.filter(|p| *p != sample) {
                if let Some(info) = self.components[previous.0].sample.as_mut() {
                    info.loaded = false;
                    info.has_been_loaded = true;
                }
                displaced = Some(previous);
            }
            self.loaded = Some(sample);
        } else if self.loaded == Some(sample) {
            self.loaded = None;
        }

        if let Some(info) = self.components[sample.0].sample.as_mut() {
            info.loaded = loaded;
            info.has_been_loaded = has_been_loaded;
        }
        Ok(displaced)
    }

    /// Replace the loaded sample with `new`, old one first.
    ///
    /// Returns `None` when `new` already is the loaded sample.
    pub fn replace_loaded(&mut self, new: Option<ComponentId>) -> ScResult<Option<LoadedChange>> {
        if let Some(id) = new {
            self.require_sample(id)?;
        }
        if self.loaded == new {
            return Ok(None);
        }
        let previous = self.loaded;
        if let Some(old) = previous {
            self.set_loaded(old, false, true)?;
        }
        if let Some(id) = new {
            self.set_loaded(id, true, true)?;
        }
        Ok(Some(LoadedChange {
            previous,
            current: new,
        }))
    }

    fn require_sample(&self, id: ComponentId) -> ScResult<()> {
        let node = self.node(id)?;
        if !node.is_sample() {
            return Err(ScError::InvalidSelection(format!(
                "{} ({}) is not a sample",
                node.address, node.kind
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Presence and scan info
    // =========================================================================

    /// Set presence info of a holder and cascade it to everything below.
    ///
    /// Samples below inherit `present`, lose their barcode and scan flag and
    /// forget their load history; the `loaded` flag itself is left to the
    /// loaded-sample reconciliation. Returns `true` if the holder's info
    /// changed.
    pub fn set_presence(
        &mut self,
        holder: ComponentId,
        present: bool,
        barcode: Option<String>,
        scanned: bool,
    ) -> ScResult<bool> {
        let node = self.node(holder)?;
        if !node.kind.is_holder() {
            return Err(ScError::InvalidSelection(format!(
                "{} ({}) is not a basket",
                node.address, node.kind
            )));
        }
        let barcode = if present { barcode } else { None };
        let changed = node.present != present || node.barcode != barcode || node.scanned != scanned;

        let mut stack: Vec<ComponentId> = node.children.clone();
        {
            let node = self.node_mut(holder)?;
            node.present = present;
            node.barcode = barcode;
            node.scanned = scanned;
        }
        while let Some(id) = stack.pop() {
            let child = &mut self.components[id.0];
            child.present = present;
            child.barcode = None;
            child.scanned = false;
            if let Some(info) = child.sample.as_mut() {
                info.has_been_loaded = info.loaded;
            }
            stack.extend(child.children.iter().copied());
        }
        Ok(changed)
    }

    /// Update presence/barcode of a single sample, e.g. after a scan.
    ///
    /// A sample in an absent holder stays absent and barcode-less. Returns
    /// `true` if anything changed.
    pub fn set_sample_info(
        &mut self,
        sample: ComponentId,
        present: bool,
        barcode: Option<String>,
        scanned: bool,
    ) -> ScResult<bool> {
        self.require_sample(sample)?;
        let holder_present = self
            .holder_of(sample)
            .and_then(|h| self.get(h))
            .is_some_and(|h| h.present);
        let (present, barcode, scanned) = if holder_present {
            (present, barcode.filter(|_| present), scanned)
        } else {
            (false, None, false)
        };

        let node = self.node_mut(sample)?;
        let changed = node.present != present || node.barcode != barcode || node.scanned != scanned;
        node.present = present;
        node.barcode = barcode;
        node.scanned = scanned;
        Ok(changed)
    }

    /// Re-initialize every info field, as after a device reset.
    ///
    /// Dewar holders start absent; plate components start present.
    pub fn reset_contents(&mut self) {
        let present = self.geometry.is_plate();
        for node in &mut self.components {
            node.present = present;
            node.scanned = false;
            node.barcode = None;
            node.selected = false;
            if let Some(info) = node.sample.as_mut() {
                info.loaded = false;
                info.has_been_loaded = false;
            }
        }
        if let Some(root) = self.components.first_mut() {
            root.present = true;
        }
        self.selection = Selection::default();
        self.loaded = None;
    }

    /// Verify the model invariants, describing the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let loaded: Vec<&Component> = self.samples().filter(|s| s.is_loaded()).collect();
        if loaded.len() > 1 {
            return Err(format!("{} samples flagged as loaded", loaded.len()));
        }
        let flagged = loaded.first().map(|s| s.id);
        if flagged != self.loaded {
            return Err(format!(
                "loaded sample {:?} does not match flagged sample {:?}",
                self.loaded, flagged
            ));
        }

        for &holder in &self.holders {
            let node = &self.components[holder.0];
            if node.present {
                continue;
            }
            for sample in self.descendant_samples(holder) {
                let s = &self.components[sample.0];
                if s.present || s.barcode.is_some() {
                    return Err(format!(
                        "sample {} present/barcoded in absent basket {}",
                        s.address, node.address
                    ));
                }
            }
        }

        if let Some(sample) = self.selection.sample {
            if self.holder_of(sample) != self.selection.basket {
                return Err(format!(
                    "selected sample {} is not inside the selected basket",
                    self.address(sample)
                ));
            }
        }
        Ok(())
    }
}
