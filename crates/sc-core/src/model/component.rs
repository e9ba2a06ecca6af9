//! Component nodes of the sample-changer tree.

use serde::Serialize;

/// Index of a component inside its [`ChangerModel`](super::ChangerModel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ComponentId(pub usize);

/// Closed set of component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Root of the tree (the changer itself).
    Dewar,
    /// Removable puck holding pins.
    Basket,
    /// Plate well.
    Cell,
    /// Drop inside a plate well.
    Drop,
    /// Sample pin in a basket.
    Pin,
    /// Crystal in a plate drop.
    Xtal,
}

impl ComponentKind {
    /// Leaves that can be loaded on the goniometer.
    pub fn is_sample(&self) -> bool {
        matches!(self, ComponentKind::Pin | ComponentKind::Xtal)
    }

    /// Holders that can be the selected component.
    pub fn is_holder(&self) -> bool {
        matches!(self, ComponentKind::Basket | ComponentKind::Cell)
    }

    /// Display name of the kind.
    pub fn label(&self) -> &'static str {
        match self {
            ComponentKind::Dewar => "Dewar",
            ComponentKind::Basket => "Puck",
            ComponentKind::Cell => "Cell",
            ComponentKind::Drop => "Drop",
            ComponentKind::Pin => "Pin",
            ComponentKind::Xtal => "Xtal",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Standard pin holder length in mm.
pub const STD_HOLDER_LENGTH: f64 = 22.0;

/// Goniometer bookkeeping carried by sample leaves only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleInfo {
    /// Currently mounted on the goniometer.
    pub loaded: bool,
    /// Was mounted at some point since the tree was (re)initialized.
    pub has_been_loaded: bool,
    /// Pin holder length in mm.
    pub holder_length: f64,
}

impl Default for SampleInfo {
    fn default() -> Self {
        Self {
            loaded: false,
            has_been_loaded: false,
            holder_length: STD_HOLDER_LENGTH,
        }
    }
}

/// A node in the component tree.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
    /// Index in the owning tree.
    pub id: ComponentId,
    /// Node kind.
    pub kind: ComponentKind,
    /// Unique address, e.g. `"3:07"`.
    pub address: String,
    /// Zero-based position among the parent's children.
    pub index: usize,
    /// `None` for the root.
    pub parent: Option<ComponentId>,
    /// Children in position order.
    pub children: Vec<ComponentId>,
    /// Physically in place, as last reported or scanned.
    pub present: bool,
    /// Barcode read by the last scan.
    pub scanned: bool,
    /// Last barcode read.
    pub barcode: Option<String>,
    /// Part of the current selection.
    pub selected: bool,
    /// `Some` exactly when `kind.is_sample()`.
    pub sample: Option<SampleInfo>,
}

impl Component {
    pub(crate) fn new(
        id: ComponentId,
        kind: ComponentKind,
        address: String,
        index: usize,
        parent: Option<ComponentId>,
    ) -> Self {
        Self {
            id,
            kind,
            address,
            index,
            parent,
            children: Vec::new(),
            present: false,
            scanned: false,
            barcode: None,
            selected: false,
            sample: kind.is_sample().then(SampleInfo::default),
        }
    }

    /// Whether this node can be loaded.
    pub fn is_sample(&self) -> bool {
        self.kind.is_sample()
    }

    /// Currently on the goniometer.
    pub fn is_loaded(&self) -> bool {
        self.sample.as_ref().is_some_and(|s| s.loaded)
    }

    /// Mounted at least once since the last reset.
    pub fn has_been_loaded(&self) -> bool {
        self.sample.as_ref().is_some_and(|s| s.has_been_loaded)
    }

    /// 1-based position among siblings (basket number, vial number, drop number).
    pub fn number(&self) -> usize {
        self.index + 1
    }
}
