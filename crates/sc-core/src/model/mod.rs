//! Entity model: the tree of dewar, holders and samples.

pub mod address;
pub mod changer;
pub mod component;
pub mod geometry;

pub use changer::{ChangerModel, LoadedChange, PlateInfo, Selection, Target};
pub use component::{Component, ComponentId, ComponentKind, SampleInfo, STD_HOLDER_LENGTH};
pub use geometry::{BasketType, Geometry};
