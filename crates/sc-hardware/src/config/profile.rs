//! Per-driver defaults.
//!
//! | driver | raw states | presence | mounted sample | exchange |
//! |--------|-----------|----------|----------------|----------|
//! | isara2 | ALARM ON OFF FAULT RUNNING | bool list | indices, 1-based | chained |
//! | grob | ALARM ON RUNNING MOVING FAULT | bool list | indices, 0-based | chained |
//! | marvin | ALARM IDL BSY | bitmask + mounted puck | indices, 1-based | unload, load |
//! | plate_manipulator | ALARM FAULT MOVING RUNNING READY | none | plate location | direct |
//! | generic | union of the above | bool list | indices, 1-based | chained |
//!
//! No table maps to `Charging`: that state only follows an explicit mode change.

use sc_core::state::{SampleChangerState as S, StateMap};

use super::schema::{DriverKind, ExchangeStrategy, MountedSource, PresenceSource};

const ISARA2: &[(&str, S)] = &[
    ("ALARM", S::Alarm),
    ("ON", S::Ready),
    ("OFF", S::StandBy),
    ("FAULT", S::Fault),
    ("RUNNING", S::Moving),
];

const GROB: &[(&str, S)] = &[
    ("ALARM", S::Alarm),
    ("ON", S::Ready),
    ("RUNNING", S::Moving),
    ("MOVING", S::Moving),
    ("FAULT", S::Fault),
];

const MARVIN: &[(&str, S)] = &[("ALARM", S::Alarm), ("IDL", S::Ready), ("BSY", S::Moving)];

const PLATE_MANIPULATOR: &[(&str, S)] = &[
    ("ALARM", S::Alarm),
    ("FAULT", S::Fault),
    ("MOVING", S::Moving),
    ("RUNNING", S::Moving),
    ("READY", S::Ready),
];

/// Raw-state table of `driver`.
pub fn state_table(driver: DriverKind) -> StateMap {
    let pairs = |table: &'static [(&'static str, S)]| table.iter().copied();
    match driver {
        DriverKind::Isara2 => StateMap::from_pairs(pairs(ISARA2)),
        DriverKind::Grob => StateMap::from_pairs(pairs(GROB)),
        DriverKind::Marvin => StateMap::from_pairs(pairs(MARVIN)),
        DriverKind::PlateManipulator => StateMap::from_pairs(pairs(PLATE_MANIPULATOR)),
        DriverKind::Generic => StateMap::from_pairs(
            pairs(ISARA2)
                .chain(pairs(GROB))
                .chain(pairs(MARVIN))
                .chain(pairs(PLATE_MANIPULATOR)),
        ),
    }
}

/// Presence layout of `driver`.
pub fn default_presence(driver: DriverKind) -> PresenceSource {
    match driver {
        DriverKind::Marvin => PresenceSource::Bitmask {
            mounted_puck_override: true,
        },
        DriverKind::PlateManipulator => PresenceSource::Unavailable,
        DriverKind::Isara2 | DriverKind::Grob | DriverKind::Generic => PresenceSource::BoolList,
    }
}

/// Mounted-sample layout of `driver`.
pub fn default_mounted(driver: DriverKind) -> MountedSource {
    match driver {
        DriverKind::Grob => MountedSource::Indices { zero_based: true },
        DriverKind::PlateManipulator => MountedSource::PlateLocation,
        DriverKind::Isara2 | DriverKind::Marvin | DriverKind::Generic => {
            MountedSource::Indices { zero_based: false }
        }
    }
}

/// Exchange strategy of `driver`.
pub fn default_exchange(driver: DriverKind) -> ExchangeStrategy {
    match driver {
        DriverKind::Marvin => ExchangeStrategy::UnloadThenLoad,
        DriverKind::PlateManipulator => ExchangeStrategy::Direct,
        DriverKind::Isara2 | DriverKind::Grob | DriverKind::Generic => ExchangeStrategy::Chained,
    }
}
