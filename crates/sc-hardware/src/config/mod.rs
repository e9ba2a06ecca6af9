//! Sample-changer configuration: schema, per-driver defaults and loading.

pub mod loader;
pub mod profile;
pub mod schema;

pub use loader::{load_config, load_config_from_str, ConfigLoadError, ENV_PREFIX};
pub use schema::{
    available, ChangerConfig, ChannelNames, CommandNames, DriverKind, ExchangeStrategy,
    MountedSource, PresenceSource, TimingSettings,
};
