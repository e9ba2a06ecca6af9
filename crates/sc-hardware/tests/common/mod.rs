//! Shared fixtures: a controller wired to an instant-mode mock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};

use sc_core::capabilities::{ChannelUpdate, Commandable, Pollable, TaskId};
use sc_core::events::ChangerEvent;
use sc_core::model::Geometry;
use sc_driver_mock::{MockProfile, MockSampleChanger};
use sc_hardware::{ChangerConfig, DriverKind, SampleChanger, TimingSettings};

pub fn config(driver: DriverKind, geometry: Geometry) -> ChangerConfig {
    ChangerConfig::new("test-sc", driver, geometry).with_timing(TimingSettings::fast())
}

pub fn attach(mock: &MockSampleChanger, config: ChangerConfig) -> Arc<SampleChanger> {
    Arc::new(SampleChanger::new(config, Arc::new(mock.clone())).unwrap())
}

/// Generic-driver changer with `baskets` unipucks, synced once.
pub async fn pucks(baskets: usize) -> (MockSampleChanger, Arc<SampleChanger>) {
    let mock = MockSampleChanger::new(Geometry::unipucks(baskets)).unwrap();
    let changer = attach(&mock, config(DriverKind::Generic, Geometry::unipucks(baskets)));
    changer.resync().await;
    (mock, changer)
}

/// Changer and mock for `driver`, synced once.
pub async fn rig(
    driver: DriverKind,
    profile: MockProfile,
    geometry: Geometry,
) -> (MockSampleChanger, Arc<SampleChanger>) {
    let mock = MockSampleChanger::builder(geometry.clone())
        .profile(profile)
        .build()
        .unwrap();
    let changer = attach(&mock, config(driver, geometry));
    changer.resync().await;
    (mock, changer)
}

/// Everything queued on `rx` right now.
pub fn drain(rx: &mut broadcast::Receiver<ChangerEvent>) -> Vec<ChangerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn assert_consistent(changer: &SampleChanger) {
    changer.with_model(|m| m.check_invariants()).unwrap();
}

/// Mock wrapper that can hold one read of `channel` until released.
pub struct GatedDevice {
    inner: MockSampleChanger,
    channel: &'static str,
    armed: AtomicBool,
    /// Notified when an armed read is held.
    pub reached: Notify,
    /// Lets the held read continue.
    pub release: Notify,
}

impl GatedDevice {
    pub fn new(inner: MockSampleChanger, channel: &'static str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            channel,
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Hold the next read of the gated channel.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Pollable for GatedDevice {
    async fn read_channel(&self, channel: &str) -> Result<Value> {
        if channel == self.channel && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.read_channel(channel).await
    }

    async fn write_channel(&self, channel: &str, value: Value) -> Result<()> {
        self.inner.write_channel(channel, value).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChannelUpdate>> {
        self.inner.subscribe()
    }
}

#[async_trait]
impl Commandable for GatedDevice {
    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Option<TaskId>> {
        self.inner.execute_command(command, args).await
    }
}

/// Generic-driver changer over a gated mock, synced once with the gate open.
pub async fn gated_pucks(
    baskets: usize,
    channel: &'static str,
) -> (MockSampleChanger, Arc<GatedDevice>, Arc<SampleChanger>) {
    let mock = MockSampleChanger::new(Geometry::unipucks(baskets)).unwrap();
    let gate = GatedDevice::new(mock.clone(), channel);
    let changer = Arc::new(
        SampleChanger::new(
            config(DriverKind::Generic, Geometry::unipucks(baskets)),
            gate.clone(),
        )
        .unwrap(),
    );
    changer.resync().await;
    (mock, gate, changer)
}
