//! Sample-changer controller: selection and the load/unload protocol.
//!
//! [`SampleChanger`] ties together the component tree, a device transport,
//! the task executor and the event bus. It is meant to be shared behind an
//! `Arc`; every operation takes `&self`.
//!
//! # Load protocol
//!
//! 1. Select the target if given (a no-op when already selected).
//! 2. The selection must include a sample, else `NoSampleSelected`.
//! 3. Arm power must be on, else `DeviceDisabled`.
//! 4. Loading the mounted sample again is `AlreadyLoaded`.
//! 5. With another sample mounted, exchange it according to the configured
//!    [`ExchangeStrategy`]; otherwise dispatch a plain load.
//! 6. Update the loaded-sample bookkeeping, old sample first.
//!
//! Steps 2-4 fail before any command reaches the device, and before the
//! executor slot is claimed; power and the mounted sample are checked again
//! once the slot is held. Errors raised after dispatch leave the bookkeeping
//! untouched; the next resync reconciles it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use sc_core::capabilities::{ChangerDevice, SignalEmitter};
use sc_core::error::{ScError, ScResult};
use sc_core::events::{ChangerEvent, EventBus};
use sc_core::model::{ChangerModel, ComponentId, ComponentKind, PlateInfo, Selection, Target};
use sc_core::observable::Observable;
use sc_core::state::{evaluate, SampleChangerMode, SampleChangerState, StateInputs, TaskKind};

use crate::config::{available, ChangerConfig, ExchangeStrategy};
use crate::device::DeviceIo;
use crate::executor::{ActionGuard, TaskExecutor};
use crate::resync::Telemetry;

/// Controller for one sample changer.
pub struct SampleChanger {
    pub(crate) config: ChangerConfig,
    pub(crate) io: Arc<DeviceIo>,
    pub(crate) executor: TaskExecutor,
    pub(crate) model: Mutex<ChangerModel>,
    pub(crate) state: Observable<SampleChangerState>,
    /// Device readings of the last resync tick.
    pub(crate) inputs: Mutex<StateInputs>,
    pub(crate) charging: AtomicBool,
    pub(crate) telemetry: Telemetry,
    pub(crate) events: EventBus,
}

impl std::fmt::Debug for SampleChanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleChanger")
            .field("name", &self.config.name)
            .field("driver", &self.config.driver)
            .field("state", &self.state.get())
            .field("in_flight", &self.executor.in_flight())
            .finish()
    }
}

impl SampleChanger {
    /// Build the component tree for `config` and attach `device`.
    ///
    /// The state starts `Unknown` until the first resync.
    pub fn new(config: ChangerConfig, device: Arc<dyn ChangerDevice>) -> ScResult<Self> {
        config
            .validate()
            .map_err(|errors| ScError::Configuration(errors.join("; ")))?;

        let model = ChangerModel::new(config.name.clone(), config.geometry.clone())?;
        let io = Arc::new(DeviceIo::new(device, &config));
        let executor = TaskExecutor::new(Arc::clone(&io), config.timing);

        info!(
            changer = %config.name,
            driver = %config.driver,
            samples = model.samples().count(),
            "sample changer initialized"
        );

        Ok(Self {
            state: Observable::new(format!("{}.state", config.name), SampleChangerState::Unknown),
            config,
            io,
            executor,
            model: Mutex::new(model),
            inputs: Mutex::new(StateInputs::default()),
            charging: AtomicBool::new(false),
            telemetry: Telemetry::default(),
            events: EventBus::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Changer name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration in use.
    pub fn config(&self) -> &ChangerConfig {
        &self.config
    }

    /// Current effective state.
    pub fn state(&self) -> SampleChangerState {
        self.state.get()
    }

    /// Receiver updated on every state change.
    pub fn watch_state(&self) -> watch::Receiver<SampleChangerState> {
        self.state.subscribe()
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangerEvent> {
        self.events.subscribe()
    }

    /// Operation mode set by [`change_mode`](Self::change_mode).
    pub fn mode(&self) -> SampleChangerMode {
        if self.charging.load(Ordering::SeqCst) {
            SampleChangerMode::Charging
        } else {
            SampleChangerMode::Normal
        }
    }

    /// Action currently owning the executor.
    pub fn in_flight(&self) -> Option<TaskKind> {
        self.executor.in_flight()
    }

    /// Run `f` against the component tree.
    pub fn with_model<R>(&self, f: impl FnOnce(&ChangerModel) -> R) -> R {
        f(&self.model.lock())
    }

    /// Current selection.
    pub fn selection(&self) -> Selection {
        self.model.lock().selection()
    }

    /// Sample tracked on the goniometer.
    pub fn loaded_sample(&self) -> Option<ComponentId> {
        self.model.lock().loaded_sample()
    }

    /// Address of the sample tracked on the goniometer.
    pub fn loaded_sample_address(&self) -> Option<String> {
        let model = self.model.lock();
        model.loaded_sample().map(|id| model.address(id).to_string())
    }

    /// Whether a sample is tracked on the goniometer.
    pub fn has_loaded_sample(&self) -> bool {
        self.model.lock().has_loaded_sample()
    }

    /// Plate dimensions, for plate geometries.
    pub fn plate_info(&self) -> Option<PlateInfo> {
        self.model.lock().plate_info()
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Re-evaluate the state from the last readings and local knowledge,
    /// emitting `StateChanged` on a change.
    pub(crate) fn publish_state(&self) -> Option<(SampleChangerState, SampleChangerState)> {
        let inputs = StateInputs {
            in_flight: self.executor.in_flight(),
            charging: self.charging.load(Ordering::SeqCst),
            has_loaded_sample: self.model.lock().has_loaded_sample(),
            ..*self.inputs.lock()
        };
        let current = evaluate(&inputs);
        let previous = self.state.set_if_changed(current)?;
        info!(changer = %self.config.name, %previous, %current, "state changed");
        self.events
            .emit(ChangerEvent::StateChanged { previous, current });
        Some((previous, current))
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Select a holder or sample. Local only; no device I/O.
    pub fn select(&self, target: impl Into<Target>) -> ScResult<Selection> {
        let target = target.into();
        let mut model = self.model.lock();
        let changed = model.select(&target)?;
        let selection = model.selection();
        if changed {
            let event = ChangerEvent::SelectionChanged {
                basket: selection.basket.map(|id| model.address(id).to_string()),
                sample: selection.sample.map(|id| model.address(id).to_string()),
            };
            drop(model);
            debug!(changer = %self.config.name, %target, "selection changed");
            self.events.emit(event);
        }
        Ok(selection)
    }

    // =========================================================================
    // Load / unload
    // =========================================================================

    /// Load `target`, or the selected sample when `None`.
    pub async fn load(&self, target: Option<Target>) -> ScResult<ComponentId> {
        if let Some(target) = target {
            self.select(target)?;
        }
        let sample = self
            .model
            .lock()
            .selected_sample()
            .ok_or(ScError::NoSampleSelected)?;
        self.check_not_loaded(sample)?;
        self.require_power().await?;

        let guard = self.executor.begin(TaskKind::Load)?;
        let result = self.run_load(&guard, sample).await;
        drop(guard);
        self.settle_state().await;
        result
    }

    async fn run_load(&self, guard: &ActionGuard<'_>, sample: ComponentId) -> ScResult<ComponentId> {
        self.require_power().await?;
        self.check_not_loaded(sample)?;

        let (address, previous) = {
            let model = self.model.lock();
            let previous = model.loaded_sample().map(|id| model.address(id).to_string());
            (model.address(sample).to_string(), previous)
        };

        self.publish_state();
        let commands = self.io.commands();

        match (previous, self.config.exchange_strategy()) {
            (Some(old), ExchangeStrategy::Chained) => {
                let command = available(&commands.chained_load)
                    .ok_or_else(|| ScError::Unsupported("chained load".to_string()))?;
                info!(changer = %self.config.name, from = %old, to = %address, "chained load");
                guard.execute(command, &[json!(old), json!(address)]).await?;
            }
            (Some(old), ExchangeStrategy::UnloadThenLoad) => {
                info!(changer = %self.config.name, from = %old, to = %address, "unload then load");
                guard.execute(&commands.unload, &[json!(old)]).await?;
                self.apply_loaded(None)?;
                guard.execute(&commands.load, &[json!(address)]).await?;
            }
            _ => {
                info!(changer = %self.config.name, %address, "load");
                guard.execute(&commands.load, &[json!(address)]).await?;
            }
        }

        self.apply_loaded(Some(sample))?;

        if self.config.scan_on_load {
            match self.io.barcode().await {
                Ok(barcode) => self.update_scan_info(sample, barcode)?,
                Err(e) => warn!(changer = %self.config.name, %address, error = %e, "barcode refresh failed"),
            }
        }
        Ok(sample)
    }

    /// Unload the sample tracked on the goniometer.
    pub async fn unload(&self) -> ScResult<ComponentId> {
        if !self.has_loaded_sample() {
            return Err(ScError::NoSampleLoaded);
        }
        self.require_power().await?;

        let guard = self.executor.begin(TaskKind::Unload)?;
        let result = self.run_unload(&guard).await;
        drop(guard);
        self.settle_state().await;
        result
    }

    async fn run_unload(&self, guard: &ActionGuard<'_>) -> ScResult<ComponentId> {
        let (sample, address) = {
            let model = self.model.lock();
            let sample = model.loaded_sample().ok_or(ScError::NoSampleLoaded)?;
            (sample, model.address(sample).to_string())
        };
        self.require_power().await?;

        self.publish_state();
        info!(changer = %self.config.name, %address, "unload");
        guard
            .execute(&self.io.commands().unload, &[json!(address)])
            .await?;
        self.apply_loaded(None)?;
        Ok(sample)
    }

    fn check_not_loaded(&self, sample: ComponentId) -> ScResult<()> {
        let model = self.model.lock();
        if model.loaded_sample() == Some(sample) {
            return Err(ScError::AlreadyLoaded(model.address(sample).to_string()));
        }
        Ok(())
    }

    async fn require_power(&self) -> ScResult<()> {
        if !self.io.arm_powered().await? {
            warn!(changer = %self.config.name, "arm power is off");
            return Err(ScError::DeviceDisabled(self.config.name.clone()));
        }
        Ok(())
    }

    /// Replace the loaded sample, emitting `LoadedSampleChanged` on a change.
    pub(crate) fn apply_loaded(
        &self,
        sample: Option<ComponentId>,
    ) -> ScResult<Option<(Option<String>, Option<String>)>> {
        let mut model = self.model.lock();
        let Some(change) = model.replace_loaded(sample)? else {
            return Ok(None);
        };
        let previous = change.previous.map(|id| model.address(id).to_string());
        let current = change.current.map(|id| model.address(id).to_string());
        drop(model);

        debug!(changer = %self.config.name, ?previous, ?current, "loaded sample changed");
        self.events.emit(ChangerEvent::LoadedSampleChanged {
            address: current.clone(),
        });
        Ok(Some((previous, current)))
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Read barcodes of a sample, a basket or (recursively) the whole dewar.
    ///
    /// Returns the samples whose info was refreshed.
    pub async fn scan(&self, target: impl Into<Target>, recursive: bool) -> ScResult<Vec<ComponentId>> {
        let target = target.into();
        let (samples, baskets) = {
            let model = self.model.lock();
            if model.geometry().is_plate() {
                return Err(ScError::InvalidSelection(
                    "plate components cannot be scanned".to_string(),
                ));
            }
            let id = model.resolve(&target)?;
            match model.get(id).map(|c| c.kind) {
                Some(ComponentKind::Pin) => (vec![id], Vec::new()),
                Some(ComponentKind::Basket) => (Vec::new(), vec![id]),
                Some(ComponentKind::Dewar) if recursive => {
                    let present = model
                        .holders()
                        .iter()
                        .copied()
                        .filter(|h| model.get(*h).is_some_and(|c| c.present))
                        .collect();
                    (Vec::new(), present)
                }
                Some(ComponentKind::Dewar) => {
                    return Err(ScError::InvalidSelection(
                        "scanning the whole dewar requires recursive".to_string(),
                    ))
                }
                _ => {
                    return Err(ScError::InvalidSelection(format!(
                        "{} cannot be scanned",
                        target
                    )))
                }
            }
        };

        let guard = self.executor.begin(TaskKind::Scan)?;
        self.publish_state();
        let result = self.run_scan(&guard, samples, baskets).await;
        drop(guard);
        self.settle_state().await;
        result
    }

    async fn run_scan(
        &self,
        guard: &ActionGuard<'_>,
        samples: Vec<ComponentId>,
        baskets: Vec<ComponentId>,
    ) -> ScResult<Vec<ComponentId>> {
        let mut scanned = Vec::new();
        for basket in baskets {
            scanned.extend(self.scan_basket(guard, basket).await?);
        }
        for sample in samples {
            self.scan_sample(guard, sample).await?;
            scanned.push(sample);
        }
        Ok(scanned)
    }

    async fn scan_sample(&self, guard: &ActionGuard<'_>, sample: ComponentId) -> ScResult<()> {
        let command = available(&self.io.commands().scan_sample)
            .ok_or_else(|| ScError::Unsupported("scan sample".to_string()))?;
        let address = self.model.lock().address(sample).to_string();
        guard.execute(command, &[json!(address)]).await?;
        let barcode = self.io.barcode().await?;
        debug!(changer = %self.config.name, %address, ?barcode, "sample scanned");
        self.update_scan_info(sample, barcode)
    }

    async fn scan_basket(
        &self,
        guard: &ActionGuard<'_>,
        basket: ComponentId,
    ) -> ScResult<Vec<ComponentId>> {
        let (address, samples) = {
            let model = self.model.lock();
            (model.address(basket).to_string(), model.descendant_samples(basket))
        };

        let Some(command) = available(&self.io.commands().scan_basket) else {
            for sample in &samples {
                self.scan_sample(guard, *sample).await?;
            }
            return Ok(samples);
        };

        guard.execute(command, &[json!(address)]).await?;
        let barcodes = self.io.basket_barcodes().await?.unwrap_or_default();
        debug!(changer = %self.config.name, %address, found = barcodes.iter().flatten().count(), "basket scanned");
        for (i, sample) in samples.iter().enumerate() {
            let barcode = barcodes.get(i).cloned().flatten();
            self.update_scan_info(*sample, barcode)?;
        }
        Ok(samples)
    }

    /// Store a scan result; an empty read clears `scanned` and the barcode.
    fn update_scan_info(&self, sample: ComponentId, barcode: Option<String>) -> ScResult<()> {
        let mut model = self.model.lock();
        let present = barcode.is_some() || model.get(sample).is_some_and(|c| c.present);
        let scanned = barcode.is_some();
        if model.set_sample_info(sample, present, barcode, scanned)? {
            let address = model.address(sample).to_string();
            drop(model);
            self.events.emit(ChangerEvent::InfoChanged { address });
        }
        Ok(())
    }

    // =========================================================================
    // Abort and mode
    // =========================================================================

    /// Cancel the in-flight trajectory. The waiting action returns `Aborted`.
    pub async fn abort(&self) -> ScResult<()> {
        self.executor.abort().await
    }

    /// Switch between normal operation and charging (transfer) mode.
    pub async fn change_mode(&self, mode: SampleChangerMode) -> ScResult<()> {
        if let Some(in_flight) = self.executor.in_flight() {
            return Err(ScError::Busy { in_flight });
        }
        if let Some(command) = available(&self.io.commands().set_phase) {
            let phase = match mode {
                SampleChangerMode::Charging => "Transfer",
                SampleChangerMode::Normal => "Centring",
            };
            self.io.dispatch(command, &[Value::from(phase)]).await?;
        }
        self.charging
            .store(mode == SampleChangerMode::Charging, Ordering::SeqCst);
        info!(changer = %self.config.name, ?mode, "mode changed");
        self.publish_state();
        Ok(())
    }
}
