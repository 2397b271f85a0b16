//! Polling coordinator: discovers the account's devices once, then refreshes their
//! detail on demand or on a schedule, publishing a merged snapshot to subscribers.
//!
//! State machine:
//!
//! ```text
//! Uninitialized -> Discovering -> Ready <-> Refreshing
//!        \              |           |
//!         `-------------+-----------+--> Failed (terminal)
//! ```
//!
//! Concurrency
//! - At most one full refresh pass runs at a time; a pass requested while another is
//!   in flight is skipped, never queued.
//! - Commands and single-device refreshes may overlap a pass; the snapshot map is
//!   last-write-wins per device.
//! - After [`Coordinator::shutdown`] returns, no further snapshot writes happen and
//!   results of in-flight calls are discarded.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};

use crate::client::{ClientError, MarsHydroClient};
use crate::models::marshydro::{Device, DeviceId, ProductType};
use crate::normalize::NormalizerState;
use crate::transport::{Transport, UreqTransport};

pub const MANUFACTURER: &str = "Mars Hydro";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Uninitialized,
    Discovering,
    Ready,
    Refreshing,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub devices: BTreeMap<DeviceId, Device>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    Devices(usize),
    /// The account has no supported devices. Not fatal, but nothing will be polled.
    NoDevices,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub device: DeviceId,
    pub error: ClientError,
}

impl core::fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "device {}: {}", self.device, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Complete { updated: usize },
    /// Some devices failed; the others were published and the failed ones keep
    /// their previous snapshot entry.
    PartialFailure { updated: usize, failures: Vec<DeviceFailure> },
    /// Another pass was already in flight.
    Skipped,
    /// Teardown began during the pass; its results were dropped.
    Cancelled,
}

#[derive(Debug)]
pub enum SetupError {
    AlreadySetUp(CoordinatorState),
    /// Discovery failed; the host should retry later.
    NotReady(ClientError),
}

impl core::fmt::Display for SetupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SetupError::AlreadySetUp(s) => write!(f, "coordinator already set up (state {:?})", s),
            SetupError::NotReady(e) => write!(f, "device discovery failed, not ready: {}", e),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::NotReady(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    NotReady(CoordinatorState),
    ShutDown,
    Device(DeviceFailure),
    AllFailed(Vec<DeviceFailure>),
}

impl core::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CoordinatorError::NotReady(s) => write!(f, "coordinator not ready (state {:?})", s),
            CoordinatorError::ShutDown => write!(f, "coordinator is shut down"),
            CoordinatorError::Device(d) => write!(f, "{}", d),
            CoordinatorError::AllFailed(failures) => {
                write!(f, "update failed for all {} device(s)", failures.len())?;
                if let Some(first) = failures.first() {
                    write!(f, " (first: {})", first)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Device(d) => Some(&d.error),
            _ => None,
        }
    }
}

/// Metadata a host device registry needs to show a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: Option<&'static str>,
    pub sw_version: Option<String>,
}

pub fn registry_entry(device: &Device) -> RegistryEntry {
    let (model, label) = match device.product_type {
        ProductType::Light => (Some("FC 1500-EVO"), "EVO light"),
        ProductType::Wind => (Some("DF100-M"), "iFresh Fan"),
        ProductType::Other(_) => (None, MANUFACTURER),
    };
    RegistryEntry {
        identifier: format!("marshydro_{}", device.id),
        name: format!("{} - ({})", label, device.name),
        manufacturer: MANUFACTURER,
        model,
        sw_version: device.version.clone(),
    }
}

pub type SubscriptionId = u64;
type Subscriber = Arc<dyn Fn(&Snapshot) + Send + Sync>;

pub struct Coordinator<T: Transport = UreqTransport> {
    client: Arc<MarsHydroClient<T>>,
    state: Mutex<CoordinatorState>,
    device_ids: OnceLock<Vec<DeviceId>>,
    snapshot: RwLock<Snapshot>,
    normalizer: Mutex<NormalizerState>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    refresh_guard: Mutex<()>,
    shutting_down: AtomicBool,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Coordinator<T> {
    pub fn new(client: Arc<MarsHydroClient<T>>) -> Self {
        Coordinator {
            client,
            state: Mutex::new(CoordinatorState::Uninitialized),
            device_ids: OnceLock::new(),
            snapshot: RwLock::new(Snapshot::default()),
            normalizer: Mutex::new(NormalizerState::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            refresh_guard: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<MarsHydroClient<T>> {
        &self.client
    }

    pub fn state(&self) -> CoordinatorState {
        *lock(&self.state)
    }

    fn set_state(&self, next: CoordinatorState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Coordinator state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Device ids fixed at discovery; empty before it.
    pub fn device_ids(&self) -> &[DeviceId] {
        self.device_ids.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .get(&id)
            .cloned()
    }

    pub fn devices_of(&self, product_type: &ProductType) -> Vec<Device> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .values()
            .filter(|d| &d.product_type == product_type)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self, callback: impl Fn(&Snapshot) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Discovers the device set. Runs once per coordinator.
    pub fn setup(&self) -> Result<Discovery, SetupError> {
        {
            let mut state = lock(&self.state);
            if *state != CoordinatorState::Uninitialized {
                return Err(SetupError::AlreadySetUp(*state));
            }
            *state = CoordinatorState::Discovering;
        }
        info!("Discovering Mars Hydro devices");

        let devices = match self.client.list_devices() {
            Ok(d) => d,
            Err(e) => {
                error!("Device discovery failed: {}", e);
                self.set_state(CoordinatorState::Failed);
                return Err(SetupError::NotReady(e));
            }
        };

        let (supported, ignored): (Vec<Device>, Vec<Device>) =
            devices.into_iter().partition(|d| d.product_type.is_supported());
        for d in &ignored {
            debug!("Ignoring device {} of unsupported type {}", d.id, d.product_type.as_wire());
        }

        let mut ids: Vec<DeviceId> = supported.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != supported.len() {
            warn!("Device list repeated {} id(s); polling each once", supported.len() - ids.len());
        }
        let count = ids.len();
        let _ = self.device_ids.set(ids);
        if count > 0 {
            self.publish(supported);
        }
        self.set_state(CoordinatorState::Ready);

        if count == 0 {
            warn!("No supported devices found on the account; nothing to poll");
            Ok(Discovery::NoDevices)
        } else {
            info!("Discovered {} device(s)", count);
            Ok(Discovery::Devices(count))
        }
    }

    /// Runs a full refresh pass over every discovered device.
    pub fn refresh(&self) -> Result<RefreshOutcome, CoordinatorError> {
        let _pass = match self.refresh_guard.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Refresh already in flight; skipping");
                return Ok(RefreshOutcome::Skipped);
            }
        };
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }
        {
            let mut state = lock(&self.state);
            if *state != CoordinatorState::Ready {
                return Err(CoordinatorError::NotReady(*state));
            }
            *state = CoordinatorState::Refreshing;
        }

        let mut fresh = Vec::new();
        let mut failures = Vec::new();
        for &id in self.device_ids() {
            if self.is_shut_down() {
                break;
            }
            match self.client.get_device_detail(id) {
                Ok(d) => fresh.push(d),
                Err(error) => {
                    warn!("Refresh of device {} failed: {}", id, error);
                    failures.push(DeviceFailure { device: id, error });
                }
            }
        }

        if self.is_shut_down() {
            info!("Teardown during refresh; discarding {} result(s)", fresh.len());
            self.set_state(CoordinatorState::Ready);
            return Ok(RefreshOutcome::Cancelled);
        }

        if fresh.is_empty() && !failures.is_empty() {
            let unrecoverable = failures
                .iter()
                .all(|f| matches!(f.error, ClientError::Authentication(_)));
            if unrecoverable {
                error!("Authentication rejected for every device; coordinator failed");
                self.set_state(CoordinatorState::Failed);
            } else {
                self.set_state(CoordinatorState::Ready);
            }
            return Err(CoordinatorError::AllFailed(failures));
        }

        let updated = fresh.len();
        if updated > 0 && !self.publish(fresh) {
            self.set_state(CoordinatorState::Ready);
            return Ok(RefreshOutcome::Cancelled);
        }
        self.set_state(CoordinatorState::Ready);

        if failures.is_empty() {
            debug!("Refresh complete: {} device(s)", updated);
            Ok(RefreshOutcome::Complete { updated })
        } else {
            Ok(RefreshOutcome::PartialFailure { updated, failures })
        }
    }

    /// Refreshes one device, e.g. right after a command. Touches only that entry.
    pub fn refresh_device(&self, id: DeviceId) -> Result<Device, CoordinatorError> {
        self.ensure_usable(id)?;
        let device = self
            .client
            .get_device_detail(id)
            .map_err(|error| CoordinatorError::Device(DeviceFailure { device: id, error }))?;
        if !self.publish(vec![device]) {
            return Err(CoordinatorError::ShutDown);
        }
        self.device(id).ok_or(CoordinatorError::ShutDown)
    }

    pub fn set_brightness(&self, id: DeviceId, percentage: u8) -> Result<Device, CoordinatorError> {
        self.ensure_usable(id)?;
        self.client
            .set_brightness(id, percentage)
            .map_err(|error| CoordinatorError::Device(DeviceFailure { device: id, error }))?;
        self.refresh_device(id)
    }

    pub fn toggle_power(&self, id: DeviceId, closed: bool) -> Result<Device, CoordinatorError> {
        self.ensure_usable(id)?;
        self.client
            .toggle_power(id, closed)
            .map_err(|error| CoordinatorError::Device(DeviceFailure { device: id, error }))?;
        self.refresh_device(id)
    }

    fn ensure_usable(&self, id: DeviceId) -> Result<(), CoordinatorError> {
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown);
        }
        match self.state() {
            CoordinatorState::Ready | CoordinatorState::Refreshing => {}
            other => return Err(CoordinatorError::NotReady(other)),
        }
        if !self.device_ids().contains(&id) {
            return Err(CoordinatorError::Device(DeviceFailure {
                device: id,
                error: ClientError::NotFound(id),
            }));
        }
        Ok(())
    }

    /// Normalizes and merges `devices` into the snapshot, then notifies subscribers
    /// once. Returns `false` when teardown had already begun and nothing was written.
    fn publish(&self, devices: Vec<Device>) -> bool {
        let published = {
            let mut snap = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_shut_down() {
                return false;
            }
            // lock order: snapshot, then normalizer
            let mut normalizer = lock(&self.normalizer);
            for mut d in devices {
                normalizer.apply(&mut d);
                snap.devices.insert(d.id, d);
            }
            snap.updated_at = Some(Utc::now());
            snap.clone()
        };

        let subscribers: Vec<Subscriber> = lock(&self.subscribers).iter().map(|(_, s)| s.clone()).collect();
        for s in subscribers {
            s(&published);
        }
        true
    }

    /// Begins teardown. Once this returns no snapshot write happens anymore.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // wait out a write that raced the flag
        drop(self.snapshot.write().unwrap_or_else(PoisonError::into_inner));
        lock(&self.subscribers).clear();
        info!("Coordinator shut down");
    }
}
