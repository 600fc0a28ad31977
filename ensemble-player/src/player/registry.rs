//! Remote device registry
//!
//! The set of known remote receivers, shared between the discovery thread
//! (advertisement appear/update/withdraw) and the player thread (selection
//! and session lifecycle). One mutex guards the whole set; the player
//! never holds it across a driver call, so every handler that reacquires
//! the lock re-verifies the device still exists.
//!
//! Device lifetime and advertisement lifetime are separate: a withdrawn
//! device stays registered while its session lives and is freed at session
//! teardown.

use crate::raop::{DeviceId, RemoteSpec, SessionId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::debug;

/// One known remote receiver.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    /// Display name (the part after `@` in the service name)
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// User wants this device in the active output set
    pub selected: bool,
    /// Currently announced by discovery
    pub advertised: bool,
    pub has_password: bool,
    pub password: Option<String>,
    /// Active driver session, if any
    pub session: Option<SessionId>,
}

impl Device {
    /// Connection parameters for the driver.
    pub fn spec(&self) -> RemoteSpec {
        RemoteSpec {
            id: self.id,
            name: self.name.clone(),
            address: self.address,
            port: self.port,
            password: self.password.clone(),
        }
    }
}

/// Mutex-guarded set of known devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with the device map locked.
    ///
    /// Callers must not invoke driver operations inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut HashMap<DeviceId, Device>) -> R) -> R {
        let mut devices = self.devices.lock().unwrap();
        f(&mut devices)
    }

    /// Insert a freshly advertised device, or refresh an existing entry
    /// (name/address/port/password are replaced on update).
    pub fn upsert_advertised(
        &self,
        id: DeviceId,
        name: String,
        address: IpAddr,
        port: u16,
        has_password: bool,
        password: Option<String>,
    ) {
        self.with(|devices| {
            let dev = devices.entry(id).or_insert_with(|| {
                debug!("Adding remote device {} ({:x})", name, id);
                Device {
                    id,
                    name: String::new(),
                    address,
                    port,
                    selected: false,
                    advertised: false,
                    has_password: false,
                    password: None,
                    session: None,
                }
            });

            dev.name = name;
            dev.address = address;
            dev.port = port;
            dev.has_password = has_password;
            dev.password = password;
            dev.advertised = true;
        });
    }

    /// Handle an advertisement withdrawal.
    ///
    /// Removes the device immediately when no session exists; otherwise it
    /// is kept (unadvertised) until session teardown. Returns false when
    /// the device was not known.
    pub fn withdraw(&self, id: DeviceId) -> bool {
        self.with(|devices| {
            let Some(dev) = devices.get_mut(&id) else {
                return false;
            };

            dev.advertised = false;
            if dev.session.is_none() {
                debug!("Removed remote device {:x}; stopped advertising", id);
                devices.remove(&id);
            }
            true
        })
    }

    /// Re-verify a device still exists after reacquiring the lock.
    pub fn contains(&self, id: DeviceId) -> bool {
        self.with(|devices| devices.contains_key(&id))
    }

    /// Drop a device that lost both its advertisement and its session.
    pub fn remove_if_defunct(&self, id: DeviceId) {
        self.with(|devices| {
            if devices
                .get(&id)
                .is_some_and(|d| !d.advertised && d.session.is_none())
            {
                debug!("Removed remote device {:x}; defunct", id);
                devices.remove(&id);
            }
        });
    }

    /// Known device ids, sorted for deterministic iteration.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.with(|devices| {
            let mut ids: Vec<DeviceId> = devices.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    /// Snapshot of the registry for speaker enumeration.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices = self.with(|devices| devices.values().cloned().collect::<Vec<_>>());
        devices.sort_unstable_by_key(|d| d.id);
        devices
    }

    pub fn is_empty(&self) -> bool {
        self.with(|devices| devices.is_empty())
    }
}
