//! Service discovery surface
//!
//! Remote receivers announce themselves as `_raop._tcp` services; an
//! external browser (mDNS) feeds [`BrowseEvent`]s into [`Discovery`],
//! which parses the advertisement and updates the device registry. Runs
//! on the discovery thread; the registry mutex is the only shared state.
//!
//! Advertisement format: the service name is `<hex-id>@<display name>`;
//! the TXT record carries a `pw` attribute (`"false"` = open). Withdrawal
//! is signaled with a negative port. Only IPv4 receivers are supported.

use crate::player::registry::DeviceRegistry;
use ensemble_common::events::{EventBus, PlayerEvent};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One browse callback from the service browser.
#[derive(Debug, Clone)]
pub struct BrowseEvent {
    /// Full service name (`<hex-id>@<display name>`)
    pub service_name: String,
    pub address: IpAddr,
    /// Negative = the device stopped advertising
    pub port: i32,
    /// TXT record key/value pairs
    pub txt: Vec<(String, String)>,
}

/// Discovery-side device bookkeeping.
pub struct Discovery {
    registry: Arc<DeviceRegistry>,
    /// Stored speaker passwords, keyed by display name
    passwords: HashMap<String, String>,
    bus: EventBus,
}

impl Discovery {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        passwords: HashMap<String, String>,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            passwords,
            bus,
        }
    }

    /// Apply one browse event to the registry.
    pub fn handle_event(&self, ev: BrowseEvent) {
        if !matches!(ev.address, IpAddr::V4(_)) {
            return;
        }

        let Some((id, display_name)) = parse_service_name(&ev.service_name) else {
            warn!("Could not parse device service name ({})", ev.service_name);
            return;
        };

        debug!("Found remote device {:x}/{} ({})", id, display_name, ev.port);

        if ev.port < 0 {
            if !self.registry.withdraw(id) {
                warn!(
                    "Device {} stopped advertising, but not in our list",
                    ev.service_name
                );
                return;
            }
        } else {
            let Some(has_password) = parse_password_flag(&ev.txt) else {
                warn!("Device {}: no usable pw field in TXT record", ev.service_name);
                return;
            };

            let password = if has_password {
                info!("Remote device {} is password-protected", ev.service_name);

                let stored = self.passwords.get(display_name).cloned();
                if stored.is_none() {
                    info!("No password known for remote device {}", ev.service_name);
                }
                stored
            } else {
                None
            };

            self.registry.upsert_advertised(
                id,
                display_name.to_string(),
                ev.address,
                ev.port as u16,
                has_password,
                password,
            );
        }

        self.bus.emit_lossy(PlayerEvent::DeviceChanged {
            device_id: id,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Split `<hex-id>@<display name>`.
fn parse_service_name(name: &str) -> Option<(u64, &str)> {
    let (hex, display) = name.split_once('@')?;
    let id = u64::from_str_radix(hex, 16).ok()?;
    if display.is_empty() {
        return None;
    }
    Some((id, display))
}

/// Read the `pw` TXT attribute; absent or valueless means unusable.
fn parse_password_flag(txt: &[(String, String)]) -> Option<bool> {
    txt.iter()
        .find(|(key, _)| key == "pw")
        .map(|(_, value)| value != "false")
}
