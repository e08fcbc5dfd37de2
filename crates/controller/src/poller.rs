//! Background device status poller.
//!
//! Every interval each active device is probed with a one-word holding
//! register read.  The bus lock is taken per probe so the control loop can
//! get in between devices.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{slave_address, SharedBus, TransportError};
use crate::db::{Db, Device, DeviceStatus};

async fn probe(bus: &SharedBus, device: &Device) -> Result<(), TransportError> {
    let slave = slave_address(device.slave_id)
        .ok_or_else(|| TransportError::Protocol(format!("slave id {} out of range 1-247", device.slave_id)))?;
    let mut bus = bus.lock().await;
    bus.read_holding_registers(slave, 0, 1).await?;
    Ok(())
}

/// Probe one device and persist the result.
pub async fn check_device(db: &Db, bus: &SharedBus, device: &Device) -> DeviceStatus {
    let was = device.status.as_str();
    let status = match probe(bus, device).await {
        Ok(()) => {
            if was == DeviceStatus::Offline.as_str() {
                info!(device = %device.name, slave = device.slave_id, "device back online");
            }
            DeviceStatus::Online
        }
        Err(e) if was == DeviceStatus::Offline.as_str() => {
            debug!(device = %device.name, slave = device.slave_id, "still offline: {e}");
            DeviceStatus::Offline
        }
        Err(e) => {
            warn!(device = %device.name, slave = device.slave_id, "device offline: {e}");
            DeviceStatus::Offline
        }
    };

    if let Err(e) = db.update_device_status(device.id, status).await {
        error!(device = %device.name, "failed to store device status: {e:#}");
    }
    status
}

/// One pass over all active devices.  Returns how many answered.
pub async fn sweep(db: &Db, bus: &SharedBus, stop: &watch::Receiver<bool>) -> usize {
    let devices = match db.load_active_devices().await {
        Ok(d) => d,
        Err(e) => {
            error!("status poller could not load devices: {e:#}");
            return 0;
        }
    };

    let mut online = 0;
    for device in &devices {
        if *stop.borrow() {
            break;
        }
        if check_device(db, bus, device).await == DeviceStatus::Online {
            online += 1;
        }
    }
    debug!(devices = devices.len(), online, "status sweep done");
    online
}

/// Run until `stop` turns true or its sender goes away.
pub async fn run(db: Db, bus: SharedBus, interval: Duration, mut stop: watch::Receiver<bool>) {
    info!(interval_sec = interval.as_secs(), "status poller started");

    while !*stop.borrow() {
        sweep(&db, &bus, &stop).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("status poller stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
