//! BLE Connection Module
//!
//! [`BtleplugAdapter`] implements [`BleAdapter`] on top of btleplug. Each
//! request runs on its own tokio task and reports back through the adapter
//! event queue; nothing here blocks the session.

use crate::domain::models::{CharacteristicHandle, PeripheralId, ServiceHandle};
use crate::infrastructure::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::infrastructure::bluetooth::scanner::{self, BleScanner};
use anyhow::Result;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Look up a peripheral the adapter has already seen
async fn find_peripheral(adapter: &Adapter, id: &PeripheralId) -> Result<Peripheral> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.id().to_string() == id.0 {
            return Ok(peripheral);
        }
    }
    anyhow::bail!("Peripheral {} not known to adapter", id)
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
        .ok_or_else(|| anyhow::anyhow!("Characteristic {} not found", handle.uuid))
}

fn characteristic_handle(peripheral: &PeripheralId, c: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle {
        peripheral: peripheral.clone(),
        service_uuid: c.service_uuid,
        uuid: c.uuid,
    }
}

type GattJob = BoxFuture<'static, ()>;

/// Run queued jobs one at a time, in the order they were sent
fn spawn_gatt_worker() -> (mpsc::UnboundedSender<GattJob>, JoinHandle<()>) {
    let (queue, mut jobs) = mpsc::unbounded_channel::<GattJob>();
    let worker = tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            job.await;
        }
    });
    (queue, worker)
}

/// Production adapter backed by the first host Bluetooth adapter
pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
    scanner: BleScanner,
    event_sender: mpsc::UnboundedSender<AdapterEvent>,
    /// Notification pumps, one per connected peripheral
    links: HashMap<PeripheralId, JoinHandle<()>>,
    /// Subscribe and write requests, run one after another in request order
    gatt_queue: mpsc::UnboundedSender<GattJob>,
    gatt_worker: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first host adapter and start forwarding its events
    pub async fn new(event_sender: mpsc::UnboundedSender<AdapterEvent>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;

        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter: {}", name),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let mut scanner = BleScanner::new(adapter.clone(), event_sender.clone());
        scanner.spawn_event_pump();

        let state = match adapter.adapter_state().await {
            Ok(state) => scanner::adapter_state(state),
            Err(e) => {
                warn!("Adapter state unavailable: {}", e);
                scanner::adapter_state_from_error(&e)
            }
        };
        info!(?state, "Initial adapter state");
        let _ = event_sender.send(AdapterEvent::StateChanged(state));

        let (gatt_queue, gatt_worker) = spawn_gatt_worker();

        Ok(Self {
            _manager: manager,
            adapter,
            scanner,
            event_sender,
            links: HashMap::new(),
            gatt_queue,
            gatt_worker,
        })
    }

    /// Run `job` on its own task with a clone of the host adapter and the
    /// event queue
    fn spawn<F, Fut>(&self, job: F)
    where
        F: FnOnce(Adapter, mpsc::UnboundedSender<AdapterEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(job(self.adapter.clone(), self.event_sender.clone()));
    }

    /// Like [`Self::spawn`], but behind every GATT request issued before it
    fn enqueue<F, Fut>(&self, job: F)
    where
        F: FnOnce(Adapter, mpsc::UnboundedSender<AdapterEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let job = job(self.adapter.clone(), self.event_sender.clone()).boxed();
        if self.gatt_queue.send(job).is_err() {
            warn!("GATT queue closed, request dropped");
        }
    }

    fn drop_link(&mut self, peripheral: &PeripheralId) {
        if let Some(pump) = self.links.remove(peripheral) {
            pump.abort();
        }
    }
}

impl BleAdapter for BtleplugAdapter {
    fn scan(&mut self) {
        self.scanner.start();
    }

    fn stop_scan(&mut self) {
        self.scanner.stop();
    }

    fn connect(&mut self, peripheral: &PeripheralId) {
        self.drop_link(peripheral);
        let id = peripheral.clone();
        let adapter = self.adapter.clone();
        let sender = self.event_sender.clone();

        let pump = tokio::spawn(async move {
            info!(peripheral = %id, "Connecting to device...");
            let device = match find_peripheral(&adapter, &id).await {
                Ok(device) => device,
                Err(e) => {
                    let _ = sender.send(AdapterEvent::ConnectFailed {
                        peripheral: id,
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            let connected = match device.is_connected().await {
                Ok(true) => Ok(()),
                _ => device.connect().await,
            };
            if let Err(e) = connected {
                let _ = sender.send(AdapterEvent::ConnectFailed {
                    peripheral: id,
                    reason: e.to_string(),
                });
                return;
            }

            let mut notifications = match device.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = sender.send(AdapterEvent::ConnectFailed {
                        peripheral: id,
                        reason: format!("notification stream unavailable: {e}"),
                    });
                    return;
                }
            };
            let _ = sender.send(AdapterEvent::Connected(id.clone()));

            while let Some(notification) = notifications.next().await {
                trace!(uuid = %notification.uuid, "Notification: {:02X?}", notification.value);
                let service_uuid = device
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or(Uuid::nil());
                let event = AdapterEvent::ValueUpdated {
                    characteristic: CharacteristicHandle {
                        peripheral: id.clone(),
                        service_uuid,
                        uuid: notification.uuid,
                    },
                    value: notification.value,
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
            debug!(peripheral = %id, "Notification stream ended");
        });
        self.links.insert(peripheral.clone(), pump);
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) {
        self.drop_link(peripheral);
        let id = peripheral.clone();
        self.spawn(move |adapter, sender| async move {
            let device = match find_peripheral(&adapter, &id).await {
                Ok(device) => device,
                Err(_) => {
                    let _ = sender.send(AdapterEvent::Disconnected {
                        peripheral: id,
                        reason: None,
                    });
                    return;
                }
            };

            // A live link reports its own drop through the central event
            // stream; anything else is confirmed here.
            if !matches!(device.is_connected().await, Ok(true)) {
                let _ = sender.send(AdapterEvent::Disconnected {
                    peripheral: id,
                    reason: None,
                });
                return;
            }
            info!(peripheral = %id, "Disconnecting");
            if let Err(e) = device.disconnect().await {
                warn!(peripheral = %id, "Disconnect failed: {}", e);
                let _ = sender.send(AdapterEvent::Disconnected {
                    peripheral: id,
                    reason: Some(e.to_string()),
                });
            }
        });
    }

    fn discover_services(&mut self, peripheral: &PeripheralId) {
        let id = peripheral.clone();
        self.spawn(move |adapter, sender| async move {
            let result = async {
                let device = find_peripheral(&adapter, &id).await?;
                device.discover_services().await?;
                Ok::<_, anyhow::Error>(device.services())
            }
            .await;

            let event = match result {
                Ok(services) => AdapterEvent::ServicesDiscovered {
                    services: services
                        .iter()
                        .map(|s| ServiceHandle {
                            peripheral: id.clone(),
                            uuid: s.uuid,
                        })
                        .collect(),
                    peripheral: id,
                },
                Err(e) => AdapterEvent::ServiceDiscoveryFailed {
                    peripheral: id,
                    reason: e.to_string(),
                },
            };
            let _ = sender.send(event);
        });
    }

    fn discover_characteristics(&mut self, service: &ServiceHandle) {
        let service = service.clone();
        self.spawn(move |adapter, sender| async move {
            // btleplug resolves characteristics together with services.
            let result = async {
                let device = find_peripheral(&adapter, &service.peripheral).await?;
                device
                    .services()
                    .into_iter()
                    .find(|s| s.uuid == service.uuid)
                    .map(|s| {
                        s.characteristics
                            .iter()
                            .map(|c| characteristic_handle(&service.peripheral, c))
                            .collect::<Vec<_>>()
                    })
                    .ok_or_else(|| anyhow::anyhow!("Service {} no longer present", service.uuid))
            }
            .await;

            let event = match result {
                Ok(characteristics) => AdapterEvent::CharacteristicsDiscovered {
                    service,
                    characteristics,
                },
                Err(e) => AdapterEvent::CharacteristicDiscoveryFailed {
                    service,
                    reason: e.to_string(),
                },
            };
            let _ = sender.send(event);
        });
    }

    fn set_notify(&mut self, characteristic: &CharacteristicHandle, enabled: bool) {
        let handle = characteristic.clone();
        self.enqueue(move |adapter, sender| async move {
            let result = async {
                let device = find_peripheral(&adapter, &handle.peripheral).await?;
                let target = find_characteristic(&device, &handle)?;
                if enabled {
                    device.subscribe(&target).await?;
                } else {
                    device.unsubscribe(&target).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
            .await;

            let _ = sender.send(AdapterEvent::NotifyStateUpdated {
                characteristic: handle,
                enabled,
                result: result.map_err(|e| e.to_string()),
            });
        });
    }

    fn write(&mut self, characteristic: &CharacteristicHandle, value: &[u8], with_response: bool) {
        let handle = characteristic.clone();
        let value = value.to_vec();
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.enqueue(move |adapter, sender| async move {
            let result = async {
                let device = find_peripheral(&adapter, &handle.peripheral).await?;
                let target = find_characteristic(&device, &handle)?;
                device.write(&target, &value, write_type).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;

            let _ = sender.send(AdapterEvent::WriteCompleted {
                characteristic: handle,
                result: result.map_err(|e| e.to_string()),
            });
        });
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        for (_, pump) in self.links.drain() {
            pump.abort();
        }
        self.gatt_worker.abort();
    }
}
