//! High-level client facade over the protocol engine.
//!
//! Starting a client binds the socket, seeds configured gateways, kicks off
//! discovery and spawns the engine task. The client then offers read access to
//! the registries, the typed event stream and the `change`/gateway-write
//! entry points. All mutation happens on the engine task; the facade only
//! queues commands and takes read locks.

use crate::config::Config;
use crate::device::Device;
use crate::engine::{AqaraEvent, ChangeRequest, Engine, EngineCommand, Registries};
use crate::error::{AqaraError, Result};
use crate::gateway::Gateway;
use futures_util::Stream;
use log::debug;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Gateway lamp command in HSB color space.
#[derive(Debug, Clone)]
pub struct LightCommand {
    pub power: bool,
    /// Hue in degrees, 0–360.
    pub hue: f64,
    /// Saturation in percent, 0–100.
    pub saturation: f64,
    /// Brightness in percent, 0–100.
    pub brightness: f64,
}

impl Default for LightCommand {
    fn default() -> Self {
        Self {
            power: true,
            hue: 0.0,
            saturation: 0.0,
            brightness: 50.0,
        }
    }
}

/// A running Mi/Aqara LAN client.
#[derive(Clone)]
pub struct AqaraClient {
    registries: Arc<RwLock<Registries>>,
    command_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<AqaraEvent>,
    cancel: CancellationToken,
}

impl AqaraClient {
    /// Bind the socket, start the engine task and broadcast the first
    /// discovery request.
    pub fn start(config: Config) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(32);
        let registries = Arc::new(RwLock::new(Registries::default()));
        let engine = Engine::bind(&config, registries.clone(), event_tx.clone())?;

        let (command_tx, command_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(engine.run(command_rx, cancel.clone()));

        Ok(Self {
            registries,
            command_tx,
            event_tx,
            cancel,
        })
    }

    /// Stop the engine. The socket closes immediately; outstanding logical
    /// operations are abandoned.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Subscribe to engine events (ready / message / error).
    pub fn subscribe(&self) -> broadcast::Receiver<AqaraEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a Stream of engine events.
    pub fn stream(&self) -> impl Stream<Item = AqaraEvent> {
        let mut rx = self.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Re-broadcast the discovery request.
    pub async fn discover(&self) -> Result<()> {
        self.send_command(EngineCommand::Discover).await
    }

    pub fn gateway_by_sid(&self, sid: &str) -> Option<Gateway> {
        let guard = self.registries.read().ok()?;
        guard.gateways.get(sid).cloned()
    }

    /// Resolve the gateway owning a device, through the membership index.
    pub fn gateway_by_device_sid(&self, device_sid: &str) -> Option<Gateway> {
        let guard = self.registries.read().ok()?;
        let gateway_sid = guard.index.gateway_for(device_sid)?;
        guard.gateways.get(gateway_sid).cloned()
    }

    pub fn gateway_list(&self) -> Vec<Gateway> {
        self.registries
            .read()
            .map(|g| g.gateways.list())
            .unwrap_or_default()
    }

    pub fn device_by_sid(&self, sid: &str) -> Option<Device> {
        let guard = self.registries.read().ok()?;
        guard.devices.get(sid).cloned()
    }

    pub fn devices_by_gateway(&self, gateway_sid: &str) -> Vec<Device> {
        self.registries
            .read()
            .map(|g| g.devices.by_gateway(&g.index, gateway_sid))
            .unwrap_or_default()
    }

    pub fn devices_by_gateway_and_model(&self, gateway_sid: &str, model: &str) -> Vec<Device> {
        self.registries
            .read()
            .map(|g| g.devices.by_gateway_and_model(&g.index, gateway_sid, model))
            .unwrap_or_default()
    }

    pub fn devices_by_model(&self, model: &str) -> Vec<Device> {
        self.registries
            .read()
            .map(|g| g.devices.by_model(model))
            .unwrap_or_default()
    }

    pub fn device_list(&self) -> Vec<Device> {
        self.registries
            .read()
            .map(|g| g.devices.list())
            .unwrap_or_default()
    }

    /// Replace the attribute set of the selected devices and write each one.
    /// Selection is by sid, by gateway sid + model, or by model alone.
    pub async fn change(&self, request: ChangeRequest) -> Result<()> {
        self.send_command(EngineCommand::Change(request)).await
    }

    /// Write an attribute set directly to a gateway.
    pub async fn write_gateway(&self, sid: &str, data: Map<String, Value>) -> Result<()> {
        self.send_command(EngineCommand::WriteGateway {
            sid: sid.to_string(),
            data,
        })
        .await
    }

    /// Drive a gateway's built-in lamp. The wire value packs brightness and
    /// RGB into one integer, `0x00` meaning off.
    pub async fn control_light(&self, sid: &str, command: LightCommand) -> Result<()> {
        let value = if command.power {
            let (r, g, b) = hsb_to_rgb(command.hue, command.saturation / 100.0, 1.0);
            ((command.brightness.clamp(0.0, 100.0) as u32) << 24)
                | ((r as u32) << 16)
                | ((g as u32) << 8)
                | b as u32
        } else {
            0
        };
        debug!("control_light {}: rgb={:#010x}", sid, value);

        let mut data = Map::new();
        data.insert("rgb".to_string(), Value::Number(value.into()));
        self.write_gateway(sid, data).await
    }

    async fn send_command(&self, command: EngineCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AqaraError::EngineStopped)
    }
}

/// HSB→RGB conversion. Hue in degrees, saturation and value in 0–1.
fn hsb_to_rgb(hue: f64, saturation: f64, value: f64) -> (u8, u8, u8) {
    let hue = hue.rem_euclid(360.0);
    let saturation = saturation.clamp(0.0, 1.0);
    let value = value.clamp(0.0, 1.0);

    let c = value * saturation;
    let x = c * (1.0 - ((hue / 60.0) % 2.0 - 1.0).abs());
    let m = value - c;

    let (r, g, b) = match hue as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}
