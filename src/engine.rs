//! Protocol engine: socket lifecycle, discovery state machine and dispatch.
//!
//! The engine owns the one UDP socket and all registry state. Inbound
//! datagrams and facade commands are processed one at a time on a single task,
//! so handlers never run concurrently and the registries need no locking
//! discipline beyond "finish one message before the next".
//!
//! Discovery walks INIT → DISCOVERING (socket bound, `whois` broadcast) →
//! ENUMERATING (`get_id_list` per responding gateway) → SYNCING (one `read`
//! per listed device) → READY (pending-read counter hits zero, signaled once).
//! After that the engine stays in steady state, absorbing reports, heartbeats
//! and acknowledgements, and re-broadcasts `whois` whenever a device report
//! cannot be resolved to a gateway.

use crate::config::Config;
use crate::crypto::gateway_key;
use crate::device::{DeviceRegistry, DeviceUpdate};
use crate::error::{AqaraError, Result};
use crate::gateway::{GatewayRegistry, GatewayUpdate};
use crate::index::DeviceMap;
use crate::protocol::{self, CommandTag, Envelope};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Typed notifications surfaced to the facade.
#[derive(Debug, Clone)]
pub enum AqaraEvent {
    /// Every device known at startup enumeration has been read at least once.
    /// Fired at most once per engine lifetime.
    Ready,
    /// A successfully decoded inbound envelope, fired for every datagram that
    /// parses, whether or not its command tag changed any state.
    Message(Envelope),
    /// A socket-level failure. The engine keeps running.
    Error(AqaraError),
}

/// Selector and payload for the public `change` entry point.
///
/// Exactly one selector shape must be usable: `sid`, or `gateway_sid` +
/// `model`, or `model` alone. `data` fully replaces the matched devices'
/// attribute sets before the write goes out.
#[derive(Debug, Clone, Default)]
pub struct ChangeRequest {
    pub sid: Option<String>,
    pub gateway_sid: Option<String>,
    pub model: Option<String>,
    pub data: Option<Map<String, Value>>,
}

/// Requests from the facade into the engine task.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    /// Re-send the discovery broadcast.
    Discover,
    /// Apply a `change` request to matched devices.
    Change(ChangeRequest),
    /// Write an attribute set to a gateway itself (e.g. its lamp).
    WriteGateway { sid: String, data: Map<String, Value> },
}

/// All protocol state, owned and mutated exclusively by the engine task.
/// The facade only ever takes read access.
#[derive(Debug, Default)]
pub(crate) struct Registries {
    pub gateways: GatewayRegistry,
    pub devices: DeviceRegistry,
    pub index: DeviceMap,
}

pub(crate) struct Engine {
    socket: Arc<UdpSocket>,
    multicast_target: SocketAddr,
    registries: Arc<RwLock<Registries>>,
    event_tx: broadcast::Sender<AqaraEvent>,
    /// Outstanding reads issued during synchronization.
    pending_reads: usize,
    /// One-shot readiness latch.
    ready: bool,
}

impl Engine {
    /// Bind the inbound socket, join the discovery multicast group and seed
    /// the configured gateway credentials.
    pub(crate) fn bind(
        config: &Config,
        registries: Arc<RwLock<Registries>>,
        event_tx: broadcast::Sender<AqaraEvent>,
    ) -> Result<Self> {
        if let Ok(mut guard) = registries.write() {
            for gw in &config.gateways {
                let update = GatewayUpdate {
                    password: Some(gw.password.clone()),
                    iv: Some(gw.iv_bytes()?),
                    ..Default::default()
                };
                guard.gateways.upsert(&gw.sid, &update);
            }
        }

        let group: IpAddr = config
            .multicast_address
            .parse()
            .map_err(|e| AqaraError::Io(format!("bad multicast address: {}", e)))?;
        let multicast_target = SocketAddr::new(group, config.multicast_port);

        let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.server_port)
            .parse()
            .map_err(|e| AqaraError::Io(format!("bad bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address: {}", e);
        }
        socket.bind(&SockAddr::from(bind_addr))?;

        if let IpAddr::V4(group) = group
            && group.is_multicast()
        {
            let interface: Ipv4Addr = if config.bind_address.is_empty() {
                Ipv4Addr::UNSPECIFIED
            } else {
                config
                    .bind_address
                    .parse()
                    .map_err(|e| AqaraError::Io(format!("bad interface address: {}", e)))?
            };
            match socket.join_multicast_v4(&group, &interface) {
                Ok(_) => info!("Joined multicast group {} on {}", group, interface),
                Err(e) => warn!("Failed to join multicast group {}: {}", group, e),
            }
        } else {
            debug!("{} is not an IPv4 multicast group, membership skipped", group);
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        info!("Listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            multicast_target,
            registries,
            event_tx,
            pending_reads: 0,
            ready: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("socket bound")
    }

    /// Process datagrams and facade commands until cancelled.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        cancel: CancellationToken,
    ) {
        self.send_whois().await;

        let socket = self.socket.clone();
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                res = socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        self.handle_datagram(&datagram, from).await;
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                        let _ = self.event_tx.send(AqaraEvent::Error(e.into()));
                    }
                },
            }
        }
        debug!("engine stopped");
    }

    /// Decode and dispatch one inbound datagram.
    pub(crate) async fn handle_datagram(&mut self, raw: &[u8], from: SocketAddr) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("bad message from {}: {}", from, e);
                debug!("payload: {}", hex::encode(raw));
                return;
            }
        };
        debug!("[{}] cmd: {} sid: {:?}", from, envelope.cmd, envelope.sid);

        match envelope.tag() {
            Some(CommandTag::Iam) => self.on_iam(&envelope).await,
            Some(CommandTag::GetIdListAck) => self.on_id_list(&envelope).await,
            Some(CommandTag::Report) | Some(CommandTag::Heartbeat) => {
                self.on_state(&envelope).await;
            }
            Some(CommandTag::ReadAck) => {
                self.on_state(&envelope).await;
                self.on_read_ack();
            }
            Some(CommandTag::WriteAck) => self.on_state(&envelope).await,
            Some(CommandTag::ServerAck) => {
                // Gateway NACK for malformed outbound JSON. Not surfaced.
                debug!("server_ack: {:?}", envelope.data);
            }
            Some(CommandTag::Whois)
            | Some(CommandTag::GetIdList)
            | Some(CommandTag::Read)
            | Some(CommandTag::Write) => {
                // Our own multicast traffic looping back.
                debug!("ignoring looped-back '{}'", envelope.cmd);
            }
            None => debug!("unknown command '{}', dropped", envelope.cmd),
        }

        let _ = self.event_tx.send(AqaraEvent::Message(envelope));
    }

    /// A gateway answered the discovery broadcast: record it, then ask for its
    /// device list.
    async fn on_iam(&mut self, envelope: &Envelope) {
        let Some(sid) = envelope.sid.clone() else {
            warn!("iam without sid, dropped");
            return;
        };
        if let Ok(mut guard) = self.registries.write() {
            guard.gateways.upsert(&sid, &GatewayUpdate::from(envelope));
        }
        self.send_to_gateway(&sid, &protocol::get_id_list()).await;
    }

    /// A gateway listed its devices: record the memberships and read every
    /// listed device. Only sids never seen before widen the readiness window,
    /// so a repeated enumeration cannot demand extra acknowledgements.
    async fn on_id_list(&mut self, envelope: &Envelope) {
        let Some(sid) = envelope.sid.clone() else {
            warn!("get_id_list_ack without sid, dropped");
            return;
        };
        let device_sids = envelope.device_sids();

        let newly_seen = match self.registries.write() {
            Ok(mut guard) => {
                guard.gateways.upsert(&sid, &GatewayUpdate::from(envelope));
                let newly_seen = device_sids
                    .iter()
                    .filter(|d| guard.index.gateway_for(d).is_none())
                    .count();
                guard.index.set_membership(&sid, &device_sids);
                newly_seen
            }
            Err(e) => {
                error!("registry lock poisoned: {}", e);
                return;
            }
        };

        for device_sid in &device_sids {
            self.send_to_gateway(&sid, &protocol::read(device_sid)).await;
        }
        self.pending_reads += newly_seen;
        debug!(
            "enumerated {} devices on {} ({} new, {} reads pending)",
            device_sids.len(),
            sid,
            newly_seen,
            self.pending_reads
        );
    }

    /// Route a report/heartbeat/acknowledgement to the right registry. A
    /// device whose gateway cannot be resolved triggers a fresh discovery
    /// broadcast, the only self-healing path for membership drift.
    async fn on_state(&mut self, envelope: &Envelope) {
        let Some(sid) = envelope.sid.clone() else {
            warn!("{} without sid, dropped", envelope.cmd);
            return;
        };

        if envelope.model.as_deref() == Some("gateway") {
            if let Ok(mut guard) = self.registries.write() {
                guard.gateways.update(&sid, &GatewayUpdate::from(envelope));
            }
            return;
        }

        let unresolved = match self.registries.write() {
            Ok(mut guard) => {
                guard.devices.upsert(&sid, &DeviceUpdate::from(envelope));
                guard.index.gateway_for(&sid).is_none()
            }
            Err(_) => return,
        };

        if unresolved
            && matches!(
                envelope.tag(),
                Some(CommandTag::Report) | Some(CommandTag::Heartbeat)
            )
        {
            warn!("no gateway known for device {}, re-discovering", sid);
            self.send_whois().await;
        }
    }

    /// One synchronization read completed. The first time the counter drains
    /// to zero the one-shot readiness signal fires.
    fn on_read_ack(&mut self) {
        if self.pending_reads == 0 {
            // Stale or duplicate acknowledgement, nothing outstanding.
            return;
        }
        self.pending_reads -= 1;
        if self.pending_reads == 0 && !self.ready {
            self.ready = true;
            info!("all enumerated devices read, ready");
            let _ = self.event_tx.send(AqaraEvent::Ready);
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Discover => self.send_whois().await,
            EngineCommand::Change(request) => self.on_change(request).await,
            EngineCommand::WriteGateway { sid, data } => {
                let send = match self.registries.read() {
                    Ok(guard) => match prepare_gateway_write(&guard, &sid, &data) {
                        Ok(send) => send,
                        Err(e) => {
                            error!("gateway write {} skipped: {}", sid, e);
                            return;
                        }
                    },
                    Err(_) => return,
                };
                self.send_json(send.0, &send.1).await;
            }
        }
    }

    /// Apply a `change` request: select targets, replace their attribute sets,
    /// then issue one keyed write per matched device. Parameter and resolution
    /// failures are logged and skipped, never raised.
    async fn on_change(&mut self, request: ChangeRequest) {
        let Some(data) = request.data.clone() else {
            error!("change skipped: no data payload in {:?}", request);
            return;
        };

        let targets: Vec<String> = match self.registries.read() {
            Ok(guard) => {
                if let Some(sid) = &request.sid {
                    if guard.devices.get(sid).is_some() {
                        vec![sid.clone()]
                    } else {
                        error!("change skipped: device {} not found", sid);
                        return;
                    }
                } else if let (Some(gateway_sid), Some(model)) =
                    (&request.gateway_sid, &request.model)
                {
                    guard
                        .devices
                        .by_gateway_and_model(&guard.index, gateway_sid, model)
                        .into_iter()
                        .map(|d| d.sid)
                        .collect()
                } else if let Some(model) = &request.model {
                    guard.devices.by_model(model).into_iter().map(|d| d.sid).collect()
                } else {
                    error!("change skipped: no usable selector in {:?}", request);
                    return;
                }
            }
            Err(_) => return,
        };

        let mut sends = Vec::new();
        if let Ok(mut guard) = self.registries.write() {
            for sid in &targets {
                if let Some(device) = guard.devices.get_mut(sid) {
                    device.data = data.clone();
                }
                match prepare_device_write(&guard, sid) {
                    Ok(send) => sends.push(send),
                    Err(e) => error!("write {} skipped: {}", sid, e),
                }
            }
        }
        for (addr, msg) in sends {
            self.send_json(addr, &msg).await;
        }
    }

    /// Multicast the discovery broadcast. Unencrypted, fire-and-forget.
    async fn send_whois(&mut self) {
        debug!("sending whois to {}", self.multicast_target);
        self.send_json(self.multicast_target, &protocol::whois()).await;
    }

    /// Unicast a message to a known gateway's last reported address.
    async fn send_to_gateway(&mut self, sid: &str, msg: &Value) {
        let addr = match self.registries.read() {
            Ok(guard) => match guard.gateways.get(sid) {
                Some(gateway) => gateway.addr(),
                None => {
                    error!("send skipped: gateway {} not found", sid);
                    return;
                }
            },
            Err(_) => return,
        };
        match addr {
            Some(addr) => self.send_json(addr, msg).await,
            None => error!("send skipped: gateway {} has no address", sid),
        }
    }

    async fn send_json(&mut self, addr: SocketAddr, msg: &Value) {
        let payload = match serde_json::to_vec(msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode outbound message: {}", e);
                return;
            }
        };
        debug!("[send {}] {}", addr, msg);
        if let Err(e) = self.socket.send_to(&payload, addr).await {
            error!("send to {} failed: {}", addr, e);
            let _ = self.event_tx.send(AqaraEvent::Error(e.into()));
        }
    }
}

/// Resolve everything a keyed device write needs while the lock is held.
/// Returns the target address and the finished message, or the reason the
/// write cannot go out.
fn prepare_device_write(registries: &Registries, sid: &str) -> Result<(SocketAddr, Value)> {
    let device = registries
        .devices
        .get(sid)
        .ok_or_else(|| AqaraError::DeviceNotFound(sid.to_string()))?;
    let gateway_sid = registries
        .index
        .gateway_for(sid)
        .ok_or_else(|| AqaraError::GatewayUnresolved(sid.to_string()))?;
    let gateway = registries
        .gateways
        .get(gateway_sid)
        .ok_or_else(|| AqaraError::GatewayNotFound(gateway_sid.to_string()))?;
    let addr = gateway
        .addr()
        .ok_or_else(|| AqaraError::GatewayUnaddressed(gateway_sid.to_string()))?;
    // Without a heartbeat-delivered token the key would be garbage; fail fast
    // instead of sending a write the gateway must reject.
    let token = gateway
        .token
        .as_deref()
        .ok_or_else(|| AqaraError::MissingToken(gateway_sid.to_string()))?;
    let password = gateway
        .password
        .as_deref()
        .ok_or_else(|| AqaraError::MissingToken(gateway_sid.to_string()))?;
    let key = gateway_key(token, password, &gateway.iv)?;

    let model = device.model.as_deref().unwrap_or_default();
    let msg = protocol::write(&device.sid, model, device.short_id, &device.data, &key);
    Ok((addr, msg))
}

/// Same as [`prepare_device_write`] but addressed to the gateway itself.
fn prepare_gateway_write(
    registries: &Registries,
    sid: &str,
    data: &Map<String, Value>,
) -> Result<(SocketAddr, Value)> {
    let gateway = registries
        .gateways
        .get(sid)
        .ok_or_else(|| AqaraError::GatewayNotFound(sid.to_string()))?;
    let addr = gateway
        .addr()
        .ok_or_else(|| AqaraError::GatewayUnaddressed(sid.to_string()))?;
    let token = gateway
        .token
        .as_deref()
        .ok_or_else(|| AqaraError::MissingToken(sid.to_string()))?;
    let password = gateway
        .password
        .as_deref()
        .ok_or_else(|| AqaraError::MissingToken(sid.to_string()))?;
    let key = gateway_key(token, password, &gateway.iv)?;
    Ok((addr, protocol::write(sid, "gateway", None, data, &key)))
}
