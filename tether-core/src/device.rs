//! One logical peer: all of its links, its pairing state and its plugin instances.
//!
//! Every state change goes through the device's single async mutex. Work that must not run
//! under the lock (sending on a link, calling into a plugin) is collected while it is held and
//! performed after it is released, so plugins always see a settled trust/reachability view.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::identity::{DeviceId, PublicKey};
use crate::link::{Link, LinkId, TransportKind};
use crate::packet::Packet;
use crate::pairing::{pair_packet, PairState, PairingAction, PairingError, PairingHandler};
use crate::plugins::{Plugin, PluginContext, PluginTable};
use crate::protocol::{is_pairing_control, PeerIdentity};
use crate::store::{DeviceRecord, TrustStore};
use crate::transfer::TransferCoordinator;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    #[default]
    Unknown,
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "smartphone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

impl From<&str> for DeviceType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "smartphone" | "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Unknown,
        }
    }
}

impl From<String> for DeviceType {
    fn from(s: String) -> Self {
        DeviceType::from(s.as_str())
    }
}

impl From<DeviceType> for String {
    fn from(t: DeviceType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable changes, delivered over [`Device::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    NameChanged(String),
    ReachableChanged(bool),
    TrustedChanged(bool),
    PairingError(PairingError),
    /// The peer asked to pair; answer with `accept_pairing` or `reject_pairing`.
    PairingRequest,
    HasPairingRequestsChanged(bool),
    /// Supported or loaded plugins changed.
    PluginsChanged,
}

/// Shared collaborators every device of one registry uses.
#[derive(Clone)]
pub struct DeviceContext {
    pub local_key: PublicKey,
    pub store: Arc<dyn TrustStore>,
    pub plugins: Arc<PluginTable>,
    pub coordinator: TransferCoordinator,
    pub config: Arc<CoreConfig>,
}

struct LinkEntry {
    link: Arc<dyn Link>,
    registered: u64,
    last_active: u64,
}

struct DeviceState {
    name: String,
    device_type: DeviceType,
    trusted: bool,
    public_key: Option<PublicKey>,
    links: HashMap<LinkId, LinkEntry>,
    pairing: HashMap<LinkId, PairingHandler>,
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
    peer_incoming: BTreeSet<String>,
    peer_outgoing: BTreeSet<String>,
    supported_plugins: BTreeSet<String>,
    disabled_plugins: BTreeSet<String>,
    has_pairing_requests: bool,
    /// Logical clock for link registration and activity.
    clock: u64,
}

impl DeviceState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_reachable(&self) -> bool {
        !self.links.is_empty()
    }

    fn touch(&mut self, link_id: &LinkId) {
        let now = self.tick();
        if let Some(entry) = self.links.get_mut(link_id) {
            entry.last_active = now;
        }
    }

    /// Most recently active link; ties go to the earliest registered.
    fn preferred_link(&self) -> Option<&LinkEntry> {
        self.links.values().max_by(|a, b| {
            a.last_active
                .cmp(&b.last_active)
                .then(b.registered.cmp(&a.registered))
        })
    }

    fn plugin_allowed(&self, name: &str) -> bool {
        self.trusted
            && self.is_reachable()
            && self.supported_plugins.contains(name)
            && !self.disabled_plugins.contains(name)
    }
}

/// Sends and plugin callbacks collected under the lock, run after it is released.
#[derive(Default)]
struct Followups {
    sends: Vec<(Arc<dyn Link>, Packet)>,
    connect: Vec<Arc<dyn Plugin>>,
}

impl Followups {
    async fn run(self, device: DeviceId) {
        for (link, packet) in self.sends {
            if let Err(e) = link.send(&packet).await {
                warn!(%device, link = %link.id(), error = %e, "send failed");
            }
        }
        for plugin in self.connect {
            plugin.connected().await;
        }
    }
}

pub struct Device {
    id: DeviceId,
    this: Weak<Device>,
    ctx: DeviceContext,
    state: Mutex<DeviceState>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Device {
    /// A device we have only just heard from. Untrusted until pairing completes.
    pub fn new(
        id: DeviceId,
        name: impl Into<String>,
        device_type: DeviceType,
        ctx: DeviceContext,
    ) -> Arc<Self> {
        Self::build(id, name.into(), device_type, None, BTreeSet::new(), ctx)
    }

    /// A device trusted in an earlier session. Unreachable until a link arrives.
    pub fn restore(record: DeviceRecord, ctx: DeviceContext) -> Arc<Self> {
        Self::build(
            record.id,
            record.name,
            record.device_type,
            Some(record.public_key),
            record.disabled_plugins,
            ctx,
        )
    }

    fn build(
        id: DeviceId,
        name: String,
        device_type: DeviceType,
        trusted_key: Option<PublicKey>,
        disabled_plugins: BTreeSet<String>,
        ctx: DeviceContext,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = DeviceState {
            name,
            device_type,
            trusted: trusted_key.is_some(),
            public_key: trusted_key,
            links: HashMap::new(),
            pairing: HashMap::new(),
            plugins: BTreeMap::new(),
            peer_incoming: BTreeSet::new(),
            peer_outgoing: BTreeSet::new(),
            supported_plugins: ctx.plugins.names(),
            disabled_plugins,
            has_pairing_requests: false,
            clock: 0,
        };
        Arc::new_cyclic(|this| Device {
            id,
            this: this.clone(),
            ctx,
            state: Mutex::new(state),
            events,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn device_type(&self) -> DeviceType {
        self.state.lock().await.device_type
    }

    pub async fn is_reachable(&self) -> bool {
        self.state.lock().await.is_reachable()
    }

    pub async fn is_trusted(&self) -> bool {
        self.state.lock().await.trusted
    }

    /// True while the peer waits for us to accept or reject.
    pub async fn has_pairing_requests(&self) -> bool {
        self.state.lock().await.has_pairing_requests
    }

    pub async fn pair_state(&self, link_id: &LinkId) -> Option<PairState> {
        self.state
            .lock()
            .await
            .pairing
            .get(link_id)
            .map(PairingHandler::state)
    }

    /// Links in registration order.
    pub async fn available_links(&self) -> Vec<(LinkId, TransportKind)> {
        let st = self.state.lock().await;
        let mut links: Vec<_> = st.links.iter().collect();
        links.sort_by_key(|(_, e)| e.registered);
        links
            .into_iter()
            .map(|(id, e)| (id.clone(), e.link.transport()))
            .collect()
    }

    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.state.lock().await.plugins.keys().cloned().collect()
    }

    pub async fn has_plugin(&self, name: &str) -> bool {
        self.state.lock().await.plugins.contains_key(name)
    }

    pub async fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.state.lock().await.plugins.get(name).cloned()
    }

    /// Loaded plugin downcast to its concrete type.
    pub async fn plugin_as<P: Plugin>(&self, name: &str) -> Option<Arc<P>> {
        let plugin = self.plugin(name).await?;
        let any: Arc<dyn Any + Send + Sync> = plugin.into_any();
        any.downcast::<P>().ok()
    }

    pub async fn supported_plugins(&self) -> BTreeSet<String> {
        self.state.lock().await.supported_plugins.clone()
    }

    pub async fn is_plugin_enabled(&self, name: &str) -> bool {
        !self.state.lock().await.disabled_plugins.contains(name)
    }

    /// Enable or disable a plugin for this device. Persisted for trusted devices.
    pub async fn set_plugin_enabled(&self, name: &str, enabled: bool) {
        let mut st = self.state.lock().await;
        let changed = if enabled {
            st.disabled_plugins.remove(name)
        } else {
            st.disabled_plugins.insert(name.to_string())
        };
        if !changed {
            return;
        }
        let mut out = Followups::default();
        if enabled {
            if let Some(plugin) = self.instantiate(&mut st, name) {
                out.connect.push(plugin);
            }
        } else {
            st.plugins.remove(name);
        }
        self.emit(DeviceEvent::PluginsChanged);
        self.persist(&st);
        drop(st);
        out.run(self.id).await;
    }

    /// Drop every plugin instance and create fresh ones.
    pub async fn reload_plugins(&self) {
        let mut st = self.state.lock().await;
        st.plugins.clear();
        let out = Followups {
            connect: self.load_plugins(&mut st),
            ..Followups::default()
        };
        self.emit(DeviceEvent::PluginsChanged);
        drop(st);
        out.run(self.id).await;
    }

    /// Icon for the device type.
    pub async fn icon_name(&self) -> String {
        icon_for_type(self.device_type().await).to_string()
    }

    /// Icon for the device type and its current trust/reachability.
    pub async fn status_icon_name(&self) -> String {
        let st = self.state.lock().await;
        let status = match (st.is_reachable(), st.trusted) {
            (true, true) => "connected",
            (true, false) => "disconnected",
            (false, _) => "trusted",
        };
        format!("{}{}", icon_for_type(st.device_type), status)
    }

    /// Human-readable fingerprints of both credentials, for out-of-band comparison.
    pub async fn encryption_info(&self) -> String {
        let st = self.state.lock().await;
        let remote = st
            .public_key
            .clone()
            .or_else(|| st.preferred_link().map(|e| e.link.peer_key().clone()));
        let remote = remote
            .map(|k| k.fingerprint())
            .unwrap_or_else(|| "unknown".into());
        format!(
            "SHA256 fingerprint of your device key is: {}\nSHA256 fingerprint of remote device key is: {}",
            self.ctx.local_key.fingerprint(),
            remote
        )
    }

    /// Snapshot for the trust store. `None` unless trusted.
    pub async fn record(&self) -> Option<DeviceRecord> {
        self.record_of(&*self.state.lock().await)
    }

    fn record_of(&self, st: &DeviceState) -> Option<DeviceRecord> {
        if !st.trusted {
            return None;
        }
        Some(DeviceRecord {
            id: self.id,
            name: st.name.clone(),
            device_type: st.device_type,
            public_key: st.public_key.clone()?,
            disabled_plugins: st.disabled_plugins.clone(),
        })
    }

    fn persist(&self, st: &DeviceState) {
        let Some(record) = self.record_of(st) else {
            return;
        };
        if let Err(e) = self.ctx.store.save(&record) {
            warn!(device = %self.id, error = %e, "failed to persist device");
        }
    }

    fn plugin_context(&self, st: &DeviceState) -> PluginContext {
        PluginContext {
            device: self.this.clone(),
            device_id: self.id,
            device_name: st.name.clone(),
            coordinator: self.ctx.coordinator.clone(),
            config: Arc::clone(&self.ctx.config),
        }
    }

    /// Create the named plugin if it is allowed and not loaded yet. Returns the new instance.
    fn instantiate(&self, st: &mut DeviceState, name: &str) -> Option<Arc<dyn Plugin>> {
        if !st.plugin_allowed(name) || st.plugins.contains_key(name) {
            return None;
        }
        let registration = self.ctx.plugins.get(name)?;
        let plugin = (registration.factory)(self.plugin_context(st));
        debug!(device = %self.id, plugin = name, "plugin loaded");
        st.plugins.insert(name.to_string(), Arc::clone(&plugin));
        Some(plugin)
    }

    fn load_plugins(&self, st: &mut DeviceState) -> Vec<Arc<dyn Plugin>> {
        let names: Vec<String> = st.supported_plugins.iter().cloned().collect();
        names
            .iter()
            .filter_map(|name| self.instantiate(st, name))
            .collect()
    }

    fn unload_plugins(&self, st: &mut DeviceState) {
        if !st.plugins.is_empty() {
            st.plugins.clear();
            debug!(device = %self.id, "plugins unloaded");
            self.emit(DeviceEvent::PluginsChanged);
        }
    }

    /// Register a link. Name, type and capabilities follow the newest identity.
    ///
    /// A trusted device only accepts links proving the credential it was trusted with; any
    /// other link is closed and refused.
    pub async fn add_link(&self, identity: &PeerIdentity, link: Arc<dyn Link>) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.trusted && st.public_key.as_ref() != Some(link.peer_key()) {
            warn!(device = %self.id, link = %link.id(), "link credential does not match trusted device");
            link.close();
            return Err(Error::CredentialMismatch);
        }
        let mut out = Followups::default();

        if st.name != identity.device_name {
            st.name = identity.device_name.clone();
            self.emit(DeviceEvent::NameChanged(st.name.clone()));
        }
        st.device_type = identity.device_type;
        st.peer_incoming = identity.incoming_capabilities.clone();
        st.peer_outgoing = identity.outgoing_capabilities.clone();
        let supported = self
            .ctx
            .plugins
            .supported_by(&st.peer_incoming, &st.peer_outgoing);
        if supported != st.supported_plugins {
            st.plugins.retain(|name, _| supported.contains(name));
            st.supported_plugins = supported;
            self.emit(DeviceEvent::PluginsChanged);
        }
        self.persist(&st);

        let was_reachable = st.is_reachable();
        let registered = st.tick();
        debug!(device = %self.id, link = %link.id(), transport = %link.transport(), "link added");
        st.links.insert(
            link.id().clone(),
            LinkEntry {
                link,
                registered,
                last_active: registered,
            },
        );
        if !was_reachable {
            info!(device = %self.id, name = %st.name, "device reachable");
            self.emit(DeviceEvent::ReachableChanged(true));
            out.connect = self.load_plugins(&mut st);
            if !out.connect.is_empty() {
                self.emit(DeviceEvent::PluginsChanged);
            }
        }
        drop(st);
        out.run(self.id).await;
        Ok(())
    }

    /// Unregister and close a link, cancelling any handshake on it. Trust is kept.
    pub async fn remove_link(&self, link_id: &LinkId) -> bool {
        let mut st = self.state.lock().await;
        let Some(entry) = st.links.remove(link_id) else {
            return false;
        };
        entry.link.close();
        if let Some(mut handler) = st.pairing.remove(link_id) {
            handler.cancel();
        }
        debug!(device = %self.id, link = %link_id, "link removed");
        if !st.is_reachable() {
            info!(device = %self.id, name = %st.name, "device unreachable");
            self.emit(DeviceEvent::ReachableChanged(false));
            self.unload_plugins(&mut st);
        }
        self.refresh_pairing_requests(&mut st);
        true
    }

    /// Route an inbound packet: pairing control to the link's handshake, anything else to the
    /// plugin handling its type, if the device is trusted.
    pub async fn receive_packet(&self, link_id: &LinkId, packet: Packet) -> Result<()> {
        let mut st = self.state.lock().await;
        if !st.links.contains_key(link_id) {
            return Err(Error::LinkClosed);
        }
        st.touch(link_id);

        if is_pairing_control(packet.packet_type()) {
            let actions = self
                .handler(&mut st, link_id)
                .receive_packet(&packet, Instant::now());
            let mut out = Followups::default();
            self.apply_pairing(&mut st, link_id, actions, &mut out);
            self.refresh_pairing_requests(&mut st);
            drop(st);
            out.run(self.id).await;
            return Ok(());
        }

        if !st.trusted {
            debug!(device = %self.id, packet_type = packet.packet_type(), "dropping packet from untrusted device");
            return Err(Error::Untrusted);
        }
        let Some(registration) = self.ctx.plugins.handler_for(packet.packet_type()) else {
            debug!(device = %self.id, packet_type = packet.packet_type(), "no plugin for packet type");
            return Ok(());
        };
        let name = registration.name;
        let (plugin, fresh) = match st.plugins.get(name) {
            Some(plugin) => (Arc::clone(plugin), false),
            None => match self.instantiate(&mut st, name) {
                Some(plugin) => {
                    self.emit(DeviceEvent::PluginsChanged);
                    (plugin, true)
                }
                None => {
                    debug!(device = %self.id, plugin = name, "plugin disabled or unsupported");
                    return Ok(());
                }
            },
        };
        drop(st);

        if fresh {
            plugin.connected().await;
        }
        if !plugin.receive_packet(&packet).await {
            debug!(device = %self.id, plugin = name, packet_type = packet.packet_type(), "packet not handled");
        }
        Ok(())
    }

    /// Send on the most recently active link. No retry on failure.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let mut st = self.state.lock().await;
        if !st.trusted && !is_pairing_control(packet.packet_type()) {
            return Err(Error::Untrusted);
        }
        let link = match st.preferred_link() {
            Some(entry) => Arc::clone(&entry.link),
            None => return Err(Error::Unreachable),
        };
        st.touch(link.id());
        drop(st);
        link.send(packet).await?;
        Ok(())
    }

    /// Ask the peer to pair, or accept its outstanding request. No-op when already trusted.
    pub async fn request_pair(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.trusted {
            debug!(device = %self.id, "already paired");
            return Ok(());
        }
        if !st.is_reachable() {
            return Err(Error::Unreachable);
        }
        info!(device = %self.id, name = %st.name, "requesting pairing");
        let now = Instant::now();
        let link_ids: Vec<LinkId> = st.links.keys().cloned().collect();
        let mut out = Followups::default();
        for link_id in link_ids {
            let actions = self.handler(&mut st, &link_id).request_pair(now);
            self.apply_pairing(&mut st, &link_id, actions, &mut out);
        }
        self.refresh_pairing_requests(&mut st);
        drop(st);
        out.run(self.id).await;
        Ok(())
    }

    /// Request pairing and wait for the handshake to finish. Fails with `PairingRejected` or
    /// `PairingTimeout`, or `Unreachable` if the device goes away first.
    pub async fn pair(&self) -> Result<()> {
        let mut events = self.subscribe();
        self.request_pair().await?;
        if self.is_trusted().await {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(DeviceEvent::TrustedChanged(true)) => return Ok(()),
                Ok(DeviceEvent::PairingError(e)) => return Err(e.into()),
                Ok(DeviceEvent::ReachableChanged(false)) => return Err(Error::Unreachable),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_trusted().await {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Unreachable),
            }
        }
    }

    pub async fn accept_pairing(&self) {
        self.drive_handlers(PairingHandler::accept_pairing).await
    }

    pub async fn reject_pairing(&self) {
        self.drive_handlers(PairingHandler::reject_pairing).await
    }

    async fn drive_handlers(&self, f: fn(&mut PairingHandler) -> Vec<PairingAction>) {
        let mut st = self.state.lock().await;
        let link_ids: Vec<LinkId> = st.pairing.keys().cloned().collect();
        let mut out = Followups::default();
        for link_id in link_ids {
            let actions = match st.pairing.get_mut(&link_id) {
                Some(handler) => f(handler),
                None => continue,
            };
            self.apply_pairing(&mut st, &link_id, actions, &mut out);
        }
        self.refresh_pairing_requests(&mut st);
        drop(st);
        out.run(self.id).await;
    }

    /// Withdraw trust: tell the peer on every link, forget the stored record and drop plugins.
    pub async fn unpair(&self) {
        let mut st = self.state.lock().await;
        let mut out = Followups::default();
        let was_trusted = st.trusted;
        for (link_id, entry) in &st.links {
            let requested = st
                .pairing
                .get(link_id)
                .is_some_and(|h| h.state().is_requested());
            if was_trusted || requested {
                out.sends.push((Arc::clone(&entry.link), pair_packet(false)));
            }
        }
        for handler in st.pairing.values_mut() {
            handler.cancel();
        }
        if was_trusted {
            info!(device = %self.id, name = %st.name, "unpaired");
            self.set_untrusted(&mut st);
        }
        self.refresh_pairing_requests(&mut st);
        drop(st);
        out.run(self.id).await;
    }

    fn handler<'a>(&self, st: &'a mut DeviceState, link_id: &LinkId) -> &'a mut PairingHandler {
        let trusted = st.trusted;
        let timeout = self.ctx.config.pairing_timeout;
        st.pairing.entry(link_id.clone()).or_insert_with(|| {
            if trusted {
                PairingHandler::paired(timeout)
            } else {
                PairingHandler::new(timeout)
            }
        })
    }

    fn apply_pairing(
        &self,
        st: &mut DeviceState,
        link_id: &LinkId,
        actions: Vec<PairingAction>,
        out: &mut Followups,
    ) {
        let Some(link) = st.links.get(link_id).map(|e| Arc::clone(&e.link)) else {
            return;
        };
        for action in actions {
            match action {
                PairingAction::Send(packet) => out.sends.push((Arc::clone(&link), packet)),
                PairingAction::Trusted => {
                    if !st.trusted {
                        self.set_trusted(st, link.peer_key().clone(), out);
                    }
                }
                PairingAction::Untrusted => {
                    if st.trusted {
                        info!(device = %self.id, name = %st.name, "peer unpaired");
                        self.set_untrusted(st);
                    }
                }
                PairingAction::IncomingRequest => {
                    info!(device = %self.id, name = %st.name, "pairing requested by peer");
                    self.emit(DeviceEvent::PairingRequest);
                }
                PairingAction::Failed(e) => {
                    info!(device = %self.id, name = %st.name, error = %e, "pairing failed");
                    self.emit(DeviceEvent::PairingError(e));
                }
                PairingAction::ArmDeadline(at) => self.spawn_deadline(link_id.clone(), at),
            }
        }
    }

    fn set_trusted(&self, st: &mut DeviceState, key: PublicKey, out: &mut Followups) {
        st.trusted = true;
        st.public_key = Some(key);
        for handler in st.pairing.values_mut() {
            handler.set_trusted(true);
        }
        info!(device = %self.id, name = %st.name, "paired");
        self.persist(st);
        self.emit(DeviceEvent::TrustedChanged(true));
        let loaded = self.load_plugins(st);
        if !loaded.is_empty() {
            self.emit(DeviceEvent::PluginsChanged);
        }
        out.connect.extend(loaded);
    }

    fn set_untrusted(&self, st: &mut DeviceState) {
        st.trusted = false;
        st.public_key = None;
        for handler in st.pairing.values_mut() {
            handler.set_trusted(false);
        }
        if let Err(e) = self.ctx.store.remove(&self.id) {
            warn!(device = %self.id, error = %e, "failed to remove device record");
        }
        self.emit(DeviceEvent::TrustedChanged(false));
        self.unload_plugins(st);
    }

    fn refresh_pairing_requests(&self, st: &mut DeviceState) {
        let pending = st
            .pairing
            .values()
            .any(|h| h.state() == PairState::RequestedByPeer);
        if pending != st.has_pairing_requests {
            st.has_pairing_requests = pending;
            self.emit(DeviceEvent::HasPairingRequestsChanged(pending));
        }
    }

    fn spawn_deadline(&self, link_id: LinkId, at: Instant) {
        let device = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(device) = device.upgrade() {
                device.check_pairing_deadline(&link_id).await;
            }
        });
    }

    async fn check_pairing_deadline(&self, link_id: &LinkId) {
        let mut st = self.state.lock().await;
        let actions = match st.pairing.get_mut(link_id) {
            Some(handler) => handler.check_deadline(Instant::now()),
            None => return,
        };
        let mut out = Followups::default();
        self.apply_pairing(&mut st, link_id, actions, &mut out);
        self.refresh_pairing_requests(&mut st);
        drop(st);
        out.run(self.id).await;
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

fn icon_for_type(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::Unknown => "smartphone",
        DeviceType::Desktop => "laptop",
        other => other.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::identity::Keypair;
    use crate::link::{LoopbackLink, PacketReceiver};
    use crate::packet::Payload;
    use crate::plugins::ping;
    use crate::plugins::testing::{
        recorder, RecordingPlugin, RecordingSink, RECORDER, RECORDER_TYPE,
    };
    use crate::protocol::{PACKET_TYPE_IDENTITY, PACKET_TYPE_PING};
    use crate::store::MemoryTrustStore;
    use crate::transfer::TransferError;

    struct Harness {
        local: Keypair,
        peer: Keypair,
        store: Arc<MemoryTrustStore>,
        log: Arc<StdMutex<Vec<String>>>,
        ctx: DeviceContext,
    }

    impl Harness {
        fn new() -> Self {
            let local = Keypair::generate();
            let peer = Keypair::generate();
            let store = Arc::new(MemoryTrustStore::new());
            let log = Arc::new(StdMutex::new(Vec::new()));
            let ctx = DeviceContext {
                local_key: local.public_key().clone(),
                store: store.clone(),
                plugins: Arc::new(PluginTable::new(vec![recorder(log.clone())])),
                coordinator: TransferCoordinator::new(),
                config: Arc::new(CoreConfig::default()),
            };
            Self {
                local,
                peer,
                store,
                log,
                ctx,
            }
        }

        fn untrusted(&self) -> Arc<Device> {
            Device::new(
                self.peer.device_id(),
                "Phone1",
                DeviceType::Phone,
                self.ctx.clone(),
            )
        }

        fn trusted(&self) -> Arc<Device> {
            Device::restore(
                DeviceRecord {
                    id: self.peer.device_id(),
                    name: "Phone1".into(),
                    device_type: DeviceType::Phone,
                    public_key: self.peer.public_key().clone(),
                    disabled_plugins: BTreeSet::new(),
                },
                self.ctx.clone(),
            )
        }

        /// Device-side link to the peer, plus the receiver of what the device sends on it.
        fn link(&self) -> (Arc<LoopbackLink>, PacketReceiver) {
            self.link_with_key(self.peer.public_key().clone())
        }

        fn link_with_key(&self, peer_key: PublicKey) -> (Arc<LoopbackLink>, PacketReceiver) {
            let ((ours, _inbound), (_theirs, sent)) =
                LoopbackLink::pair(self.local.public_key().clone(), peer_key);
            (ours, sent)
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn identity(name: &str) -> PeerIdentity {
        PeerIdentity::from_packet(
            &Packet::new(PACKET_TYPE_IDENTITY)
                .with_field("deviceName", name)
                .with_field("deviceType", "Phone"),
        )
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn pair_values(rx: &mut PacketReceiver) -> Vec<bool> {
        let mut values = Vec::new();
        while let Ok(p) = rx.try_recv() {
            if let Some(v) = p.get::<bool>("pair") {
                values.push(v);
            }
        }
        values
    }

    #[tokio::test]
    async fn new_link_does_not_grant_trust() {
        let h = Harness::new();
        let device = h.untrusted();
        let mut events = device.subscribe();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();

        assert!(device.is_reachable().await);
        assert!(!device.is_trusted().await);
        assert_eq!(device.name().await, "Phone1");
        assert_eq!(device.device_type().await, DeviceType::Phone);
        assert!(drain(&mut events).contains(&DeviceEvent::ReachableChanged(true)));

        let result = device
            .receive_packet(link.id(), Packet::new(RECORDER_TYPE))
            .await;
        assert!(matches!(result, Err(Error::Untrusted)));
        assert!(h.log().is_empty());
        assert!(device.loaded_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn trusted_device_dispatches_to_plugin() {
        let h = Harness::new();
        let device = h.trusted();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();
        assert!(device.has_plugin(RECORDER).await);

        device
            .receive_packet(link.id(), Packet::new(RECORDER_TYPE))
            .await
            .unwrap();
        device
            .receive_packet(link.id(), Packet::new("tether.unknown"))
            .await
            .unwrap();
        assert_eq!(h.log(), vec!["connected", RECORDER_TYPE]);
        assert!(device.plugin_as::<RecordingPlugin>(RECORDER).await.is_some());
    }

    #[tokio::test]
    async fn plugin_created_lazily_after_enable() {
        let h = Harness::new();
        let device = h.trusted();
        device.set_plugin_enabled(RECORDER, false).await;
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();
        assert!(!device.has_plugin(RECORDER).await);
        assert!(!device.is_plugin_enabled(RECORDER).await);

        device
            .receive_packet(link.id(), Packet::new(RECORDER_TYPE))
            .await
            .unwrap();
        assert!(h.log().is_empty());
        let stored = h.store.get(&h.peer.device_id()).unwrap();
        assert!(stored.disabled_plugins.contains(RECORDER));

        device.set_plugin_enabled(RECORDER, true).await;
        device
            .receive_packet(link.id(), Packet::new(RECORDER_TYPE))
            .await
            .unwrap();
        assert_eq!(h.log(), vec!["connected", RECORDER_TYPE]);
    }

    #[tokio::test]
    async fn losing_last_link_keeps_trust() {
        let h = Harness::new();
        let device = h.trusted();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();
        let mut events = device.subscribe();

        assert!(device.remove_link(link.id()).await);
        assert!(link.is_closed());
        assert!(!device.is_reachable().await);
        assert!(device.is_trusted().await);
        assert!(device.loaded_plugins().await.is_empty());
        let events = drain(&mut events);
        assert!(events.contains(&DeviceEvent::ReachableChanged(false)));
        assert!(!events.contains(&DeviceEvent::TrustedChanged(false)));
        assert!(!device.remove_link(link.id()).await);
        assert!(matches!(
            device.send_packet(&Packet::new(RECORDER_TYPE)).await,
            Err(Error::Unreachable)
        ));
    }

    #[tokio::test]
    async fn trusted_device_refuses_other_credential() {
        let h = Harness::new();
        let device = h.trusted();
        let (link, _sent) = h.link_with_key(Keypair::generate().public_key().clone());
        let result = device.add_link(&identity("Impostor"), link.clone()).await;
        assert!(matches!(result, Err(Error::CredentialMismatch)));
        assert!(link.is_closed());
        assert!(!device.is_reachable().await);
        assert_eq!(device.name().await, "Phone1");
    }

    #[tokio::test]
    async fn accepting_peer_request_pairs_and_persists() {
        let h = Harness::new();
        let device = h.untrusted();
        let mut events = device.subscribe();
        let (link, mut sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();

        device
            .receive_packet(link.id(), pair_packet(true))
            .await
            .unwrap();
        assert!(device.has_pairing_requests().await);
        assert!(!device.is_trusted().await);
        let seen = drain(&mut events);
        assert!(seen.contains(&DeviceEvent::PairingRequest));
        assert!(seen.contains(&DeviceEvent::HasPairingRequestsChanged(true)));

        device.accept_pairing().await;
        assert!(device.is_trusted().await);
        assert!(!device.has_pairing_requests().await);
        assert_eq!(pair_values(&mut sent), vec![true]);
        assert!(drain(&mut events).contains(&DeviceEvent::TrustedChanged(true)));
        let stored = h.store.get(&h.peer.device_id()).unwrap();
        assert_eq!(&stored.public_key, h.peer.public_key());
        assert_eq!(stored.name, "Phone1");
        assert!(device.has_plugin(RECORDER).await);
    }

    #[tokio::test]
    async fn peer_unpair_revokes_trust() {
        let h = Harness::new();
        h.store
            .save(&DeviceRecord {
                id: h.peer.device_id(),
                name: "Phone1".into(),
                device_type: DeviceType::Phone,
                public_key: h.peer.public_key().clone(),
                disabled_plugins: BTreeSet::new(),
            })
            .unwrap();
        let device = h.trusted();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();

        device
            .receive_packet(link.id(), pair_packet(false))
            .await
            .unwrap();
        assert!(!device.is_trusted().await);
        assert!(h.store.get(&h.peer.device_id()).is_none());
        assert!(device.loaded_plugins().await.is_empty());
        assert!(device.is_reachable().await);
    }

    #[tokio::test]
    async fn local_unpair_notifies_every_link() {
        let h = Harness::new();
        let device = h.trusted();
        let (a, mut sent_a) = h.link();
        let (b, mut sent_b) = h.link();
        device.add_link(&identity("Phone1"), a).await.unwrap();
        device.add_link(&identity("Phone1"), b).await.unwrap();

        device.unpair().await;
        assert!(!device.is_trusted().await);
        assert_eq!(pair_values(&mut sent_a), vec![false]);
        assert_eq!(pair_values(&mut sent_b), vec![false]);
        assert!(device.record().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_once() {
        let h = Harness::new();
        let device = h.untrusted();
        let (link, mut sent) = h.link();
        device.add_link(&identity("Phone1"), link.clone()).await.unwrap();
        let mut events = device.subscribe();

        device.request_pair().await.unwrap();
        assert_eq!(pair_values(&mut sent), vec![true]);
        assert_eq!(
            device.pair_state(link.id()).await,
            Some(PairState::RequestedByMe)
        );

        loop {
            match events.recv().await.unwrap() {
                DeviceEvent::PairingError(e) => {
                    assert_eq!(e, PairingError::Timeout);
                    break;
                }
                _ => continue,
            }
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        let timeouts = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::PairingError(_)))
            .count();
        assert_eq!(timeouts, 0);
        assert_eq!(device.pair_state(link.id()).await, Some(PairState::Unpaired));
        assert!(!device.is_trusted().await);
    }

    #[tokio::test(start_paused = true)]
    async fn pair_reports_timeout() {
        let h = Harness::new();
        let device = h.untrusted();
        let (link, mut sent) = h.link();
        device.add_link(&identity("Phone1"), link).await.unwrap();
        assert!(matches!(device.pair().await, Err(Error::PairingTimeout)));
        assert_eq!(pair_values(&mut sent), vec![true]);
        assert!(!device.is_trusted().await);
    }

    #[tokio::test]
    async fn pair_needs_a_link_and_is_done_when_trusted() {
        let h = Harness::new();
        assert!(matches!(h.untrusted().pair().await, Err(Error::Unreachable)));
        let device = h.trusted();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link).await.unwrap();
        device.pair().await.unwrap();
    }

    #[tokio::test]
    async fn send_prefers_most_recently_active_link() {
        let h = Harness::new();
        let device = h.trusted();
        let (a, mut sent_a) = h.link();
        let (b, mut sent_b) = h.link();
        device.add_link(&identity("Phone1"), a.clone()).await.unwrap();
        device.add_link(&identity("Phone1"), b.clone()).await.unwrap();

        device.send_packet(&Packet::new(RECORDER_TYPE)).await.unwrap();
        assert!(sent_b.try_recv().is_ok());
        assert!(sent_a.try_recv().is_err());

        device
            .receive_packet(a.id(), Packet::new(RECORDER_TYPE))
            .await
            .unwrap();
        device.send_packet(&Packet::new(RECORDER_TYPE)).await.unwrap();
        assert!(sent_a.try_recv().is_ok());
        assert!(sent_b.try_recv().is_err());

        let links = device.available_links().await;
        assert_eq!(links.len(), 2);
        assert_eq!(&links[0].0, a.id());
        assert_eq!(links[0].1, TransportKind::Loopback);
    }

    #[tokio::test]
    async fn untrusted_device_only_sends_pairing_control() {
        let h = Harness::new();
        let device = h.untrusted();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link).await.unwrap();
        assert!(matches!(
            device.send_packet(&Packet::new(RECORDER_TYPE)).await,
            Err(Error::Untrusted)
        ));
        device.send_packet(&pair_packet(false)).await.unwrap();
    }

    #[tokio::test]
    async fn removing_link_fails_every_waiting_fetch() {
        let h = Harness::new();
        let device = h.untrusted();
        let ((ours, mut inbound), (theirs, _sent)) =
            LoopbackLink::pair(h.local.public_key().clone(), h.peer.public_key().clone());
        device.add_link(&identity("Phone1"), ours.clone()).await.unwrap();

        let (_writer, reader) = tokio::io::duplex(64);
        let stalled = Payload::from_reader(Box::new(reader), Some(8));
        theirs
            .send(&Packet::new(RECORDER_TYPE).with_payload(stalled))
            .await
            .unwrap();
        let packet = inbound.recv().await.unwrap();
        let payload = Arc::clone(packet.payload().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("icon");
        let coordinator = h.ctx.coordinator.clone();
        let (first, second, removed) = tokio::join!(
            coordinator.fetch(&dest, Arc::clone(&payload)),
            coordinator.fetch(&dest, Arc::clone(&payload)),
            async {
                while !coordinator.is_in_flight(&dest) {
                    tokio::task::yield_now().await;
                }
                device.remove_link(ours.id()).await
            }
        );
        assert!(removed);
        assert_eq!(first, Err(TransferError::SourceClosed));
        assert_eq!(second, Err(TransferError::SourceClosed));
        assert!(!dest.exists());
        assert!(!dir.path().join("icon.part").exists());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn rename_emits_and_persists() {
        let h = Harness::new();
        let device = h.trusted();
        let mut events = device.subscribe();
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone2"), link).await.unwrap();
        assert!(drain(&mut events).contains(&DeviceEvent::NameChanged("Phone2".into())));
        assert_eq!(h.store.get(&h.peer.device_id()).unwrap().name, "Phone2");
    }

    #[tokio::test]
    async fn plugins_see_the_name_after_rename() {
        let h = Harness::new();
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = h.ctx.clone();
        ctx.plugins = Arc::new(PluginTable::new(vec![ping::registration(sink.clone())]));
        let device = Device::restore(
            DeviceRecord {
                id: h.peer.device_id(),
                name: "Phone1".into(),
                device_type: DeviceType::Phone,
                public_key: h.peer.public_key().clone(),
                disabled_plugins: BTreeSet::new(),
            },
            ctx,
        );
        let (a, _sent_a) = h.link();
        device.add_link(&identity("Phone1"), a.clone()).await.unwrap();
        assert!(device.has_plugin(ping::NAME).await);

        let (b, _sent_b) = h.link();
        device.add_link(&identity("Phone2"), b).await.unwrap();
        device
            .receive_packet(a.id(), Packet::new(PACKET_TYPE_PING))
            .await
            .unwrap();
        assert_eq!(sink.shown()[0].device_name, "Phone2");
    }

    #[tokio::test]
    async fn icons_and_fingerprints() {
        let h = Harness::new();
        let device = h.trusted();
        assert_eq!(device.icon_name().await, "smartphone");
        assert_eq!(device.status_icon_name().await, "smartphonetrusted");
        let (link, _sent) = h.link();
        device.add_link(&identity("Phone1"), link).await.unwrap();
        assert_eq!(device.status_icon_name().await, "smartphoneconnected");
        let info = device.encryption_info().await;
        assert!(info.contains(&h.local.public_key().fingerprint()));
        assert!(info.contains(&h.peer.public_key().fingerprint()));
    }

    #[test]
    fn device_type_spellings() {
        assert_eq!(DeviceType::from("Phone"), DeviceType::Phone);
        assert_eq!(DeviceType::from("smartphone"), DeviceType::Phone);
        assert_eq!(DeviceType::from("TV"), DeviceType::Tv);
        assert_eq!(DeviceType::from("toaster"), DeviceType::Unknown);
        assert_eq!(DeviceType::Phone.to_string(), "smartphone");
    }
}
