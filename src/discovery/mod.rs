//! LAN peer discovery.
//!
//! A single control task owns the device table. Browse callbacks,
//! resolution results and liveness probes all arrive as commands on one
//! channel, so the table never needs a lock. Resolution is
//! single-flight: service-found events queue up and are resolved one at
//! a time, with stale results discarded by token.

pub mod advertise;
pub mod probe;
pub mod resolver;

use anyhow::Result;
use log::{debug, info, warn};
use mdns_sd::ServiceDaemon;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub use advertise::Advertiser;
use probe::{HttpProber, Prober};
use resolver::{instance_name, MdnsResolver, ResolveError, ResolvedService, Resolver, SERVICE_TYPE};

/// Resolution attempts per service-found event before giving up.
const MAX_RESOLVE_RETRIES: u32 = 3;
/// Base delay between attempts; scaled linearly by the attempt number.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Delay before re-trying after platform resolver contention.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A peer admitted to the device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Raw browse notification, before resolution.
#[derive(Debug, Clone)]
pub enum BrowseEvent {
    Found { name: String },
    Lost { name: String },
}

/// Source of service found/lost notifications. Started when the first
/// watcher subscribes, stopped when the last one goes away.
pub trait ServiceBrowser: Send + Sync {
    fn start(&self, events: mpsc::UnboundedSender<BrowseEvent>) -> Result<()>;
    fn stop(&self);
}

/// mDNS-backed browser over the shared service type.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            pump: std::sync::Mutex::new(None),
        })
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn start(&self, events: mpsc::UnboundedSender<BrowseEvent>) -> Result<()> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                let mapped = match event {
                    mdns_sd::ServiceEvent::ServiceFound(_, fullname) => Some(BrowseEvent::Found {
                        name: instance_name(&fullname).to_string(),
                    }),
                    mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => Some(BrowseEvent::Lost {
                        name: instance_name(&fullname).to_string(),
                    }),
                    _ => None,
                };
                if let Some(event) = mapped {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.pump.lock().unwrap().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// One queued resolution. The token identifies the service-found event
/// that produced it; a newer event for the same name supersedes it.
#[derive(Debug, Clone)]
struct ResolveRequest {
    name: String,
    token: u64,
}

#[derive(Debug, Clone)]
struct LocalDevice {
    enabled: bool,
    name: String,
    host: String,
    port: u16,
}

enum Command {
    Subscribe,
    Unsubscribe,
    SetLocal {
        enabled: bool,
        name: String,
        host: String,
        port: u16,
    },
    Snapshot(oneshot::Sender<Vec<Device>>),
    Browse(BrowseEvent),
    Resolved {
        request: ResolveRequest,
        result: Result<ResolvedService, ResolveError>,
    },
    Validated {
        name: String,
        host: String,
        port: u16,
        alive: bool,
    },
    Retry(ResolveRequest),
    Kick,
}

/// Handle to the discovery control task. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryEngine {
    cmd: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<Vec<Device>>,
}

impl DiscoveryEngine {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        resolver: Arc<dyn Resolver>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let state = EngineState::new(browser, resolver, prober, cmd_tx.clone(), snapshot_tx);
        tokio::spawn(state.run(cmd_rx));
        Self {
            cmd: cmd_tx,
            snapshot_rx,
        }
    }

    /// Full mDNS-backed engine, as used in production.
    pub fn with_mdns() -> Result<Self> {
        Ok(Self::new(
            Arc::new(MdnsBrowser::new()?),
            Arc::new(MdnsResolver::new()?),
            Arc::new(HttpProber::new()?),
        ))
    }

    /// Register interest in the device table. Browsing starts with the
    /// first watcher and stops when the last one is dropped.
    pub fn subscribe(&self) -> DeviceWatcher {
        let _ = self.cmd.send(Command::Subscribe);
        DeviceWatcher {
            rx: self.snapshot_rx.clone(),
            cmd: self.cmd.clone(),
        }
    }

    /// Record this device's own advertised identity. An enabled local
    /// device appears in the table and is never evicted by lost events
    /// for its own host.
    pub fn set_local_device(&self, enabled: bool, name: &str, host: &str, port: u16) {
        let _ = self.cmd.send(Command::SetLocal {
            enabled,
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }

    /// Current device table, sorted by name.
    pub async fn snapshot(&self) -> Vec<Device> {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Command::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Live view of the device table held by one subscriber. Dropping it
/// releases the subscription.
pub struct DeviceWatcher {
    rx: watch::Receiver<Vec<Device>>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl DeviceWatcher {
    /// Wait for the next table change.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx.changed().await?;
        Ok(())
    }

    pub fn current(&self) -> Vec<Device> {
        self.rx.borrow().clone()
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::Unsubscribe);
    }
}

struct EngineState {
    browser: Arc<dyn ServiceBrowser>,
    resolver: Arc<dyn Resolver>,
    prober: Arc<dyn Prober>,
    cmd: mpsc::UnboundedSender<Command>,
    snapshot: watch::Sender<Vec<Device>>,
    // Device table keyed by host, with a name index for eviction.
    devices: HashMap<String, Device>,
    name_to_host: HashMap<String, String>,
    // name -> token of the newest service-found event for that name.
    pending: HashMap<String, u64>,
    retries: HashMap<String, u32>,
    queue: VecDeque<ResolveRequest>,
    // A busy-bounced request parked until its scheduled kick arrives.
    deferred: Option<ResolveRequest>,
    resolving: bool,
    next_token: u64,
    listeners: usize,
    browsing: bool,
    forwarder: Option<JoinHandle<()>>,
    local: Option<LocalDevice>,
}

impl EngineState {
    fn new(
        browser: Arc<dyn ServiceBrowser>,
        resolver: Arc<dyn Resolver>,
        prober: Arc<dyn Prober>,
        cmd: mpsc::UnboundedSender<Command>,
        snapshot: watch::Sender<Vec<Device>>,
    ) -> Self {
        Self {
            browser,
            resolver,
            prober,
            cmd,
            snapshot,
            devices: HashMap::new(),
            name_to_host: HashMap::new(),
            pending: HashMap::new(),
            retries: HashMap::new(),
            queue: VecDeque::new(),
            deferred: None,
            resolving: false,
            next_token: 0,
            listeners: 0,
            browsing: false,
            forwarder: None,
            local: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        self.stop_browsing();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe => {
                self.listeners += 1;
                if self.listeners == 1 {
                    self.start_browsing();
                }
            }
            Command::Unsubscribe => {
                self.listeners = self.listeners.saturating_sub(1);
                if self.listeners == 0 {
                    self.stop_browsing();
                }
            }
            Command::SetLocal {
                enabled,
                name,
                host,
                port,
            } => {
                self.local = Some(LocalDevice {
                    enabled,
                    name: name.clone(),
                    host: host.clone(),
                    port,
                });
                if enabled {
                    self.upsert(name, host, port);
                } else {
                    self.remove_device(&name, &host);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.sorted_devices());
            }
            Command::Browse(BrowseEvent::Found { name }) => {
                if !self.browsing {
                    return;
                }
                debug!("Service found: {}", name);
                let token = self.next_token;
                self.next_token += 1;
                self.pending.insert(name.clone(), token);
                self.queue.push_back(ResolveRequest { name, token });
                self.pump();
            }
            Command::Browse(BrowseEvent::Lost { name }) => {
                debug!("Service lost: {}", name);
                self.pending.remove(&name);
                let host = match self.name_to_host.get(&name) {
                    Some(host) => host.clone(),
                    None => return,
                };
                self.remove_device(&name, &host);
            }
            Command::Resolved { request, result } => self.on_resolved(request, result),
            Command::Validated {
                name,
                host,
                port,
                alive,
            } => {
                if alive {
                    info!("Discovered device: {} at {}:{}", name, host, port);
                    self.upsert(name, host, port);
                } else {
                    debug!("Dropping unresponsive device {} at {}:{}", name, host, port);
                    self.remove_device(&name, &host);
                }
            }
            Command::Retry(request) => {
                // Single-flight was held across the delay.
                if self.pending.get(&request.name) != Some(&request.token) {
                    self.resolving = false;
                    self.pump();
                    return;
                }
                self.spawn_resolve(request);
            }
            Command::Kick => {
                if let Some(request) = self.deferred.take() {
                    self.queue.push_front(request);
                }
                self.pump();
            }
        }
    }

    fn start_browsing(&mut self) {
        if self.browsing {
            return;
        }
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        match self.browser.start(event_tx) {
            Ok(()) => {
                let cmd = self.cmd.clone();
                self.forwarder = Some(tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        if cmd.send(Command::Browse(event)).is_err() {
                            break;
                        }
                    }
                }));
                self.browsing = true;
                info!("Started browsing for peers");
            }
            Err(e) => warn!("Failed to start browsing: {}", e),
        }
    }

    /// Stop browsing and forget every discovered peer. The enabled
    /// local device is re-seeded so it stays visible.
    fn stop_browsing(&mut self) {
        if !self.browsing {
            return;
        }
        self.browser.stop();
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        self.browsing = false;
        self.queue.clear();
        self.pending.clear();
        self.retries.clear();
        self.deferred = None;
        // `resolving` stays held: an in-flight resolve cannot be
        // cancelled, so the slot frees only when its result lands and
        // is discarded as stale.
        self.devices.clear();
        self.name_to_host.clear();
        if let Some(local) = self.local.clone() {
            if local.enabled {
                self.devices.insert(
                    local.host.clone(),
                    Device {
                        name: local.name.clone(),
                        host: local.host.clone(),
                        port: local.port,
                    },
                );
                self.name_to_host.insert(local.name, local.host);
            }
        }
        self.notify();
        info!("Stopped browsing for peers");
    }

    /// Start the next queued resolution unless one is already running.
    fn pump(&mut self) {
        if self.resolving {
            return;
        }
        while let Some(request) = self.queue.pop_front() {
            // Skip requests superseded by a newer found event.
            if self.pending.get(&request.name) != Some(&request.token) {
                continue;
            }
            self.resolving = true;
            self.spawn_resolve(request);
            return;
        }
    }

    fn spawn_resolve(&self, request: ResolveRequest) {
        let resolver = self.resolver.clone();
        let cmd = self.cmd.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&request.name).await;
            let _ = cmd.send(Command::Resolved { request, result });
        });
    }

    fn on_resolved(
        &mut self,
        request: ResolveRequest,
        result: Result<ResolvedService, ResolveError>,
    ) {
        self.resolving = false;
        if self.pending.get(&request.name) != Some(&request.token) {
            debug!("Discarding stale resolution for {}", request.name);
            self.pump();
            return;
        }
        match result {
            Ok(service) => {
                self.pending.remove(&request.name);
                self.retries.remove(&request.name);
                self.pump();
                let prober = self.prober.clone();
                let cmd = self.cmd.clone();
                tokio::spawn(async move {
                    let alive = prober.probe(&service.host, service.port).await;
                    let _ = cmd.send(Command::Validated {
                        name: request.name,
                        host: service.host,
                        port: service.port,
                        alive,
                    });
                });
            }
            Err(ResolveError::Busy) => {
                // Contention does not consume a retry attempt. The
                // request is parked so no pump can re-run it before the
                // delay has elapsed.
                debug!("Resolver busy for {}, re-queueing", request.name);
                self.deferred = Some(request);
                self.schedule(BUSY_RETRY_DELAY, Command::Kick);
            }
            Err(err) => {
                let attempt = self.retries.get(&request.name).copied().unwrap_or(0) + 1;
                if attempt <= MAX_RESOLVE_RETRIES {
                    warn!(
                        "Resolve attempt {} for {} failed: {}",
                        attempt, request.name, err
                    );
                    self.retries.insert(request.name.clone(), attempt);
                    // Hold the single-flight slot across the delay so no
                    // other resolution can start in between.
                    self.resolving = true;
                    self.schedule(RESOLVE_RETRY_DELAY * attempt, Command::Retry(request));
                } else {
                    warn!(
                        "Giving up on {} after {} attempts",
                        request.name, MAX_RESOLVE_RETRIES
                    );
                    self.pending.remove(&request.name);
                    self.retries.remove(&request.name);
                    self.pump();
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let cmd = self.cmd.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = cmd.send(command);
        });
    }

    /// Insert or update a device, evicting conflicting entries: an old
    /// host the name moved away from, and an old name that previously
    /// occupied this host.
    fn upsert(&mut self, name: String, host: String, port: u16) {
        if let Some(previous_host) = self.name_to_host.get(&name) {
            if previous_host != &host {
                let previous_host = previous_host.clone();
                self.devices.remove(&previous_host);
            }
        }
        if let Some(displaced) = self
            .devices
            .get(&host)
            .map(|d| d.name.clone())
            .filter(|n| n != &name)
        {
            self.name_to_host.remove(&displaced);
        }
        self.devices.insert(
            host.clone(),
            Device {
                name: name.clone(),
                host: host.clone(),
                port,
            },
        );
        self.name_to_host.insert(name, host);
        self.notify();
    }

    fn remove_device(&mut self, name: &str, host: &str) {
        // Never evict our own enabled advertisement.
        if let Some(local) = &self.local {
            if local.enabled && local.host == host {
                return;
            }
        }
        if let Some(mapped_host) = self.name_to_host.remove(name) {
            self.devices.remove(&mapped_host);
        } else if self.devices.get(host).map(|d| d.name.as_str()) == Some(name) {
            self.devices.remove(host);
        }
        self.notify();
    }

    fn sorted_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        devices
    }

    fn notify(&self) {
        let _ = self.snapshot.send(self.sorted_devices());
    }
}
