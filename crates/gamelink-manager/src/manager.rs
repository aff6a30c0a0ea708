//! Background polling service over the tracked host set.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gamelink_core::{AddressTuple, ComputerDetails, State};
use gamelink_discovery::{DiscoveryEvent, DiscoveryService};
use gamelink_http::{ClientIdentity, HostClient};

use crate::store::ComputerStore;
use crate::ManagerError;

pub const POLLING_PERIOD: Duration = Duration::from_secs(3);

/// Poll tasks run one per tracked host, but never more than this many
/// in-flight serverinfo queries at once.
const MAX_CONCURRENT_POLLS: usize = 4;

// MARK: - ManagerEvent

#[derive(Debug)]
pub enum ManagerEvent {
    /// A tracked host changed (poll completed, app list refreshed, …).
    /// Carries a merged snapshot; the manager retains the live record.
    ComputerUpdated(ComputerDetails),
    /// mDNS browsing failed; manual adds still work.
    DiscoveryFailure(String),
}

// MARK: - Database gate

/// Reference-count gate around the store: in-flight polls hold a reference,
/// and the last release closes the pool, so teardown can never yank the
/// database out from under a poll that already started.
struct DatabaseHandle {
    store: ComputerStore,
    refs: AtomicUsize,
}

impl DatabaseHandle {
    fn new(store: ComputerStore) -> Self {
        Self {
            store,
            refs: AtomicUsize::new(1),
        }
    }

    fn acquire(&self) -> bool {
        if self.refs.load(Ordering::SeqCst) == 0 {
            return false;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.store.close().await;
        }
    }
}

// MARK: - Polling entries

struct PollingEntry {
    computer: StdMutex<ComputerDetails>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PollingEntry {
    fn new(computer: ComputerDetails) -> Arc<Self> {
        Arc::new(Self {
            computer: StdMutex::new(computer),
            task: StdMutex::new(None),
        })
    }

    fn snapshot(&self) -> ComputerDetails {
        self.computer.lock().expect("computer lock").clone()
    }
}

struct Inner {
    identity: Arc<ClientIdentity>,
    db: DatabaseHandle,
    entries: StdMutex<Vec<Arc<PollingEntry>>>,
    poll_permits: Semaphore,
    polling_active: AtomicBool,
    events: mpsc::Sender<ManagerEvent>,
    discovery: StdMutex<Option<DiscoveryService>>,
    discovery_task: StdMutex<Option<JoinHandle<()>>>,
}

// MARK: - ComputerManager

/// Tracks every known streaming host and keeps their records fresh.
pub struct ComputerManager {
    inner: Arc<Inner>,
}

impl ComputerManager {
    /// Open the store in `data_dir`, import legacy formats, load the known
    /// hosts, and return the manager plus its event stream.
    pub async fn open(
        data_dir: &Path,
    ) -> Result<(Self, mpsc::Receiver<ManagerEvent>), ManagerError> {
        let identity_dir = data_dir.to_owned();
        let identity = tokio::task::spawn_blocking(move || {
            ClientIdentity::load_or_generate(&identity_dir)
        })
        .await
        .expect("identity task panicked")?;

        let store = ComputerStore::open(data_dir).await?;
        let known = store.all_computers().await?;
        info!("Loaded {} known host(s)", known.len());

        let (events_tx, events_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            identity: Arc::new(identity),
            db: DatabaseHandle::new(store),
            entries: StdMutex::new(known.into_iter().map(PollingEntry::new).collect()),
            poll_permits: Semaphore::new(MAX_CONCURRENT_POLLS),
            polling_active: AtomicBool::new(false),
            events: events_tx,
            discovery: StdMutex::new(None),
            discovery_task: StdMutex::new(None),
        });

        Ok((Self { inner }, events_rx))
    }

    pub fn identity(&self) -> Arc<ClientIdentity> {
        Arc::clone(&self.inner.identity)
    }

    /// Current snapshot of one tracked host.
    pub fn computer(&self, uuid: &str) -> Option<ComputerDetails> {
        let entries = self.inner.entries.lock().expect("entries lock");
        entries
            .iter()
            .map(|e| e.snapshot())
            .find(|c| c.uuid.as_deref() == Some(uuid))
    }

    pub fn computers(&self) -> Vec<ComputerDetails> {
        let entries = self.inner.entries.lock().expect("entries lock");
        entries.iter().map(|e| e.snapshot()).collect()
    }

    // ── Polling lifecycle ─────────────────────────────────────────────────────

    /// Start mDNS discovery and one poll task per tracked host.
    pub fn start_polling(&self) {
        if self.inner.polling_active.swap(true, Ordering::SeqCst) {
            return;
        }

        // mDNS feeds newly-seen hosts into the same tracked set.
        let mut discovery = DiscoveryService::new();
        match discovery.start_browsing() {
            Ok(mut discovery_rx) => {
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    while let Some(event) = discovery_rx.recv().await {
                        match event {
                            DiscoveryEvent::ComputerAdded { address, name } => {
                                debug!("mDNS: host {name} at {address}");
                                if let Ok(addr) = AddressTuple::new(
                                    address.to_string(),
                                    gamelink_core::DEFAULT_HTTP_PORT,
                                ) {
                                    add_discovered(&inner, addr);
                                }
                            }
                            DiscoveryEvent::ComputerRemoved { name } => {
                                // Nothing to do: un-advertised hosts stay
                                // tracked and just poll as offline.
                                debug!("mDNS: host {name} gone");
                            }
                            DiscoveryEvent::Failure { error } => {
                                warn!("mDNS discovery failed: {error}");
                                let _ = inner
                                    .events
                                    .send(ManagerEvent::DiscoveryFailure(error))
                                    .await;
                            }
                        }
                    }
                });
                *self.inner.discovery_task.lock().expect("discovery task lock") = Some(task);
                *self.inner.discovery.lock().expect("discovery lock") = Some(discovery);
            }
            Err(e) => warn!("mDNS discovery unavailable: {e}"),
        }

        let entries: Vec<_> = {
            let entries = self.inner.entries.lock().expect("entries lock");
            entries.clone()
        };
        for entry in entries {
            // Report known hosts once up front so callers can render them
            // before the first poll answers.
            let snapshot = entry.snapshot();
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let _ = events.send(ManagerEvent::ComputerUpdated(snapshot)).await;
            });
            ensure_poll_task(&self.inner, &entry);
        }
    }

    /// Stop discovery and all poll tasks. Tracked hosts are kept.
    pub fn stop_polling(&self) {
        if !self.inner.polling_active.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(mut discovery) = self.inner.discovery.lock().expect("discovery lock").take() {
            discovery.stop();
        }
        if let Some(task) = self
            .inner
            .discovery_task
            .lock()
            .expect("discovery task lock")
            .take()
        {
            task.abort();
        }

        let entries = self.inner.entries.lock().expect("entries lock");
        for entry in entries.iter() {
            if let Some(task) = entry.task.lock().expect("poll task lock").take() {
                task.abort();
            }
        }
    }

    /// Stop polling and release the manager's own database reference; the
    /// store closes once any still-running poll finishes.
    pub async fn shutdown(&self) {
        self.stop_polling();
        self.inner.db.release().await;
    }

    // ── Adding and removing hosts ─────────────────────────────────────────────

    /// Add a host by explicit address, blocking on one initial poll.
    /// Returns `true` when the host answered and is now tracked.
    pub async fn add_computer_manually(
        &self,
        address: AddressTuple,
    ) -> Result<bool, ManagerError> {
        let mut placeholder = ComputerDetails::new();
        placeholder.manual_address = Some(address);
        placeholder.name = String::new();

        let entry = PollingEntry::new(placeholder);
        run_poll(&self.inner, &entry).await;

        if entry.snapshot().state == State::Online {
            add_entry(&self.inner, entry);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Stop tracking `uuid` and delete its persisted row.
    pub async fn remove_computer(&self, uuid: &str) -> Result<(), ManagerError> {
        if !self.inner.db.acquire() {
            return Err(ManagerError::DatabaseClosed);
        }

        let result = self.inner.db.store.delete_computer(uuid).await;

        {
            let mut entries = self.inner.entries.lock().expect("entries lock");
            if let Some(index) = entries
                .iter()
                .position(|e| e.snapshot().uuid.as_deref() == Some(uuid))
            {
                let entry = entries.remove(index);
                let task = entry.task.lock().expect("poll task lock").take();
                if let Some(task) = task {
                    task.abort();
                }
            }
        }

        self.inner.db.release().await;
        result
    }

    // ── App list ─────────────────────────────────────────────────────────────

    /// Fetch the host's app list over its active address and remember the
    /// raw XML on the tracked record.
    pub async fn refresh_app_list(&self, uuid: &str) -> Result<(), ManagerError> {
        let entry = {
            let entries = self.inner.entries.lock().expect("entries lock");
            entries
                .iter()
                .find(|e| e.snapshot().uuid.as_deref() == Some(uuid))
                .cloned()
        }
        .ok_or_else(|| ManagerError::HostNotFound {
            uuid: uuid.to_owned(),
        })?;

        let snapshot = entry.snapshot();
        if snapshot.state != State::Online {
            return Err(ManagerError::HostOffline {
                uuid: uuid.to_owned(),
            });
        }
        let address = snapshot
            .active_address
            .clone()
            .or(snapshot.local_address.clone())
            .ok_or_else(|| ManagerError::HostOffline {
                uuid: uuid.to_owned(),
            })?;

        let client = HostClient::new(
            &address,
            snapshot.https_port,
            snapshot.server_cert.clone(),
            Arc::clone(&self.inner.identity),
        )?;
        let raw_app_list = client.app_list_raw().await?;

        let snapshot = {
            let mut computer = entry.computer.lock().expect("computer lock");
            computer.raw_app_list = Some(raw_app_list);
            computer.clone()
        };
        let _ = self
            .inner
            .events
            .send(ManagerEvent::ComputerUpdated(snapshot))
            .await;
        Ok(())
    }
}

// MARK: - Tracked-set mutation

/// Coalesce a newly-discovered address into the tracked set.
fn add_discovered(inner: &Arc<Inner>, address: AddressTuple) {
    let mut placeholder = ComputerDetails::new();
    placeholder.local_address = Some(address);
    placeholder.name = String::new();
    add_entry(inner, PollingEntry::new(placeholder));
}

fn same_host(existing: &ComputerDetails, incoming: &ComputerDetails) -> bool {
    if let (Some(a), Some(b)) = (&existing.uuid, &incoming.uuid) {
        return a == b;
    }
    let known = [
        &existing.local_address,
        &existing.remote_address,
        &existing.manual_address,
        &existing.ipv6_address,
        &existing.active_address,
    ];
    let candidates = [&incoming.local_address, &incoming.manual_address];
    candidates.iter().any(|candidate| {
        candidate
            .as_ref()
            .is_some_and(|c| known.iter().any(|k| k.as_ref() == Some(c)))
    })
}

fn add_entry(inner: &Arc<Inner>, entry: Arc<PollingEntry>) {
    let incoming = entry.snapshot();
    let mut entries = inner.entries.lock().expect("entries lock");

    for existing in entries.iter() {
        let matches = same_host(&existing.snapshot(), &incoming);
        if matches {
            // Refresh the addresses in case the host was re-added by IP
            // after becoming unreachable on the stored ones.
            {
                let mut computer = existing.computer.lock().expect("computer lock");
                if incoming.local_address.is_some() {
                    computer.local_address = incoming.local_address.clone();
                }
                if incoming.manual_address.is_some() {
                    computer.manual_address = incoming.manual_address.clone();
                }
            }
            ensure_poll_task(inner, existing);
            return;
        }
    }

    entries.push(Arc::clone(&entry));
    drop(entries);
    ensure_poll_task(inner, &entry);
}

/// Start the per-host poll loop if polling is active and none runs yet.
fn ensure_poll_task(inner: &Arc<Inner>, entry: &Arc<PollingEntry>) {
    if !inner.polling_active.load(Ordering::SeqCst) {
        return;
    }
    let mut task = entry.task.lock().expect("poll task lock");
    if task.is_some() {
        return;
    }

    let inner = Arc::clone(inner);
    let entry_for_task = Arc::clone(entry);
    *task = Some(tokio::spawn(async move {
        while inner.polling_active.load(Ordering::SeqCst) {
            {
                // Bounded worker pool: hold a permit for the duration of one
                // poll so a large host list can't stampede the network.
                let _permit = inner
                    .poll_permits
                    .acquire()
                    .await
                    .expect("poll semaphore closed");
                if !run_poll(&inner, &entry_for_task).await {
                    return;
                }
            }
            tokio::time::sleep(POLLING_PERIOD).await;
        }
    }));
}

// MARK: - Polling

/// One poll pass: probe addresses, merge the outcome, persist, notify.
/// Returns false when the database is already shutting down.
async fn run_poll(inner: &Arc<Inner>, entry: &Arc<PollingEntry>) -> bool {
    let is_new = entry.snapshot().name.is_empty();

    if !inner.db.acquire() {
        return false;
    }

    let polled = poll_host(inner, entry).await;

    let snapshot = {
        let mut computer = entry.computer.lock().expect("computer lock");
        match &polled {
            Some(fresh) => computer.update(fresh),
            None => computer.state = State::Offline,
        }
        computer.clone()
    };

    if snapshot.state == State::Online {
        if let Some(uuid) = snapshot.uuid.as_deref() {
            // The host may have been removed while this poll was in flight;
            // don't resurrect its row.
            let still_tracked = is_new
                || matches!(inner.db.store.computer_by_uuid(uuid).await, Ok(Some(_)));
            if still_tracked {
                if let Err(e) = inner.db.store.update_computer(&snapshot).await {
                    warn!("Failed to persist host {uuid}: {e}");
                }
            }
        }
    }

    // A failed lookup of a brand-new host is not worth reporting.
    if !is_new || snapshot.state == State::Online {
        let _ = inner
            .events
            .send(ManagerEvent::ComputerUpdated(snapshot))
            .await;
    }

    inner.db.release().await;
    true
}

/// Probe the host's addresses one at a time, last-successful class first.
/// Never concurrent: the recorded active address must reflect the address
/// that actually answered last.
async fn poll_host(inner: &Arc<Inner>, entry: &Arc<PollingEntry>) -> Option<ComputerDetails> {
    let snapshot = entry.snapshot();

    let mut candidates: Vec<AddressTuple> = Vec::new();
    let ordered = [
        &snapshot.active_address,
        &snapshot.local_address,
        &snapshot.manual_address,
        &snapshot.remote_address,
        &snapshot.ipv6_address,
    ];
    for address in ordered.into_iter().flatten() {
        if !candidates.contains(address) {
            candidates.push(address.clone());
        }
    }

    for address in candidates {
        match try_poll_address(inner, &snapshot, &address).await {
            Some(mut fresh) => {
                fresh.active_address = Some(address);
                return Some(fresh);
            }
            None => continue,
        }
    }
    None
}

async fn try_poll_address(
    inner: &Arc<Inner>,
    expected: &ComputerDetails,
    address: &AddressTuple,
) -> Option<ComputerDetails> {
    let client = match HostClient::new(
        address,
        expected.https_port,
        expected.server_cert.clone(),
        Arc::clone(&inner.identity),
    ) {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build client for {address}: {e}");
            return None;
        }
    };

    match client.computer_details().await {
        Ok(fresh) => {
            if let (Some(expected_uuid), Some(fresh_uuid)) = (&expected.uuid, &fresh.uuid) {
                if expected_uuid != fresh_uuid {
                    // Not the machine this record belongs to; DHCP probably
                    // handed its address to someone else.
                    info!("Polling {address} returned a different host");
                    return None;
                }
            }
            Some(fresh)
        }
        Err(e) => {
            debug!("Poll of {address} failed: {e}");
            None
        }
    }
}
