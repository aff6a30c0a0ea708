//! mDNS discovery of streaming hosts.
//!
//! Hosts advertise their control plane as `_nvstream._tcp.local.`; browsing
//! that service type yields candidate addresses which the computer manager
//! then polls and (if new) tracks. Discovery is advisory — a host that stops
//! advertising is not forgotten, it just goes unpolled-by-mDNS.

use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_nvstream._tcp.local.";

// MARK: - DiscoveryEvent

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A host resolved on the local network.
    ComputerAdded { address: IpAddr, name: String },
    /// A previously-seen advertisement went away.
    ComputerRemoved { name: String },
    /// The browse operation itself failed.
    Failure { error: String },
}

// MARK: - DiscoveryService

/// Browses the local network for streaming hosts via mDNS.
pub struct DiscoveryService {
    daemon: Option<ServiceDaemon>,
}

impl DiscoveryService {
    pub fn new() -> Self {
        Self { daemon: None }
    }

    /// Start browsing. Returns a channel that emits one event per
    /// resolved/removed advertisement until [`stop`](Self::stop) is called.
    pub fn start_browsing(
        &mut self,
    ) -> Result<tokio::sync::mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        info!("[Discovery] Found host: {}", info.get_fullname());
                        let addresses: Vec<_> = info.get_addresses().iter().copied().collect();
                        if let Some(addr) = addresses.first() {
                            let event = DiscoveryEvent::ComputerAdded {
                                address: *addr,
                                name: info.get_hostname().trim_end_matches('.').to_owned(),
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        debug!("[Discovery] Host gone: {fullname}");
                        let event = DiscoveryEvent::ComputerRemoved { name: fullname };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[Discovery] Browse channel failed: {e}");
                        let _ = tx
                            .send(DiscoveryEvent::Failure {
                                error: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        self.daemon = Some(daemon);
        Ok(rx)
    }

    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown();
        }
    }
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

// MARK: - DiscoveryError

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed to start: {0}")]
    DaemonFailed(String),

    #[error("Failed to browse service: {0}")]
    BrowseFailed(String),
}
