use anyhow::Result;
use log::{debug, error, info};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::resolver::SERVICE_TYPE;

/// Re-register well before caches expire the advertisement.
const REFRESH_INTERVAL: Duration = Duration::from_secs(55);

/// Advertises this device on the LAN under the shared service type.
/// Registration is refreshed periodically until `stop` is called.
pub struct Advertiser {
    mdns: ServiceDaemon,
    refresh: Option<JoinHandle<()>>,
    fullname: Option<String>,
}

impl Advertiser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mdns: ServiceDaemon::new()?,
            refresh: None,
            fullname: None,
        })
    }

    /// Register the service and start the refresh loop. Calling again
    /// replaces the previous registration.
    pub fn advertise(&mut self, name: &str, ip: &str, port: u16) -> Result<()> {
        self.stop();

        let service_info = Self::build_service_info(name, ip, port)?;
        let fullname = service_info.get_fullname().to_string();
        self.mdns.register(service_info)?;
        info!("Advertising '{}' on {} port {}", name, ip, port);

        let mdns = self.mdns.clone();
        let name = name.to_string();
        let ip = ip.to_string();
        self.refresh = Some(tokio::spawn(async move {
            loop {
                sleep(REFRESH_INTERVAL).await;
                match Self::build_service_info(&name, &ip, port) {
                    Ok(info) => {
                        if let Err(e) = mdns.register(info) {
                            error!("Failed to refresh service advertisement: {}", e);
                        } else {
                            debug!("Refreshed service advertisement");
                        }
                    }
                    Err(e) => error!("Failed to create service info for refresh: {}", e),
                }
            }
        }));
        self.fullname = Some(fullname);
        Ok(())
    }

    fn build_service_info(name: &str, ip: &str, port: u16) -> Result<ServiceInfo> {
        let hostname = format!("{}.local.", ip);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            name,
            &hostname,
            ip,
            port,
            HashMap::<String, String>::new(),
        )?;
        Ok(info)
    }

    /// Withdraw the advertisement and stop refreshing.
    pub fn stop(&mut self) {
        if let Some(handle) = self.refresh.take() {
            handle.abort();
        }
        if let Some(fullname) = self.fullname.take() {
            if let Err(e) = self.mdns.unregister(&fullname) {
                debug!("Failed to unregister {}: {}", fullname, e);
            }
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
