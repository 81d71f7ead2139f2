use async_trait::async_trait;
use log::debug;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

/// Service type advertised and browsed for on the LAN.
pub const SERVICE_TYPE: &str = "_lanshelf._tcp.local.";

/// How long one resolve attempt may take before it counts as failed.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Address information produced by a successful resolve.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub host: String,
    pub port: u16,
}

/// Why a resolve attempt did not produce an address. `Busy` is platform
/// contention and is retried without consuming an attempt.
#[derive(Debug, Clone)]
pub enum ResolveError {
    Busy,
    Timeout,
    Failed(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Busy => write!(f, "resolver busy"),
            ResolveError::Timeout => write!(f, "resolve timed out"),
            ResolveError::Failed(msg) => write!(f, "resolve failed: {}", msg),
        }
    }
}

/// Translates an advertised service name into a concrete address. The
/// discovery engine guarantees at most one call is in flight at a time.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ResolvedService, ResolveError>;
}

/// Extract the instance name from a DNS-SD fullname like
/// `Living Room._lanshelf._tcp.local.`.
pub fn instance_name(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// mDNS-backed resolver. Runs its own daemon so targeted resolutions
/// never contend with the long-lived browse.
pub struct MdnsResolver {
    daemon: ServiceDaemon,
}

impl MdnsResolver {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
        })
    }
}

#[async_trait]
impl Resolver for MdnsResolver {
    async fn resolve(&self, name: &str) -> Result<ResolvedService, ResolveError> {
        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(|_| ResolveError::Busy)?;
        let wanted = name.to_string();
        let result = timeout(RESOLVE_TIMEOUT, async move {
            while let Ok(event) = receiver.recv_async().await {
                if let ServiceEvent::ServiceResolved(info) = event {
                    if instance_name(info.get_fullname()) != wanted {
                        continue;
                    }
                    let Some(address) = info.get_addresses().iter().next().copied() else {
                        return Err(ResolveError::Failed("empty address set".to_string()));
                    };
                    return Ok(ResolvedService {
                        host: address.to_string(),
                        port: info.get_port(),
                    });
                }
            }
            Err(ResolveError::Failed("browse channel closed".to_string()))
        })
        .await;
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        match result {
            Ok(inner) => {
                if let Ok(svc) = &inner {
                    debug!("Resolved {} to {}:{}", name, svc.host, svc.port);
                }
                inner
            }
            Err(_) => Err(ResolveError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name("Living Room._lanshelf._tcp.local."),
            "Living Room"
        );
        assert_eq!(instance_name("plain-name"), "plain-name");
    }
}
