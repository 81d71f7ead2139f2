use async_trait::async_trait;
use log::debug;
use std::time::Duration;

/// Timeout on the admission ping. Unresponsive hosts are treated as
/// dead, not retried.
const PING_TIMEOUT: Duration = Duration::from_millis(1500);

/// Liveness check run against a resolved address before the device is
/// admitted to the table.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> bool;
}

pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(PING_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{}:{}/api/v1/ping", host, port);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("Ping to {} returned {}", url, response.status());
                false
            }
            Err(e) => {
                debug!("Ping to {} failed: {}", url, e);
                false
            }
        }
    }
}
