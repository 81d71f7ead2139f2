use anyhow::Result;
use dotenv::dotenv;
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use lanshelf::discovery::{Advertiser, DiscoveryEngine};
use lanshelf::server::FileServer;
use lanshelf::storage::{SharedRoot, SharedStore};

/// Parse the LANSHELF_SHARES value: comma-separated `name=path` pairs.
/// A bare path is shared under its directory name.
fn parse_shares(raw: &str) -> Vec<SharedRoot> {
    let mut roots = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, path) = match item.split_once('=') {
            Some((name, path)) => (name.trim().to_string(), path.trim()),
            None => {
                let name = std::path::Path::new(item)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .unwrap_or_default();
                (name, item)
            }
        };
        if name.is_empty() || path.is_empty() {
            warn!("Ignoring malformed share entry '{}'", item);
            continue;
        }
        roots.push(SharedRoot {
            name,
            dir: PathBuf::from(path),
        });
    }
    roots
}

fn device_name() -> String {
    env::var("LANSHELF_NAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "lanshelf".to_string())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let name = device_name();
    let port: u16 = env::var("LANSHELF_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0); // 0 picks an ephemeral port

    let roots = match env::var("LANSHELF_SHARES") {
        Ok(raw) => parse_shares(&raw),
        Err(_) => {
            warn!("LANSHELF_SHARES is not set, serving no folders");
            Vec::new()
        }
    };
    for root in &roots {
        info!("Sharing '{}' from {}", root.name, root.dir.display());
    }

    let store = Arc::new(SharedStore::new(roots));
    let mut server = FileServer::start(store.clone(), port).await?;
    info!("Device '{}' serving on port {}", name, server.port());

    let engine = DiscoveryEngine::with_mdns()?;
    let mut advertiser = Advertiser::new()?;
    match local_ip_address::local_ip() {
        Ok(ip) => {
            let ip = ip.to_string();
            advertiser.advertise(&name, &ip, server.port())?;
            engine.set_local_device(true, &name, &ip, server.port());
        }
        Err(e) => warn!("No local IP address, not advertising: {}", e),
    }

    let mut watcher = engine.subscribe();
    tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let devices = watcher.current();
            let summary: Vec<String> = devices
                .iter()
                .map(|d| format!("{} ({}:{})", d.name, d.host, d.port))
                .collect();
            info!("Devices on the network: [{}]", summary.join(", "));
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    advertiser.stop();
    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_shares;

    #[test]
    fn shares_parse_and_skip_malformed_entries() {
        let roots = parse_shares("docs=/srv/docs, /srv/photos, =bad, empty=,");
        let names: Vec<&str> = roots.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "photos"]);
        assert_eq!(roots[0].dir, std::path::PathBuf::from("/srv/docs"));
        assert_eq!(roots[1].dir, std::path::PathBuf::from("/srv/photos"));
    }
}
