//! Accepts worker TCP connections and spawns a [`crate::session`] for each
//! (§4.1, §6 proxy-trust list).

use std::net::IpAddr;
use std::sync::Arc;

use common::BridgeConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::events::Publisher;
use crate::registry::Registry;
use crate::store::ProjectionStore;

/// Bind and serve the judge-worker listener until the process is signaled
/// to stop. Each accepted connection gets its own session task.
pub async fn serve(
    bind_address: &str,
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    publisher: Arc<Publisher>,
    config: Arc<BridgeConfig>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(%bind_address, "judge listener bound");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "failed to accept worker connection");
                continue;
            }
        };

        let trusted = is_trusted_proxy(peer_addr.ip(), &config.trusted_proxies);
        if trusted {
            // The real client address would be lifted from a PROXY-protocol
            // header before authentication logging; no trusted proxies are
            // configured in the default deployment so this stays a no-op hook.
            info!(%peer_addr, "connection accepted through a trusted proxy");
        }

        crate::session::spawn(
            stream,
            peer_addr,
            registry.clone(),
            store.clone(),
            publisher.clone(),
            config.clone(),
        );
    }
}

fn is_trusted_proxy(addr: IpAddr, trusted: &[String]) -> bool {
    trusted.iter().any(|entry| match parse_cidr(entry) {
        Some((network, prefix_len)) => cidr_contains(network, prefix_len, addr),
        None => {
            warn!(entry, "ignoring unparseable trusted-proxy CIDR");
            false
        }
    })
}

/// Parse `"a.b.c.d/nn"` (bare IPs are treated as a full-length prefix).
fn parse_cidr(entry: &str) -> Option<(IpAddr, u8)> {
    match entry.split_once('/') {
        Some((addr, len)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let max_len = if addr.is_ipv4() { 32 } else { 128 };
            let len: u8 = len.parse().ok()?;
            (len <= max_len).then_some((addr, len))
        }
        None => {
            let addr: IpAddr = entry.parse().ok()?;
            let len = if addr.is_ipv4() { 32 } else { 128 };
            Some((addr, len))
        }
    }
}

fn cidr_contains(network: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(network), IpAddr::V4(addr)) => {
            let mask = v4_mask(prefix_len);
            u32::from(network) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(network), IpAddr::V6(addr)) => {
            let mask = v6_mask(prefix_len);
            u128::from(network) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ipv4_cidr() {
        let trusted = vec!["10.0.0.0/8".to_string()];
        assert!(is_trusted_proxy("10.2.3.4".parse().unwrap(), &trusted));
        assert!(!is_trusted_proxy("11.0.0.1".parse().unwrap(), &trusted));
    }

    #[test]
    fn matches_bare_ip_as_host_route() {
        let trusted = vec!["192.168.1.5".to_string()];
        assert!(is_trusted_proxy("192.168.1.5".parse().unwrap(), &trusted));
        assert!(!is_trusted_proxy("192.168.1.6".parse().unwrap(), &trusted));
    }

    #[test]
    fn matches_ipv6_cidr() {
        let trusted = vec!["2001:db8::/32".to_string()];
        assert!(is_trusted_proxy("2001:db8::1".parse().unwrap(), &trusted));
        assert!(!is_trusted_proxy("2001:db9::1".parse().unwrap(), &trusted));
    }

    #[test]
    fn unparseable_entry_matches_nothing() {
        let trusted = vec!["not-a-cidr".to_string()];
        assert!(!is_trusted_proxy("10.0.0.1".parse().unwrap(), &trusted));
    }
}
