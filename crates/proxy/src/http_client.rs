use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

/// Hard ceiling on any upstream call, local or cloud. Local servers can
/// spend minutes on prompt processing before the first byte.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single agent drives this proxy, so only a handful of upstream
/// connections ever exist. Agent turns arrive seconds to minutes apart;
/// keeping an idle connection warm across that gap saves a TLS handshake
/// per turn against the cloud providers.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 2;

/// SSE streams sit idle while the model thinks; TCP keepalives stop NAT
/// boxes and middleware from dropping the connection in the meantime.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        // Small SSE frames must not wait on Nagle batching.
        .tcp_nodelay(true)
        .tcp_keepalive(Some(TCP_KEEPALIVE))
}

/// Shared client for all upstream traffic.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .expect("Failed to build default HTTP client")
        })
        .clone()
}
