//! HTTP readiness probing.

use std::time::Duration;

/// Installs the ring crypto provider once per process. reqwest is built
/// without a default provider, so this must run before any client is built.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub fn client() -> reqwest::Client {
    install_crypto_provider();
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

/// `http://127.0.0.1:4010` + `/health`.
pub fn health_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// True on any 2xx answer.
pub async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            trace!("{url}: {}", resp.status());
            true
        }
        Ok(resp) => {
            trace!("{url}: {}", resp.status());
            false
        }
        Err(e) => {
            trace!("{url}: {e}");
            false
        }
    }
}
