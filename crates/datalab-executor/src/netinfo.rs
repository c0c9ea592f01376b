//! Display-address resolution for started servers.

use std::net::IpAddr;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use datalab_common::Platform;

const PUBLIC_IP_ECHO_URL: &str = "https://ipinfo.io/ip";
const PUBLIC_IP_ATTEMPTS: u32 = 3;
const PUBLIC_IP_BACKOFF: Duration = Duration::from_secs(2);

/// Placeholder reported when the public address cannot be resolved; the user
/// substitutes their VM's address by hand.
pub const PUBLIC_IP_PLACEHOLDER: &str = "{{vm_public_ip}}";

/// Fetch this host's public IP from the echo service, retrying transient
/// failures with backoff. `None` when all attempts fail or the response is
/// not an IP address.
pub async fn public_ip(http: &reqwest::Client) -> Option<String> {
    for attempt in 1..=PUBLIC_IP_ATTEMPTS {
        match http.get(PUBLIC_IP_ECHO_URL).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => {
                    let candidate = body.trim();
                    if candidate.parse::<IpAddr>().is_ok() {
                        return Some(candidate.to_string());
                    }
                    debug!(attempt, body = candidate, "Echo service returned a non-address");
                }
                Err(e) => debug!(attempt, error = %e, "Cannot read echo service response"),
            },
            Err(e) => debug!(attempt, error = %e, "Public IP request failed"),
        }
        sleep(PUBLIC_IP_BACKOFF).await;
    }
    None
}

/// The address a started server should be reported under. Desktop servers
/// are always local; anything else is assumed reachable via the host's
/// public address.
pub async fn display_ip(platform: Platform, http: &reqwest::Client) -> String {
    match platform {
        Platform::Desktop => "127.0.0.1".to_string(),
        Platform::RemoteVm => public_ip(http)
            .await
            .unwrap_or_else(|| PUBLIC_IP_PLACEHOLDER.to_string()),
    }
}
