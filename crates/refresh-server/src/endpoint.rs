//! Bind endpoint resolution.
//!
//! The server binds loopback on an OS-assigned port by default. A hosting
//! environment (container, remote dev box) can override the endpoint through
//! [`AUTO_RELOAD_ENV`]; the override is advisory, so anything that fails to
//! parse falls back to the default silently.

use url::Url;

/// Environment variable holding an optional bind endpoint override,
/// e.g. `ws://0.0.0.0:9000`.
pub const AUTO_RELOAD_ENV: &str = "WATCH_AUTO_RELOAD_WS_HOSTNAME";

/// Default bind host. Loopback only: the refresh channel is local by design.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Resolves the bind endpoint from an optional override string.
///
/// The override is interpreted as an absolute URL after normalizing a
/// leading `ws://` to `http://`. When it omits the port, the scheme's
/// default port is used. Invalid or host-less values are ignored and the
/// default of `("127.0.0.1", 0)` (port 0 = OS-assigned) is returned.
pub fn resolve_bind_addr(override_url: Option<&str>) -> (String, u16) {
    if let Some(raw) = override_url {
        let normalized = match raw.strip_prefix("ws://") {
            Some(rest) => format!("http://{rest}"),
            None => raw.to_owned(),
        };

        if let Ok(url) = Url::parse(&normalized) {
            if let Some(host) = url.host_str() {
                let port = url.port_or_known_default().unwrap_or(0);
                return (host.to_owned(), port);
            }
        }
    }

    (DEFAULT_HOST.to_owned(), 0)
}
