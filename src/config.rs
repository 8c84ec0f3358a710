use std::env;

/// Rendezvous port is fixed; `CHUTE_SERVER_IP` only selects the host.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Resolves the rendezvous address from `CHUTE_SERVER_IP`, falling back to
/// localhost.
pub fn resolve_server_addr() -> String {
    match env::var("CHUTE_SERVER_IP") {
        Ok(ip) if !ip.trim().is_empty() => format!("{}:{}", ip.trim(), DEFAULT_SERVER_PORT),
        _ => format!("localhost:{DEFAULT_SERVER_PORT}"),
    }
}

/// Resolves the STUN server from `CHUTE_STUN_SERVER`, falling back to the
/// default public server.
pub fn stun_server_addr() -> String {
    match env::var("CHUTE_STUN_SERVER") {
        Ok(addr) if !addr.is_empty() => addr,
        _ => DEFAULT_STUN_SERVER.to_owned(),
    }
}
