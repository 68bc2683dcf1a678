use std::net::Ipv4Addr;

const UPLOAD_PORT: &str = "HEADEND_UPLOAD_PORT";

const DEFAULT_UPLOAD_PORT: u16 = 8765;

/// Port for the passive upload listener. `HEADEND_UPLOAD_PORT` overrides the
/// built-in default when the config file leaves it unset.
pub fn get_upload_port() -> u16 {
    let port_from_env = std::env::var(UPLOAD_PORT);
    port_from_env.map_or(DEFAULT_UPLOAD_PORT, |res| {
        res.parse().unwrap_or(DEFAULT_UPLOAD_PORT)
    })
}

const CONTROL_PORT: &str = "HEADEND_CONTROL_PORT";

const DEFAULT_CONTROL_PORT: u16 = 8000;

/// Port for the backend control listener, `HEADEND_CONTROL_PORT` overrides.
pub fn get_control_port() -> u16 {
    let port_from_env = std::env::var(CONTROL_PORT);
    port_from_env.map_or(DEFAULT_CONTROL_PORT, |res| {
        res.parse().unwrap_or(DEFAULT_CONTROL_PORT)
    })
}

const HEADEND_ADDR: &str = "HEADEND_ADDR";

const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

pub fn get_addr() -> Ipv4Addr {
    let addr_from_env = std::env::var(HEADEND_ADDR);
    addr_from_env.map_or(DEFAULT_ADDR, |res| res.parse().unwrap_or(DEFAULT_ADDR))
}
