//! Liaison réseau du moteur NTP: une unique socket UDP pour le service
//! configuré, plus une socket de diffusion dirigée par interface. Grounded
//! sur l'ouverture de socket de `server.rs` (teacher), étendue pour la
//! diffusion (mode 5) via `if-addrs`.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, warn};

const SOCKET_BUFFER_BYTES: libc::c_int = 1024 * 1024;

#[derive(Debug)]
pub struct BroadcastInterface {
    pub name_hash: u64,
    pub broadcast: Ipv4Addr,
    socket: UdpSocket,
}

/// Socket UDP d'écoute/émission NTP, plus une socket dédiée par interface
/// (liée sur `ifaddr:0`, `SO_BROADCAST` activé) pour émettre la diffusion
/// dirigée avec l'adresse source de cette interface, comme l'exige un
/// serveur multi-homed.
pub struct NetIo {
    socket: UdpSocket,
    broadcast_interfaces: Vec<BroadcastInterface>,
}

impl NetIo {
    /// Lie la socket de service sur toutes les interfaces (`0.0.0.0:<port>`)
    /// et agrandit les tampons de réception/émission, comme le ferait un
    /// serveur NTP de production sous forte charge de diffusion.
    pub fn bind(service: &str) -> Result<Self> {
        let bind_addr = format!("0.0.0.0:{}", resolve_port(service)?);
        let socket = UdpSocket::bind(&bind_addr)
            .with_context(|| format!("failed to bind NTP UDP socket on {bind_addr}"))?;
        socket
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .context("failed to set socket read timeout")?;
        socket.set_broadcast(true).context("failed to enable SO_BROADCAST")?;

        set_buffer_sizes(&socket);

        let broadcast_interfaces = discover_broadcast_interfaces();
        info!(
            "NTP socket bound on {} ({} broadcast-capable interface(s))",
            bind_addr,
            broadcast_interfaces.len()
        );

        Ok(NetIo {
            socket,
            broadcast_interfaces,
        })
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    /// Diffuse `buf` sur l'adresse de diffusion dirigée de chaque interface
    /// connue, au port `port`, en émettant depuis la socket propre à cette
    /// interface (pas la socket de service) afin que l'adresse source du
    /// datagramme soit bien celle de l'interface visée.
    pub fn broadcast(&self, buf: &[u8], port: u16) -> usize {
        let mut sent = 0;
        for iface in &self.broadcast_interfaces {
            let addr = SocketAddr::new(iface.broadcast.into(), port);
            match iface.socket.send_to(buf, addr) {
                Ok(_) => sent += 1,
                Err(e) => warn!("broadcast send to {} failed: {}", addr, e),
            }
        }
        sent
    }

    pub fn broadcast_interface_count(&self) -> usize {
        self.broadcast_interfaces.len()
    }
}

fn resolve_port(service: &str) -> Result<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }
    match service {
        "ntp" => Ok(123),
        other => anyhow::bail!("unknown NTP service name: {other}"),
    }
}

fn set_buffer_sizes(socket: &UdpSocket) {
    let fd = socket.as_raw_fd();
    unsafe {
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &SOCKET_BUFFER_BYTES as *const _ as *const libc::c_void,
            std::mem::size_of_val(&SOCKET_BUFFER_BYTES) as libc::socklen_t,
        );
        if rc != 0 {
            debug!("failed to grow SO_RCVBUF: {}", std::io::Error::last_os_error());
        }
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &SOCKET_BUFFER_BYTES as *const _ as *const libc::c_void,
            std::mem::size_of_val(&SOCKET_BUFFER_BYTES) as libc::socklen_t,
        );
        if rc != 0 {
            debug!("failed to grow SO_SNDBUF: {}", std::io::Error::last_os_error());
        }
    }
}

/// Calcule l'adresse de diffusion dirigée (`addr | !mask`) de chaque
/// interface IPv4 locale non-loopback et lie une socket dédiée sur
/// `ifaddr:0` pour émettre depuis cette interface précisément.
fn discover_broadcast_interfaces() -> Vec<BroadcastInterface> {
    let mut out = Vec::new();
    let addrs = match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("failed to enumerate network interfaces: {}", e);
            return out;
        }
    };

    for iface in addrs {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            let addr_bits = u32::from(v4.ip);
            let mask_bits = u32::from(v4.netmask);
            let broadcast = Ipv4Addr::from(addr_bits | !mask_bits);

            let bind_addr = SocketAddr::new(v4.ip.into(), 0);
            let socket = match UdpSocket::bind(bind_addr) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to bind broadcast socket on {}: {}", bind_addr, e);
                    continue;
                }
            };
            if let Err(e) = socket.set_broadcast(true) {
                warn!("failed to enable SO_BROADCAST on {}: {}", bind_addr, e);
                continue;
            }

            out.push(BroadcastInterface {
                name_hash: hash_iface_name(&iface.name),
                broadcast,
                socket,
            });
        }
    }
    out
}

fn hash_iface_name(name: &str) -> u64 {
    let mut h: u64 = 1469598103934665603;
    for b in name.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_port_numeric() {
        assert_eq!(resolve_port("123").unwrap(), 123);
    }

    #[test]
    fn test_resolve_port_name() {
        assert_eq!(resolve_port("ntp").unwrap(), 123);
    }

    #[test]
    fn test_resolve_port_unknown() {
        assert!(resolve_port("bogus").is_err());
    }

    #[test]
    fn test_directed_broadcast_computation() {
        let addr: u32 = u32::from(Ipv4Addr::new(192, 168, 1, 42));
        let mask: u32 = u32::from(Ipv4Addr::new(255, 255, 255, 0));
        let broadcast = Ipv4Addr::from(addr | !mask);
        assert_eq!(broadcast, Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_net_io_binds_ephemeral_like_port() {
        // Use an uncommon high port to avoid clashing with a real NTP daemon
        // in the test environment.
        let io = NetIo::bind("17123");
        assert!(io.is_ok());
    }
}
