//! Companion side of remote execution.
//!
//! The same binary runs as `agent` on a docker host: it reads one request
//! on stdin, carries it out and writes one response on stdout.  Everything
//! else it has to say goes to stderr through the logger.

use std::collections::HashMap;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::error::Result;
use crate::remote::protocol::{
    self, family_of, ProbeRequest, ProbeResponse, PublicAddresses, Request, Response,
    MAX_PROBE_SIZE,
};

const NONCE_LEN: usize = 6;

/// Would this IPv4 address be routed on the public internet?
pub fn is_global_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // shared address space
        || (a == 100 && (b & 0xc0) == 64)
        // IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // reserved
        || a >= 240)
}

/// Would this IPv6 address be routed on the public internet?
pub fn is_global_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    // global unicast
    (segments[0] & 0xe000) == 0x2000
        // documentation
        && !(segments[0] == 0x2001 && segments[1] == 0x0db8)
        // IETF protocol assignments
        && !(segments[0] == 0x2001 && segments[1] < 0x0200)
}

/// Every address of every interface, with the interface name.
fn interface_addresses() -> std::io::Result<Vec<(String, IpAddr)>> {
    let mut found = Vec::new();
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() {
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
                let family = i32::from((*ifa.ifa_addr).sa_family);
                if family == libc::AF_INET {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                    found.push((name, IpAddr::V4(ip)));
                } else if family == libc::AF_INET6 {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                    found.push((name, IpAddr::V6(ip)));
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }
    Ok(found)
}

/// Global addresses of physical interfaces.  Physical means the name
/// starts with `e` (eno, enp, eth); bridges, loopback, wireless and
/// virtual interfaces are skipped.
pub fn public_addresses() -> Result<PublicAddresses> {
    let mut found = PublicAddresses::default();
    for (name, addr) in interface_addresses()? {
        if !name.starts_with('e') {
            continue;
        }
        match addr {
            IpAddr::V4(ip) if is_global_v4(ip) && !found.v4.contains(&ip) => found.v4.push(ip),
            IpAddr::V6(ip) if is_global_v6(ip) && !found.v6.contains(&ip) => found.v6.push(ip),
            _ => {}
        }
    }
    debug!("Public addresses: {:?}", found);
    Ok(found)
}

/// Listen on `[::]:port` (or `0.0.0.0:port` without IPv6) for one probe.
pub async fn probe_server(port: u16, timeout: Duration) -> Result<bool> {
    let socket = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("No IPv6 probe listener ({}), using IPv4 only", e);
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?
        }
    };
    info!("Listening for probes on {}", socket.local_addr()?);
    serve_probe(&socket, timeout).await
}

/// Answer the first well-formed probe arriving on `socket`.  Returns
/// whether one arrived in time.
pub async fn serve_probe(socket: &UdpSocket, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; MAX_PROBE_SIZE];
    loop {
        let (len, peer) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!("Receiving probe failed: {}", e);
                continue;
            }
            Err(_) => {
                warn!("Public IP probe server timeout after {:?}", timeout);
                return Ok(false);
            }
        };
        let request: ProbeRequest = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed probe from {}: {}", peer, e);
                continue;
            }
        };
        debug!("Received valid probe packet from {}, sending response", peer);
        let response = ProbeResponse {
            success: true,
            nonce: request.nonce,
            addr: request.addr,
            port: request.port,
            family: request.family,
        };
        socket.send_to(&serde_json::to_vec(&response)?, peer).await?;
        return Ok(true);
    }
}

fn nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LEN)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

/// Check an echo against the probes sent, keyed by nonce.  Returns the
/// confirmed address or why the echo is not acceptable.
pub fn validate_response(
    data: &[u8],
    sent: &HashMap<String, ProbeRequest>,
    port: u16,
) -> std::result::Result<IpAddr, String> {
    let response: ProbeResponse = serde_json::from_slice(data).map_err(|e| e.to_string())?;
    if !response.success {
        return Err("not successful".to_string());
    }
    if response.family != 4 && response.family != 6 {
        return Err(format!("unknown family {}", response.family));
    }
    let probe = sent
        .get(&response.nonce)
        .ok_or_else(|| format!("unknown nonce {}", response.nonce))?;
    if probe.family != response.family {
        return Err(format!(
            "wrong family, expected {} got {}",
            probe.family, response.family
        ));
    }
    if probe.addr != response.addr {
        return Err(format!(
            "wrong address, expected {} got {}",
            probe.addr, response.addr
        ));
    }
    if response.port != port {
        return Err(format!("wrong port, expected {} got {}", port, response.port));
    }
    response
        .addr
        .parse()
        .map_err(|e| format!("invalid address {}: {}", response.addr, e))
}

async fn recv_datagram(socket: Option<&UdpSocket>) -> std::io::Result<Vec<u8>> {
    match socket {
        Some(socket) => {
            let mut buf = [0u8; MAX_PROBE_SIZE];
            let (len, _) = socket.recv_from(&mut buf).await?;
            Ok(buf[..len].to_vec())
        }
        None => std::future::pending().await,
    }
}

/// Socket for probing one address family.  A family whose socket cannot
/// be bound is skipped so the other one can still be probed.
async fn probe_socket(local: IpAddr, wanted: bool) -> Option<UdpSocket> {
    if !wanted {
        return None;
    }
    match UdpSocket::bind((local, 0)).await {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("Cannot probe IPv{} addresses: {}", family_of(&local), e);
            None
        }
    }
}

/// Send one probe to every candidate and return the first address whose
/// echo checks out.
pub async fn probe_client(
    addresses: &PublicAddresses,
    port: u16,
    timeout: Duration,
) -> Result<Option<IpAddr>> {
    let deadline = Instant::now() + timeout;
    let v4 = probe_socket(Ipv4Addr::UNSPECIFIED.into(), !addresses.v4.is_empty()).await;
    let v6 = probe_socket(Ipv6Addr::UNSPECIFIED.into(), !addresses.v6.is_empty()).await;

    let mut sent = HashMap::new();
    for addr in addresses.all() {
        let socket = match addr {
            IpAddr::V4(_) => v4.as_ref(),
            IpAddr::V6(_) => v6.as_ref(),
        };
        let Some(socket) = socket else {
            continue;
        };
        let probe = ProbeRequest {
            nonce: nonce(),
            addr: addr.to_string(),
            port,
            family: family_of(&addr),
        };
        match socket
            .send_to(&serde_json::to_vec(&probe)?, (addr, port))
            .await
        {
            Ok(_) => {
                debug!("Sent probe to {}", probe.addr);
                sent.insert(probe.nonce.clone(), probe);
            }
            Err(e) => warn!("Could not send probe to {}: {}", addr, e),
        }
    }
    if sent.is_empty() {
        warn!("No probe could be sent");
        return Ok(None);
    }

    loop {
        let received = tokio::select! {
            data = recv_datagram(v4.as_ref()) => data,
            data = recv_datagram(v6.as_ref()) => data,
            _ = sleep_until(deadline) => {
                warn!("Public IP probe client timeout after {:?}", timeout);
                let tried: Vec<String> = addresses
                    .all()
                    .map(|addr| std::net::SocketAddr::new(addr, port).to_string())
                    .collect();
                warn!("Tried to reach these addresses: {}", tried.join(", "));
                return Ok(None);
            }
        };
        match received {
            Ok(data) => match validate_response(&data, &sent, port) {
                Ok(addr) => return Ok(Some(addr)),
                Err(reason) => warn!("Ignoring probe response: {}", reason),
            },
            Err(e) => warn!("Receiving probe response failed: {}", e),
        }
    }
}

/// Carry out one request.  Failures become error responses.
pub async fn handle(request: Request) -> Response {
    let result = match request {
        Request::ListPublicAddresses => public_addresses().map(Response::PublicAddresses),
        Request::ProbeServer { port, timeout_ms } => {
            probe_server(port, Duration::from_millis(timeout_ms))
                .await
                .map(|received| Response::ProbeServer { received })
        }
        Request::ProbeClient {
            addresses,
            port,
            timeout_ms,
        } => probe_client(&addresses, port, Duration::from_millis(timeout_ms))
            .await
            .map(|address| Response::ProbeClient { address }),
    };
    result.unwrap_or_else(|e| Response::Error {
        message: e.to_string(),
    })
}

/// Decode a request, handle it and encode the response.
pub async fn handle_bytes(input: &[u8]) -> Result<Vec<u8>> {
    let response = match protocol::decode::<Request>(input) {
        Ok(request) => {
            info!("Handling {}", request.name());
            handle(request).await
        }
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    };
    protocol::encode(&response)
}

/// `agent` subcommand: one request on stdin, one response on stdout.
pub async fn run_stdio() -> anyhow::Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let output = handle_bytes(&input).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> PublicAddresses {
        PublicAddresses {
            v4: vec![Ipv4Addr::LOCALHOST],
            v6: vec![],
        }
    }

    #[test]
    fn global_address_heuristics() {
        assert!(is_global_v4(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_global_v4(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!is_global_v4(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_global_v4(Ipv4Addr::new(193, 167, 0, 100)));
        assert!(!is_global_v4(Ipv4Addr::new(203, 0, 113, 1)));
        assert!(!is_global_v4(Ipv4Addr::LOCALHOST));
        assert!(is_global_v6("2606:4700::1111".parse().unwrap()));
        assert!(!is_global_v6("fd00:cafe:cafe::100".parse().unwrap()));
        assert!(!is_global_v6("fe80::1".parse().unwrap()));
        assert!(!is_global_v6("2001:db8::1".parse().unwrap()));
        assert!(!is_global_v6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn nonces_are_lowercase_letters() {
        let n = nonce();
        assert_eq!(n.len(), NONCE_LEN);
        assert!(n.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn responses_must_match_a_sent_probe() {
        let probe = ProbeRequest {
            nonce: "abcdef".into(),
            addr: "198.51.100.7".into(),
            port: 443,
            family: 4,
        };
        let sent = HashMap::from([(probe.nonce.clone(), probe)]);
        let good = ProbeResponse {
            success: true,
            nonce: "abcdef".into(),
            addr: "198.51.100.7".into(),
            port: 443,
            family: 4,
        };
        let encode = |r: &ProbeResponse| serde_json::to_vec(r).unwrap();
        assert_eq!(
            validate_response(&encode(&good), &sent, 443),
            Ok("198.51.100.7".parse().unwrap())
        );

        let bad = [
            ProbeResponse {
                success: false,
                ..good.clone()
            },
            ProbeResponse {
                nonce: "zzzzzz".into(),
                ..good.clone()
            },
            ProbeResponse {
                family: 6,
                ..good.clone()
            },
            ProbeResponse {
                family: 5,
                ..good.clone()
            },
            ProbeResponse {
                addr: "198.51.100.8".into(),
                ..good.clone()
            },
            ProbeResponse {
                port: 8443,
                ..good.clone()
            },
        ];
        for response in &bad {
            assert!(validate_response(&encode(response), &sent, 443).is_err());
        }
        assert!(validate_response(b"{\"success\": tru", &sent, 443).is_err());
        assert!(validate_response(&[0xff, 0xfe], &sent, 443).is_err());
    }

    #[tokio::test]
    async fn probe_over_loopback() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let server = tokio::spawn(async move { serve_probe(&socket, Duration::from_secs(5)).await });

        let found = probe_client(&loopback(), port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn server_ignores_garbage_until_a_valid_probe() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server = tokio::spawn(async move { serve_probe(&socket, Duration::from_secs(5)).await });

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.send_to(b"{not json", addr).await.unwrap();
        client.send_to(br#"{"nonce":"abcdef"}"#, addr).await.unwrap();
        let probe = ProbeRequest {
            nonce: "qwerty".into(),
            addr: "127.0.0.1".into(),
            port: addr.port(),
            family: 4,
        };
        client
            .send_to(&serde_json::to_vec(&probe).unwrap(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_PROBE_SIZE];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let response: ProbeResponse = serde_json::from_slice(&buf[..len]).unwrap();
        assert!(response.success);
        assert_eq!(response.nonce, "qwerty");
        assert!(server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn client_ignores_forged_echoes() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; MAX_PROBE_SIZE];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let probe: ProbeRequest = serde_json::from_slice(&buf[..len]).unwrap();
            let good = ProbeResponse {
                success: true,
                nonce: probe.nonce.clone(),
                addr: probe.addr.clone(),
                port: probe.port,
                family: probe.family,
            };
            let forged = [
                b"garbage".to_vec(),
                serde_json::to_vec(&ProbeResponse {
                    nonce: "xxxxxx".into(),
                    ..good.clone()
                })
                .unwrap(),
                serde_json::to_vec(&ProbeResponse {
                    family: 6,
                    ..good.clone()
                })
                .unwrap(),
                serde_json::to_vec(&ProbeResponse {
                    addr: "127.0.0.2".into(),
                    ..good.clone()
                })
                .unwrap(),
            ];
            for packet in forged {
                socket.send_to(&packet, peer).await.unwrap();
            }
            socket
                .send_to(&serde_json::to_vec(&good).unwrap(), peer)
                .await
                .unwrap();
        });

        let found = probe_client(&loopback(), port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn silence_on_both_sides() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let received = serve_probe(&socket, Duration::from_millis(200)).await.unwrap();
        assert!(!received);

        // Nothing listens on the probed port.
        let closed = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        let found = probe_client(&loopback(), port, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn unbindable_family_is_skipped() {
        assert!(probe_socket(Ipv4Addr::LOCALHOST.into(), true).await.is_some());
        assert!(probe_socket(Ipv4Addr::LOCALHOST.into(), false).await.is_none());
        // TEST-NET-1 is not assigned to any local interface.
        let foreign = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert!(probe_socket(foreign, true).await.is_none());
    }

    #[tokio::test]
    async fn bad_requests_become_error_responses() {
        let output = handle_bytes(b"\x00\x01").await.unwrap();
        let response: Response = protocol::decode(&output).unwrap();
        assert!(matches!(response, Response::Error { .. }));
    }
}
