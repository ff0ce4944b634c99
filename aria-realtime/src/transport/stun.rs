//! Minimal STUN binding client (RFC 5389).
//!
//! Used to learn the public address of the media socket so the offer can
//! carry a server-reflexive candidate next to the host candidate. Only the
//! Binding request is implemented: no authentication, no TURN.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::config::IceServer;
use crate::error::{Result, VoiceError};

/// Port used when a `stun:` URL does not name one.
pub const DEFAULT_STUN_PORT: u16 = 3478;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Interval between request retransmissions.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Transaction identifier of one Binding request.
pub type TransactionId = [u8; 12];

/// A fresh random transaction id.
pub fn transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    id
}

/// Split a `stun:host[:port]` URL into host and port.
///
/// IPv6 literals must be bracketed. A `?transport=` suffix is ignored.
pub fn parse_stun_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("stun:")
        .ok_or_else(|| VoiceError::config(format!("Not a STUN URL: '{url}'")))?;
    let rest = rest.split('?').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| VoiceError::config(format!("Unterminated IPv6 literal in '{url}'")))?;
        (host, tail.strip_prefix(':'))
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(VoiceError::config(format!("Missing host in STUN URL '{url}'")));
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| VoiceError::config(format!("Invalid port in STUN URL '{url}'")))?,
        None => DEFAULT_STUN_PORT,
    };
    Ok((host.to_string(), port))
}

/// Encode a Binding request without attributes.
pub fn encode_binding_request(id: &TransactionId) -> [u8; HEADER_LEN] {
    let mut message = [0u8; HEADER_LEN];
    message[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    message[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    message[8..20].copy_from_slice(id);
    message
}

/// Decode a Binding response for transaction `id` into the mapped address.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn decode_binding_response(message: &[u8], id: &TransactionId) -> Result<SocketAddr> {
    if message.len() < HEADER_LEN {
        return Err(VoiceError::transport("STUN message shorter than its header"));
    }
    let kind = u16::from_be_bytes([message[0], message[1]]);
    let length = usize::from(u16::from_be_bytes([message[2], message[3]]));
    if message[4..8] != MAGIC_COOKIE.to_be_bytes() || message[8..20] != id[..] {
        return Err(VoiceError::transport("STUN response for another transaction"));
    }
    match kind {
        BINDING_SUCCESS => {}
        BINDING_ERROR => return Err(VoiceError::transport("STUN server rejected the binding request")),
        other => return Err(VoiceError::transport(format!("Unexpected STUN message type {other:#06x}"))),
    }

    let body = message
        .get(HEADER_LEN..HEADER_LEN + length)
        .ok_or_else(|| VoiceError::transport("Truncated STUN response"))?;

    let mut mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let len = usize::from(u16::from_be_bytes([body[offset + 2], body[offset + 3]]));
        let value = body
            .get(offset + 4..offset + 4 + len)
            .ok_or_else(|| VoiceError::transport("Truncated STUN attribute"))?;
        match attr {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(id)),
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            _ => {}
        }
        // Attribute values are padded to a multiple of four bytes.
        offset += 4 + len.div_ceil(4) * 4;
    }
    mapped.ok_or_else(|| VoiceError::transport("STUN response carries no mapped address"))
}

fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr> {
    if value.len() < 4 {
        return Err(VoiceError::transport("STUN address attribute too short"));
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match (value[1], &value[4..]) {
        (FAMILY_IPV4, raw) if raw.len() == 4 => {
            let mut octets = [raw[0], raw[1], raw[2], raw[3]];
            if xor.is_some() {
                for (octet, mask) in octets.iter_mut().zip(cookie) {
                    *octet ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_IPV6, raw) if raw.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            if let Some(id) = xor {
                let mask = cookie.iter().chain(id.iter());
                for (octet, mask) in octets.iter_mut().zip(mask) {
                    *octet ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (family, _) => {
            return Err(VoiceError::transport(format!("Unsupported STUN address family {family}")));
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// Resolve a `stun:` URL to an address of the same family as `local`.
pub async fn resolve_server(url: &str, local: SocketAddr) -> Result<SocketAddr> {
    let (host, port) = parse_stun_url(url)?;
    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| VoiceError::transport(format!("Failed to resolve STUN server '{host}': {e}")))?;
    addrs
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| VoiceError::transport(format!("STUN server '{host}' has no usable address")))
}

/// Send a Binding request from `socket` to `server` and wait for the mapped
/// address, retransmitting until `timeout` elapses.
pub async fn binding(socket: &UdpSocket, server: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
    let id = transaction_id();
    tokio::time::timeout(timeout, exchange(socket, server, &id))
        .await
        .map_err(|_| VoiceError::transport(format!("STUN binding to {server} timed out after {timeout:?}")))?
}

async fn exchange(socket: &UdpSocket, server: SocketAddr, id: &TransactionId) -> Result<SocketAddr> {
    let request = encode_binding_request(id);
    let mut retransmit = tokio::time::interval(RETRANSMIT_INTERVAL);
    let mut buf = [0u8; 1500];
    loop {
        tokio::select! {
            _ = retransmit.tick() => {
                socket
                    .send_to(&request, server)
                    .await
                    .map_err(|e| VoiceError::transport(format!("STUN send failed: {e}")))?;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received
                    .map_err(|e| VoiceError::transport(format!("STUN receive failed: {e}")))?;
                if from != server {
                    continue;
                }
                match decode_binding_response(&buf[..len], id) {
                    Ok(mapped) => return Ok(mapped),
                    Err(e) => tracing::debug!(error = %e, %from, "ignoring datagram"),
                }
            }
        }
    }
}

/// Ask each configured STUN server in turn for the public address of
/// `socket`. Returns the first mapping, or `None` when none answers.
pub async fn reflexive_address(
    socket: &UdpSocket,
    servers: &[IceServer],
    timeout: Duration,
) -> Option<SocketAddr> {
    let local = socket.local_addr().ok()?;
    for url in servers.iter().flat_map(|server| server.urls.iter()) {
        if !url.starts_with("stun:") {
            tracing::debug!(%url, "skipping non-STUN ICE server");
            continue;
        }
        let result = async {
            let server = resolve_server(url, local).await?;
            binding(socket, server, timeout).await
        }
        .await;
        match result {
            Ok(mapped) => {
                tracing::debug!(%url, %mapped, "STUN binding succeeded");
                return Some(mapped);
            }
            Err(e) => tracing::warn!(%url, error = %e, "STUN binding failed"),
        }
    }
    None
}
