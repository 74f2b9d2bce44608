//! # Public Endpoint Discovery
//!
//! One-shot binding-reflection probe: send a single STUN binding request
//! to a public server and read back the address the server saw, which is
//! the daemon's outside view of its UDP endpoint.
//!
//! The message handling is deliberately minimal. We build one binding
//! request, match the response by transaction id, and accept either
//! XOR-MAPPED-ADDRESS (preferred, immune to NAT payload rewriting) or
//! plain MAPPED-ADDRESS. Only IPv4 mappings are used.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::error::LaunchError;

/// STUN magic cookie, fixed by RFC 5389.
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Binding request message type.
const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type.
const BINDING_RESPONSE: u16 = 0x0101;

/// MAPPED-ADDRESS attribute.
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// XOR-MAPPED-ADDRESS attribute.
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN header length: type(2) + length(2) + cookie(4) + transaction(12).
const HEADER_LEN: usize = 20;

/// Discover the daemon's public IPv4 address via the given binding
/// reflection server (`host:port`).
///
/// One outbound UDP exchange on a transient socket; the socket is closed
/// on every path. Fails with [`LaunchError::Discovery`] on timeout, on a
/// network error, or when the reply carries no usable mapped address.
pub async fn discover_public_ip(
    reflector: &str,
    deadline: Duration,
) -> Result<String, LaunchError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| LaunchError::Discovery(format!("failed to bind probe socket: {}", e)))?;

    let (request, transaction_id) =
        build_binding_request().map_err(|e| LaunchError::Discovery(e.to_string()))?;

    socket
        .send_to(&request, reflector)
        .await
        .map_err(|e| LaunchError::Discovery(format!("failed to send probe: {}", e)))?;

    let mut buf = [0u8; 512];
    let n = match timeout(deadline, socket.recv_from(&mut buf)).await {
        Ok(Ok((n, _from))) => n,
        Ok(Err(e)) => {
            return Err(LaunchError::Discovery(format!(
                "failed to receive reflection: {}",
                e
            )))
        }
        Err(_) => return Err(LaunchError::Discovery("probe timed out".into())),
    };

    let ip = parse_binding_response(&buf[..n], &transaction_id)
        .ok_or_else(|| LaunchError::Discovery("reply carried no mapped address".into()))?;

    debug!(public_ip = %ip, reflector, "binding reflection complete");
    Ok(ip.to_string())
}

/// Build a binding request and return it with its transaction id.
fn build_binding_request() -> Result<(Vec<u8>, [u8; 12]), getrandom::Error> {
    let mut transaction_id = [0u8; 12];
    getrandom::getrandom(&mut transaction_id)?;

    let mut msg = Vec::with_capacity(HEADER_LEN);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(&transaction_id);
    Ok((msg, transaction_id))
}

/// Extract the mapped IPv4 address from a binding success response.
///
/// Returns `None` on anything that is not a well-formed success response
/// for our transaction, or when no IPv4 mapping is present.
fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Option<Ipv4Addr> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return None;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE || &data[8..20] != transaction_id {
        return None;
    }

    let attrs = data.get(HEADER_LEN..HEADER_LEN + msg_len)?;
    let mut fallback = None;
    let mut offset = 0;
    while offset + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[offset], attrs[offset + 1]]);
        let attr_len = u16::from_be_bytes([attrs[offset + 2], attrs[offset + 3]]) as usize;
        let value = attrs.get(offset + 4..offset + 4 + attr_len)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(IpAddr::V4(ip)) = parse_address_value(value, true) {
                    return Some(ip);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if let Some(IpAddr::V4(ip)) = parse_address_value(value, false) {
                    fallback = Some(ip);
                }
            }
            _ => {}
        }

        // Attributes are padded to a 4-byte boundary.
        offset += 4 + attr_len.div_ceil(4) * 4;
    }
    fallback
}

/// Decode a (XOR-)MAPPED-ADDRESS attribute value.
fn parse_address_value(value: &[u8], xored: bool) -> Option<IpAddr> {
    if value.len() < 8 {
        return None;
    }
    // value[0] is reserved, value[1] is the address family.
    if value[1] != 0x01 {
        return None;
    }
    let mut octets = [value[4], value[5], value[6], value[7]];
    if xored {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        for (octet, key) in octets.iter_mut().zip(cookie.iter()) {
            *octet ^= key;
        }
    }
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(transaction_id: &[u8; 12], attr_type: u16, value: &[u8]) -> Vec<u8> {
        let padded_len = value.len().div_ceil(4) * 4;
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + padded_len) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(transaction_id);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg.resize(msg.len() + padded_len - value.len(), 0);
        msg
    }

    #[test]
    fn request_has_correct_header() {
        let (msg, transaction_id) = build_binding_request().unwrap();
        assert_eq!(msg.len(), HEADER_LEN);
        assert_eq!(&msg[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&msg[2..4], &[0, 0]);
        assert_eq!(&msg[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&msg[8..20], &transaction_id);
    }

    #[test]
    fn xor_mapped_address_decodes() {
        let tid = [7u8; 12];
        let ip = Ipv4Addr::new(203, 0, 113, 10);
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut value = vec![0u8, 0x01];
        value.extend_from_slice(&(41000u16 ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        for (octet, key) in ip.octets().iter().zip(cookie.iter()) {
            value.push(octet ^ key);
        }

        let msg = response_with_attr(&tid, ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&msg, &tid), Some(ip));
    }

    #[test]
    fn plain_mapped_address_is_fallback() {
        let tid = [9u8; 12];
        let ip = Ipv4Addr::new(198, 51, 100, 5);
        let mut value = vec![0u8, 0x01];
        value.extend_from_slice(&41000u16.to_be_bytes());
        value.extend_from_slice(&ip.octets());

        let msg = response_with_attr(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&msg, &tid), Some(ip));
    }

    #[test]
    fn transaction_mismatch_rejected() {
        let tid = [1u8; 12];
        let other = [2u8; 12];
        let mut value = vec![0u8, 0x01];
        value.extend_from_slice(&41000u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 5]);

        let msg = response_with_attr(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&msg, &other), None);
    }

    #[test]
    fn ipv6_family_rejected() {
        let tid = [3u8; 12];
        let mut value = vec![0u8, 0x02];
        value.extend_from_slice(&41000u16.to_be_bytes());
        value.extend_from_slice(&[0u8; 16]);

        let msg = response_with_attr(&tid, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(parse_binding_response(&msg, &tid), None);
    }

    #[tokio::test]
    async fn local_reflector_round_trip() {
        // Stand up a one-shot reflector on loopback that answers with the
        // observed source address, XOR-encoded.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert!(n >= HEADER_LEN);
            let mut tid = [0u8; 12];
            tid.copy_from_slice(&buf[8..20]);

            let ip = match from.ip() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => unreachable!(),
            };
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let mut value = vec![0u8, 0x01];
            value.extend_from_slice(&(from.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
            for (octet, key) in ip.octets().iter().zip(cookie.iter()) {
                value.push(octet ^ key);
            }
            let msg = response_with_attr(&tid, ATTR_XOR_MAPPED_ADDRESS, &value);
            server.send_to(&msg, from).await.unwrap();
        });

        let ip = discover_public_ip(&server_addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn silent_reflector_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let err = discover_public_ip(&server_addr.to_string(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Discovery(_)));
    }
}
