//! Proxy Tunnels
//!
//! Client side of the two relay protocols a candidate proxy can speak:
//!
//! ```text
//! SOCKS5:  greeting → method choice → CONNECT(host, port) → reply
//! HTTP:    CONNECT host:port HTTP/1.1 → 200 Connection Established
//! ```
//!
//! The target is always sent as a hostname so the proxy resolves it on the
//! far side of the censored link.

use crate::client::TransportError;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
pub(crate) const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
pub(crate) const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
pub(crate) const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
pub(crate) const ADDR_IPV4: u8 = 0x01;
pub(crate) const ADDR_DOMAIN: u8 = 0x03;
pub(crate) const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
pub(crate) const REPLY_SUCCESS: u8 = 0x00;
pub(crate) const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Upper bound on a CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

fn proxy_error(label: &str, reason: impl Into<String>) -> TransportError {
    TransportError::Proxy {
        label: label.to_string(),
        reason: reason.into(),
    }
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn authority(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Run the SOCKS5 no-auth handshake and CONNECT to `host:port`.
pub(crate) async fn socks5_connect<S>(
    stream: &mut S,
    label: &str,
    host: &str,
    port: u16,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ===== Method negotiation =====
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;

    if choice[0] != SOCKS5_VERSION {
        return Err(proxy_error(
            label,
            format!("unexpected SOCKS version 0x{:02x}", choice[0]),
        ));
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(proxy_error(label, "no acceptable authentication method"));
    }

    // ===== Connection request =====
    let request = encode_connect_request(label, host, port)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(proxy_error(label, "malformed SOCKS reply"));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(proxy_error(label, reply_message(header[1])));
    }

    // Bound address is of no use to us, but it must be drained
    let bound_len = match header[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(proxy_error(
                label,
                format!("unknown bound address type 0x{:02x}", other),
            ));
        }
    };
    let mut rest = vec![0u8; bound_len + 2];
    stream.read_exact(&mut rest).await?;

    debug!("SOCKS5 tunnel via {} to {}", label, authority(host, port));
    Ok(())
}

fn encode_connect_request(label: &str, host: &str, port: u16) -> Result<Vec<u8>, TransportError> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let bytes = host.as_bytes();
            if bytes.len() > 255 {
                return Err(proxy_error(label, "hostname too long for SOCKS5"));
            }
            request.push(ADDR_DOMAIN);
            request.push(bytes.len() as u8);
            request.extend_from_slice(bytes);
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    };
    format!("SOCKS5 reply 0x{:02x} ({})", code, reason)
}

/// Open an HTTP CONNECT tunnel to `host:port`.
pub(crate) async fn http_connect<S>(
    stream: &mut S,
    label: &str,
    host: &str,
    port: u16,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(host, port);
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte by byte: anything past the blank line belongs to the tunnel
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(proxy_error(label, "oversized CONNECT response"));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| proxy_error(label, "invalid CONNECT response"))?;

    match status {
        200..=299 => {
            debug!("HTTP CONNECT tunnel via {} to {}", label, target);
            Ok(())
        }
        407 => Err(proxy_error(label, "proxy authentication required (407)")),
        other => Err(proxy_error(label, format!("CONNECT rejected with status {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_authority() {
        assert_eq!(authority("example.com", 443), "example.com:443");
        assert_eq!(authority("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(authority("::1", 8080), "[::1]:8080");
    }

    #[test]
    fn test_connect_request_uses_hostname() {
        let request = encode_connect_request("p", "example.com", 443).unwrap();
        assert_eq!(&request[..4], &[SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN]);
        assert_eq!(request[4] as usize, "example.com".len());
        assert_eq!(&request[5..16], b"example.com");
        assert_eq!(&request[16..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_connect_request_ipv4() {
        let request = encode_connect_request("p", "192.168.1.1", 80).unwrap();
        assert_eq!(request, vec![5, 1, 0, ADDR_IPV4, 192, 168, 1, 1, 0, 80]);
    }

    #[test]
    fn test_connect_request_rejects_long_host() {
        let host = "a".repeat(256);
        assert!(matches!(
            encode_connect_request("p", &host, 80),
            Err(TransportError::Proxy { .. })
        ));
    }

    #[tokio::test]
    async fn test_socks5_handshake() {
        let (mut client, mut server) = duplex(1024);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS5_VERSION, 1, AUTH_NO_AUTH]);
            server.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.com");

            server
                .write_all(&[SOCKS5_VERSION, REPLY_SUCCESS, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        socks5_connect(&mut client, "test", "example.com", 443).await.unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_failure_reply() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[SOCKS5_VERSION, 0x04, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut client, "test", "10.0.0.1", 80).await.unwrap_err();
        match err {
            TransportError::Proxy { reason, .. } => assert!(reason.contains("host unreachable")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_http_connect() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\ntunnel")
                .await
                .unwrap();
        });

        http_connect(&mut client, "test", "example.com", 443).await.unwrap();

        // Tunnel bytes are left for the caller
        let mut rest = [0u8; 6];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"tunnel");
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = http_connect(&mut client, "test", "example.com", 443).await.unwrap_err();
        assert!(matches!(err, TransportError::Proxy { .. }));
    }
}
