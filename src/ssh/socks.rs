//! SOCKS5 proxy chain dialer
//!
//! Produces a connected byte stream to a target through zero or more
//! SOCKS5 hops. Hop *i* is dialed through hop *i−1* by issuing a CONNECT
//! for the next hop's address on the already-established stream, so the
//! whole chain rides one TCP connection to the first hop.
//!
//! Authentication per hop is optional username/password (RFC 1929).
//! Failure of any hop aborts the whole dial with an error naming the hop
//! index.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::error::{DialCause, SshError};
use crate::store::{SocksChain, SocksHop};

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_USERPASS: u8 = 0x02;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const AUTH_SUBNEG_VERSION: u8 = 0x01;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
}

/// Map a SOCKS5 reply code to a human-readable reason
fn reply_reason(rep: u8) -> &'static str {
    match rep {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Dial `target` through the given proxy chain.
///
/// With an empty chain this is a plain TCP connect. The returned stream is
/// ready for an SSH handshake.
pub async fn dial_through_chain(
    chain: &SocksChain,
    target_host: &str,
    target_port: u16,
    timeout: Duration,
) -> Result<TcpStream, SshError> {
    if chain.is_empty() {
        return dial_direct(target_host, target_port, timeout).await;
    }

    let first = &chain.hops[0];
    info!(
        "Dialing {}:{} through {} SOCKS5 hop(s), entry {}:{}",
        target_host,
        target_port,
        chain.hops.len(),
        first.host,
        first.port
    );

    let mut stream = dial_direct(&first.host, first.port, timeout)
        .await
        .map_err(|e| hop_error(0, e))?;

    // Each handshake connects the stream one hop further along the chain;
    // the final CONNECT lands on the target itself.
    for (i, hop) in chain.hops.iter().enumerate() {
        let (next_host, next_port) = match chain.hops.get(i + 1) {
            Some(next) => (next.host.as_str(), next.port),
            None => (target_host, target_port),
        };

        tokio::time::timeout(timeout, handshake(&mut stream, hop, next_host, next_port))
            .await
            .map_err(|_| SshError::DialFailed {
                cause: DialCause::ProxyHop(i),
                detail: format!("SOCKS5 handshake with {}:{} timed out", hop.host, hop.port),
            })?
            .map_err(|e| hop_error(i, e))?;

        debug!(
            "SOCKS5 hop {} established, tunneled to {}:{}",
            i + 1,
            next_host,
            next_port
        );
    }

    Ok(stream)
}

/// Plain TCP connect with resolution and timeout classification.
///
/// SO_KEEPALIVE is enabled on the socket; SSH-level keepalive on top is
/// configured by the transport layer.
pub async fn dial_direct(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, SshError> {
    let addr = resolve(host, port)?;

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .map_err(|e| SshError::from_dial_io(&e))?;

    if let Err(e) = socket.set_keepalive(true) {
        debug!("Failed to set SO_KEEPALIVE: {}", e);
    }

    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| SshError::DialFailed {
            cause: DialCause::Timeout,
            detail: format!("Connection to {}:{} timed out", host, port),
        })?
        .map_err(|e| SshError::from_dial_io(&e))?;

    // Disable Nagle's algorithm for low-latency interactive traffic
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    Ok(stream)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SshError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SshError::DialFailed {
            cause: DialCause::ResolveFailed,
            detail: format!("Failed to resolve {}: {}", host, e),
        })?
        .next()
        .ok_or_else(|| SshError::DialFailed {
            cause: DialCause::ResolveFailed,
            detail: format!("No address found for {}", host),
        })
}

fn hop_error(index: usize, inner: SshError) -> SshError {
    SshError::DialFailed {
        cause: DialCause::ProxyHop(index),
        detail: inner.to_string(),
    }
}

/// Run the SOCKS5 greeting, optional auth and CONNECT on `stream`
async fn handshake(
    stream: &mut TcpStream,
    hop: &SocksHop,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), SshError> {
    let want_auth = hop.username.is_some();

    // Greeting: offer no-auth, plus user/pass when credentials exist
    let greeting: &[u8] = if want_auth {
        &[
            socks5::VERSION,
            2,
            socks5::AUTH_NONE,
            socks5::AUTH_USERPASS,
        ]
    } else {
        &[socks5::VERSION, 1, socks5::AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != socks5::VERSION {
        return Err(SshError::Protocol(format!(
            "SOCKS5 proxy {} answered with version {:#x}",
            hop.host, choice[0]
        )));
    }

    match choice[1] {
        socks5::AUTH_NONE => {}
        socks5::AUTH_USERPASS => {
            let username = hop.username.as_deref().unwrap_or_default();
            let password = hop.password.as_deref().unwrap_or_default();
            subnegotiate_userpass(stream, username, password, &hop.host).await?;
        }
        socks5::AUTH_NO_ACCEPTABLE => {
            return Err(SshError::Protocol(format!(
                "SOCKS5 proxy {} accepts none of our auth methods",
                hop.host
            )));
        }
        other => {
            return Err(SshError::Protocol(format!(
                "SOCKS5 proxy {} chose unsupported auth method {:#x}",
                hop.host, other
            )));
        }
    }

    // CONNECT request
    let mut req = Vec::with_capacity(dest_host.len() + 7);
    req.extend_from_slice(&[socks5::VERSION, socks5::CMD_CONNECT, 0x00]);
    match dest_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(socks5::ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(socks5::ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if dest_host.len() > 255 {
                return Err(SshError::InvalidInput(format!(
                    "Hostname too long for SOCKS5: {}",
                    dest_host
                )));
            }
            req.push(socks5::ATYP_DOMAIN);
            req.push(dest_host.len() as u8);
            req.extend_from_slice(dest_host.as_bytes());
        }
    }
    req.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&req).await?;

    // Reply header: VER REP RSV ATYP
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != socks5::REP_SUCCESS {
        return Err(SshError::Protocol(format!(
            "SOCKS5 CONNECT to {}:{} failed: {}",
            dest_host,
            dest_port,
            reply_reason(head[1])
        )));
    }

    // Consume the bound address so the stream is positioned at tunnel data
    let addr_len = match head[3] {
        socks5::ATYP_IPV4 => 4usize,
        socks5::ATYP_IPV6 => 16,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(SshError::Protocol(format!(
                "SOCKS5 reply with unknown address type {:#x}",
                other
            )));
        }
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip).await?;

    Ok(())
}

/// RFC 1929 username/password sub-negotiation
async fn subnegotiate_userpass(
    stream: &mut TcpStream,
    username: &str,
    password: &str,
    proxy_host: &str,
) -> Result<(), SshError> {
    if username.len() > 255 || password.len() > 255 {
        return Err(SshError::InvalidInput(
            "SOCKS5 credentials exceed 255 bytes".into(),
        ));
    }

    let mut req = Vec::with_capacity(3 + username.len() + password.len());
    req.push(socks5::AUTH_SUBNEG_VERSION);
    req.push(username.len() as u8);
    req.extend_from_slice(username.as_bytes());
    req.push(password.len() as u8);
    req.extend_from_slice(password.as_bytes());
    stream.write_all(&req).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp[1] != 0x00 {
        return Err(SshError::Protocol(format!(
            "SOCKS5 proxy {} rejected the supplied credentials",
            proxy_host
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal in-process SOCKS5 server good for one CONNECT
    async fn fake_proxy(expect_userpass: bool) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();

            let mut greet = [0u8; 2];
            s.read_exact(&mut greet).await.unwrap();
            let mut methods = vec![0u8; greet[1] as usize];
            s.read_exact(&mut methods).await.unwrap();

            if expect_userpass {
                s.write_all(&[0x05, 0x02]).await.unwrap();
                let mut ver_ulen = [0u8; 2];
                s.read_exact(&mut ver_ulen).await.unwrap();
                let mut user = vec![0u8; ver_ulen[1] as usize];
                s.read_exact(&mut user).await.unwrap();
                let mut plen = [0u8; 1];
                s.read_exact(&mut plen).await.unwrap();
                let mut pass = vec![0u8; plen[0] as usize];
                s.read_exact(&mut pass).await.unwrap();
                s.write_all(&[0x01, 0x00]).await.unwrap();
            } else {
                s.write_all(&[0x05, 0x00]).await.unwrap();
            }

            // CONNECT request: capture the destination bytes
            let mut head = [0u8; 4];
            s.read_exact(&mut head).await.unwrap();
            let mut dest = Vec::new();
            match head[3] {
                0x01 => {
                    let mut b = [0u8; 6];
                    s.read_exact(&mut b).await.unwrap();
                    dest.extend_from_slice(&b);
                }
                0x03 => {
                    let mut len = [0u8; 1];
                    s.read_exact(&mut len).await.unwrap();
                    let mut b = vec![0u8; len[0] as usize + 2];
                    s.read_exact(&mut b).await.unwrap();
                    dest.push(len[0]);
                    dest.extend_from_slice(&b);
                }
                _ => panic!("unexpected atyp"),
            }

            // success, bound to 0.0.0.0:0
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            dest
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn single_hop_connect_no_auth() {
        let (addr, proxy) = fake_proxy(false).await;
        let chain = SocksChain {
            hops: vec![SocksHop {
                host: addr.ip().to_string(),
                port: addr.port(),
                username: None,
                password: None,
            }],
        };

        let stream = dial_through_chain(&chain, "example.com", 22, Duration::from_secs(5))
            .await
            .unwrap();
        drop(stream);

        let dest = proxy.await.unwrap();
        // domain atyp: len, "example.com", port 22
        assert_eq!(dest[0] as usize, "example.com".len());
        assert_eq!(&dest[1..=11], b"example.com");
        assert_eq!(u16::from_be_bytes([dest[12], dest[13]]), 22);
    }

    #[tokio::test]
    async fn single_hop_with_userpass() {
        let (addr, proxy) = fake_proxy(true).await;
        let chain = SocksChain {
            hops: vec![SocksHop {
                host: addr.ip().to_string(),
                port: addr.port(),
                username: Some("u".into()),
                password: Some("p".into()),
            }],
        };

        dial_through_chain(&chain, "10.1.2.3", 2222, Duration::from_secs(5))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn dead_entry_hop_names_hop_zero() {
        // bind-then-drop to get a port nothing listens on
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let chain = SocksChain {
            hops: vec![SocksHop {
                host: addr.ip().to_string(),
                port: addr.port(),
                username: None,
                password: None,
            }],
        };

        let err = dial_through_chain(&chain, "example.com", 22, Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            SshError::DialFailed { cause, .. } => assert_eq!(cause, DialCause::ProxyHop(0)),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn reply_reasons_cover_spec_codes() {
        assert_eq!(reply_reason(0x05), "connection refused");
        assert_eq!(reply_reason(0x04), "host unreachable");
    }
}
