// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! HTTP CONNECT tunnelling.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ProxyConfig;
use crate::Error;

// An ill-behaved proxy must not be able to feed us headers forever.
const MAX_RESPONSE: usize = 8192;

/// Establishes a CONNECT tunnel to `host:port` over a socket already
/// connected to the proxy. On success the socket carries the raw
/// end-to-end byte stream and the XML or TLS handshake can start.
pub(crate) async fn tunnel(
    socket: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &ProxyConfig,
) -> Result<(), Error> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(username) = &proxy.username {
        let credentials = format!("{}:{}", username, proxy.password.as_deref().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");

    log::debug!("connecting via proxy {}:{}", proxy.host, proxy.port);
    socket.write_all(request.as_bytes()).await?;
    socket.flush().await?;

    // Read byte-wise up to the blank line; everything after it already
    // belongs to the tunnelled stream.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_RESPONSE {
            return Err(Error::Proxy("oversized CONNECT response".to_owned()));
        }
        let n = socket.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Proxy("proxy closed during CONNECT".to_owned()));
        }
        response.push(byte[0]);
    }

    let status_line = response
        .split(|b| *b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    check_status(&status_line)
}

fn check_status(status_line: &str) -> Result<(), Error> {
    let code = status_line.split_whitespace().nth(1);
    if code == Some("200") {
        Ok(())
    } else {
        Err(Error::Proxy(format!(
            "CONNECT rejected: {}",
            status_line.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_200_status() {
        assert!(check_status("HTTP/1.1 200 Connection established").is_ok());
        assert!(check_status("HTTP/1.0 200 OK").is_ok());
    }

    #[test]
    fn rejects_other_statuses() {
        assert!(check_status("HTTP/1.1 407 Proxy Authentication Required").is_err());
        assert!(check_status("garbage").is_err());
    }
}
