//! TCP transport for Modbus-TCP request/response exchanges

use std::fmt::Write as _;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::LinkError;
use crate::protocol::{MbapHeader, ReadRequest, MBAP_HEADER_LEN};

/// Open a TCP session with nodelay and OS keep-alive enabled
pub async fn connect(
    endpoint: &str,
    connect_timeout: Duration,
    keep_alive: Duration,
) -> Result<TcpStream, LinkError> {
    debug!("Connecting to TCP endpoint: {}", endpoint);

    let stream = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(LinkError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
        },
        Err(_) => return Err(LinkError::Timeout(connect_timeout)),
    };

    configure_socket(&stream, keep_alive);
    Ok(stream)
}

fn configure_socket(stream: &TcpStream, keep_alive: Duration) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    if keep_alive.is_zero() {
        return;
    }
    let socket = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(keep_alive);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set keep-alive: {}", e);
    }
}

/// Send one read request and wait for its response
///
/// The whole exchange is bounded by `read_timeout`.
pub async fn exchange(
    stream: &mut TcpStream,
    request: &ReadRequest,
    read_timeout: Duration,
) -> Result<Vec<u16>, LinkError> {
    match timeout(read_timeout, exchange_inner(stream, request)).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout(read_timeout)),
    }
}

async fn exchange_inner(
    stream: &mut TcpStream,
    request: &ReadRequest,
) -> Result<Vec<u16>, LinkError> {
    let frame = request.encode();
    stream.write_all(&frame).await?;
    debug!(hex_data = %format_hex(&frame), direction = "send", "Modbus frame");

    let mut header_buf = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut header_buf).await?;
    let header = MbapHeader::decode(&header_buf)?;

    let mut pdu = vec![0u8; header.pdu_len()];
    stream.read_exact(&mut pdu).await?;
    debug!(
        hex_data = %format_hex(&pdu),
        transaction_id = header.transaction_id,
        direction = "recv",
        "Modbus frame"
    );

    Ok(request.decode_response(&header, &pdu)?)
}

fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}
