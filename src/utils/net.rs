//! TCP bind/connect helper functions with retrying logic.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::TsoError;

/// Interval between bind/connect retries.
const RETRY_DELAY: Duration = Duration::from_millis(200);

fn new_socket_for(addr: SocketAddr) -> Result<TcpSocket, TsoError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_linger(None)?;
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, TsoError> {
    loop {
        let socket = new_socket_for(bind_addr)?;
        if let Err(err) = socket.bind(bind_addr) {
            if retries == 0 {
                return Err(err.into());
            }
            retries -= 1;
            time::sleep(RETRY_DELAY).await;
            continue;
        }

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, TsoError> {
    loop {
        let socket = new_socket_for(conn_addr)?;
        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
