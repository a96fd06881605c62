//! TCP transport for secure links.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::keys::{KeyMaterial, Role};
use crate::{LinkError, SecureLink};

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Accept one connection and wrap it as the server end of a link
pub async fn accept_link<K>(
    listener: &TcpListener,
    key_material: &mut K,
) -> Result<(SecureLink<TcpStream>, SocketAddr), LinkError>
where
    K: KeyMaterial + ?Sized,
{
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    debug!(%peer, "Accepted link connection");
    Ok((SecureLink::new(stream, key_material, Role::Server)?, peer))
}

/// Connect to `addr` and wrap the stream as the client end of a link
pub async fn connect_link<K>(
    addr: SocketAddr,
    key_material: &mut K,
) -> Result<SecureLink<TcpStream>, LinkError>
where
    K: KeyMaterial + ?Sized,
{
    let stream = connect_tcp(addr).await?;
    debug!(%addr, "Connected link");
    SecureLink::new(stream, key_material, Role::Client)
}
