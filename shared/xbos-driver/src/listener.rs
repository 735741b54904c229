//! Raw UDP listeners for devices that push their state

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{DriverError, Result};
use crate::registry::SeriesRegistry;

#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn handle(&self, data: Bytes, from: SocketAddr, series: &SeriesRegistry) -> Result<()>;
}

#[async_trait]
impl<F> DatagramHandler for F
where
    F: Fn(Bytes, SocketAddr, &SeriesRegistry) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, data: Bytes, from: SocketAddr, series: &SeriesRegistry) -> Result<()> {
        (self)(data, from, series)
    }
}

pub struct UdpListener {
    socket: std::net::UdpSocket,
    read_size: usize,
}

impl UdpListener {
    /// Bind `0.0.0.0:port`. Binding happens immediately so a port conflict
    /// is reported to the caller rather than from inside a running task.
    pub fn bind(port: u16, read_size: usize) -> Result<Self> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), read_size)
    }

    pub fn bind_addr(addr: SocketAddr, read_size: usize) -> Result<Self> {
        if read_size == 0 {
            return Err(DriverError::Validation(
                "UDP read size must be greater than zero".to_string(),
            ));
        }
        let socket = std::net::UdpSocket::bind(addr)
            .map_err(|e| DriverError::Setup(format!("cannot bind UDP {}: {}", addr, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DriverError::Setup(e.to_string()))?;
        Ok(Self { socket, read_size })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| DriverError::Setup(e.to_string()))
    }

    /// Receive datagrams forever. Handler failures are logged; a socket
    /// error ends the listener.
    pub async fn run(self, handler: Arc<dyn DatagramHandler>, series: SeriesRegistry) -> Result<()> {
        let socket = UdpSocket::from_std(self.socket)
            .map_err(|e| DriverError::Setup(e.to_string()))?;
        let local = socket.local_addr()?;
        info!(addr = %local, read_size = self.read_size, "UDP listener started");

        let mut buf = vec![0u8; self.read_size];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            debug!(addr = %local, from = %from, bytes = len, "Datagram received");

            let data = Bytes::copy_from_slice(&buf[..len]);
            if let Err(e) = handler.handle(data, from, &series).await {
                warn!(addr = %local, from = %from, error = %e, "Datagram handler failed");
            }
        }
    }
}
