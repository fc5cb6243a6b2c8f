/*!
 * Socket abstraction shared by the transport and the discovery scanner.
 *
 * Both only need "open a byte stream to this address"; keeping that behind a
 * trait lets the simulator stand in for real controllers.
 */
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use poolflow_core::types::DeviceAddress;

/// A bidirectional byte stream to a controller
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Boxed controller stream
pub type BoxedStream = Box<dyn DeviceStream>;

/// Opens streams to controllers
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Open a stream to `address` on `port`.
    ///
    /// Implementations do not apply timeouts; callers bound the call.
    async fn connect(&self, address: DeviceAddress, port: u16) -> io::Result<BoxedStream>;
}

/// A connector that can be shared between tasks
pub type SharedConnector = Arc<dyn Connector>;

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: DeviceAddress, port: u16) -> io::Result<BoxedStream> {
        trace!("Opening TCP stream to {}:{}", address, port);
        let stream = TcpStream::connect((address.ip(), port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_round_trip() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await?;
            let mut lines = BufReader::new(socket).lines();
            let line = lines.next_line().await?;
            Ok::<_, io::Error>(line)
        });

        let mut stream = TcpConnector.connect(DeviceAddress::new(127, 0, 0, 1), port).await?;
        stream.write_all(b"/pompe/mode\n").await?;
        stream.flush().await?;

        let received = server
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        assert_eq!(received.as_deref(), Some("/pompe/mode"));
        Ok(())
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = TcpConnector.connect(DeviceAddress::new(127, 0, 0, 1), port).await;
        assert!(result.is_err());
    }
}
