/*!
 * Control connection to the paired controller.
 *
 * At most one connection is live at a time. Each connection runs in its own
 * task and reports open/line/error/close notices tagged with a connection id;
 * notices from a connection that has since been replaced or closed are
 * discarded by [`Transport::accept`].
 */
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use poolflow_core::types::DeviceAddress;

use crate::connector::SharedConnector;
use crate::error::{DeviceError, Result};

/// Identifies one connection attempt
pub type ConnectionId = u64;

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket opened
    Opened,
    /// A line arrived from the controller
    Line(String),
    /// A socket error; informational, a `Closed` always follows
    Error(String),
    /// The socket closed (or never opened)
    Closed,
}

/// A transport event tagged with its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    /// Originating connection
    pub connection: ConnectionId,
    /// What happened
    pub event: TransportEvent,
}

/// Connection settings
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Control port
    pub port: u16,
    /// Socket open timeout
    pub connect_timeout: Duration,
}

#[derive(Debug)]
struct LiveConnection {
    id: ConnectionId,
    address: DeviceAddress,
    outgoing: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
    open: bool,
}

/// Owner of the single control connection
#[derive(Debug)]
pub struct Transport {
    connector: SharedConnector,
    options: TransportOptions,
    notices: mpsc::Sender<TransportNotice>,
    next_id: ConnectionId,
    live: Option<LiveConnection>,
}

impl Transport {
    /// Create a transport that reports on `notices`
    pub fn new(
        connector: SharedConnector,
        options: TransportOptions,
        notices: mpsc::Sender<TransportNotice>,
    ) -> Self {
        Self {
            connector,
            options,
            notices,
            next_id: 0,
            live: None,
        }
    }

    /// Open a connection to `address`, closing any existing one first
    pub fn open(&mut self, address: DeviceAddress) -> ConnectionId {
        self.close();

        self.next_id += 1;
        let id = self.next_id;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        info!("Connecting to controller at {}:{}", address, self.options.port);
        let task = tokio::spawn(run_connection(
            id,
            address,
            self.connector.clone(),
            self.options,
            outgoing_rx,
            self.notices.clone(),
        ));

        self.live = Some(LiveConnection {
            id,
            address,
            outgoing,
            task,
            open: false,
        });
        id
    }

    /// Tear down the current connection, if any. Its pending notices become stale.
    pub fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!("Closing connection {} to {}", live.id, live.address);
            live.task.abort();
        }
    }

    /// Filter a notice: stale notices yield `None`, current ones update the
    /// open flag and are passed through
    pub fn accept(&mut self, notice: TransportNotice) -> Option<TransportEvent> {
        let live = self.live.as_mut().filter(|live| live.id == notice.connection)?;

        match &notice.event {
            TransportEvent::Opened => live.open = true,
            TransportEvent::Closed => {
                self.live = None;
            }
            _ => {}
        }
        Some(notice.event)
    }

    /// Whether the current connection is open
    pub fn is_open(&self) -> bool {
        self.live.as_ref().map_or(false, |live| live.open)
    }

    /// Address of the current connection, open or not
    pub fn address(&self) -> Option<DeviceAddress> {
        self.live.as_ref().map(|live| live.address)
    }

    /// Write one line to the controller. Refused with a warning when not open.
    pub fn send(&self, line: &str) -> Result<()> {
        match self.live.as_ref().filter(|live| live.open) {
            Some(live) => {
                debug!("Sending {:?} to {}", line, live.address);
                live.outgoing
                    .send(line.to_string())
                    .map_err(|_| DeviceError::NotConnected)
            }
            None => {
                warn!("Cannot send {:?}: controller not connected", line);
                Err(DeviceError::NotConnected)
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    id: ConnectionId,
    address: DeviceAddress,
    connector: SharedConnector,
    options: TransportOptions,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    notices: mpsc::Sender<TransportNotice>,
) {
    let notify = |event: TransportEvent| {
        let notices = notices.clone();
        async move {
            // The receiver only goes away when the session shuts down
            let _ = notices.send(TransportNotice { connection: id, event }).await;
        }
    };

    let stream = match timeout(options.connect_timeout, connector.connect(address, options.port)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            notify(TransportEvent::Error(format!("connect to {} failed: {}", address, e))).await;
            notify(TransportEvent::Closed).await;
            return;
        }
        Err(_) => {
            notify(TransportEvent::Error(format!(
                "connect to {} timed out after {:?}",
                address, options.connect_timeout
            )))
            .await;
            notify(TransportEvent::Closed).await;
            return;
        }
    };

    notify(TransportEvent::Opened).await;

    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => notify(TransportEvent::Line(line)).await,
                Ok(None) => {
                    debug!("Controller at {} closed the connection", address);
                    break;
                }
                Err(e) => {
                    notify(TransportEvent::Error(format!("read from {} failed: {}", address, e))).await;
                    break;
                }
            },
            line = outgoing.recv() => {
                let Some(line) = line else { break };
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    notify(TransportEvent::Error(format!("write to {} failed: {}", address, e))).await;
                    break;
                }
            }
        }
    }

    notify(TransportEvent::Closed).await;
}
