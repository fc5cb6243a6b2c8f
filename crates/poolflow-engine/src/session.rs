/*!
 * The session driver.
 *
 * One task owns the state machine, the transport, the timers and the running
 * scan. It feeds every input through the machine, carries out the resulting
 * effects and publishes the snapshot whenever it changed.
 */
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use poolflow_core::config::Config;
use poolflow_core::event::SharedEventBus;
use poolflow_core::logging::component_span;
use poolflow_core::utils::spawn_and_log;
use poolflow_core::types::{DeviceAddress, DiscoveredPool};
use poolflow_devices::connector::SharedConnector;
use poolflow_devices::discovery::{DiscoveryScanner, ScanEvent, ScanOptions};
use poolflow_devices::pairing::{load_or_unpaired, PairingStore};
use poolflow_devices::transport::{Transport, TransportEvent, TransportNotice, TransportOptions};

use crate::client::PoolClient;
use crate::error::{Error, Result};
use crate::state_machine::{Command, Effect, Input, MachineSettings, PoolSnapshot, PoolStateMachine};
use crate::timers::{TimerFired, Timers};

const REQUEST_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 64;
const SCAN_EVENT_CAPACITY: usize = 64;

/// Messages from clients to the driver
#[derive(Debug)]
pub(crate) enum SessionRequest {
    Command(Command),
    TestAddress(DeviceAddress, oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Entry point for running a pool session
#[derive(Debug)]
pub struct PoolService;

impl PoolService {
    /// Load the pairing and start the session task.
    ///
    /// With a stored pairing the session connects right away; otherwise it
    /// starts a discovery scan when `discovery.scan_on_start` is set.
    pub async fn start(
        config: Config,
        store: Arc<dyn PairingStore>,
        connector: SharedConnector,
    ) -> Result<PoolClient> {
        config.validate()?;

        let paired = load_or_unpaired(store.as_ref()).await;
        let (requests_tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        let (notices_tx, notices) = mpsc::channel(NOTICE_CAPACITY);
        let (timers_tx, timer_fired) = mpsc::unbounded_channel();
        let (confirmed_tx, confirmed) = mpsc::channel(REQUEST_CAPACITY);

        let machine = PoolStateMachine::new(MachineSettings {
            connection: config.connection.clone(),
            scan_on_start: config.discovery.scan_on_start,
            auto_pair: config.discovery.auto_pair,
        });
        let (snapshots, snapshot_rx) = watch::channel(machine.snapshot().clone());
        let events = SharedEventBus::new();

        let transport = Transport::new(
            connector.clone(),
            TransportOptions {
                port: config.connection.port,
                connect_timeout: config.connection.connect_timeout(),
            },
            notices_tx,
        );

        let mut driver = SessionDriver {
            machine,
            transport,
            timers: Timers::new(timers_tx),
            scanner: DiscoveryScanner::new(connector, ScanOptions::from_config(&config)),
            scan: None,
            store,
            snapshots,
            events: events.clone(),
            requests,
            notices,
            timer_fired,
            confirmed_tx,
            confirmed,
        };

        // The restored state is visible to the caller as soon as this returns
        let span = component_span("pool-session", paired.map(|a| a.to_string()).as_deref());
        driver
            .apply(Input::Restored(paired))
            .instrument(span.clone())
            .await;
        tokio::spawn(driver.run().instrument(span));

        Ok(PoolClient::new(requests_tx, snapshot_rx, events))
    }
}

#[derive(Debug)]
struct ScanTask {
    task: JoinHandle<()>,
    events: mpsc::Receiver<ScanEvent>,
}

struct SessionDriver {
    machine: PoolStateMachine,
    transport: Transport,
    timers: Timers,
    scanner: DiscoveryScanner,
    scan: Option<ScanTask>,
    store: Arc<dyn PairingStore>,
    snapshots: watch::Sender<PoolSnapshot>,
    events: SharedEventBus,
    requests: mpsc::Receiver<SessionRequest>,
    notices: mpsc::Receiver<TransportNotice>,
    timer_fired: mpsc::UnboundedReceiver<TimerFired>,
    confirmed_tx: mpsc::Sender<DiscoveredPool>,
    confirmed: mpsc::Receiver<DiscoveredPool>,
}

impl SessionDriver {
    async fn run(mut self) {
        info!("Pool session started");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(SessionRequest::Command(command)) => {
                        self.apply(Input::Command(command)).await;
                    }
                    Some(SessionRequest::TestAddress(address, reply)) => {
                        self.test_address(address, reply);
                    }
                    Some(SessionRequest::Shutdown(done)) => {
                        self.stop();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(notice) = self.notices.recv() => {
                    if let Some(event) = self.transport.accept(notice) {
                        self.on_transport(event).await;
                    }
                }
                Some(fired) = self.timer_fired.recv() => {
                    if let Some(id) = self.timers.accept(fired) {
                        self.apply(Input::Timer(id)).await;
                    }
                }
                event = next_scan_event(&mut self.scan) => match event {
                    Some(event) => self.apply(Input::Scan(event)).await,
                    None => self.scan = None,
                },
                Some(pool) = self.confirmed.recv() => {
                    self.apply(Input::AddressConfirmed(pool)).await;
                }
            }
        }

        info!("Pool session stopped");
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.apply(Input::Opened).await,
            TransportEvent::Line(line) => {
                self.apply(Input::Received { line, at: Utc::now() }).await
            }
            TransportEvent::Error(e) => warn!("Transport error: {}", e),
            TransportEvent::Closed => self.apply(Input::Closed).await,
        }
    }

    /// Run one input through the machine. Subscribers see the new snapshot
    /// before any notification it produced.
    async fn apply(&mut self, input: Input) {
        let mut notifications = Vec::new();
        for effect in self.machine.handle(input) {
            match effect {
                Effect::Emit(event) => notifications.push(event),
                effect => self.execute(effect).await,
            }
        }

        let snapshot = self.machine.snapshot();
        self.snapshots.send_if_modified(|current| {
            if current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });

        for event in notifications {
            if let Err(e) = self.events.publish(event) {
                warn!("Failed to publish session event: {}", e);
            }
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Open(address) => {
                self.transport.open(address);
            }
            Effect::Close => self.transport.close(),
            Effect::Send(request) => {
                // Refusals are already logged by the transport
                let _ = self.transport.send(&request.to_string());
            }
            Effect::Schedule(id, delay) => self.timers.schedule(id, delay),
            Effect::Cancel(id) => self.timers.cancel(id),
            Effect::Persist(address) => {
                if let Err(e) = self.store.save(address).await {
                    error!("Failed to persist pairing {:?}: {}", address, e);
                }
            }
            Effect::StartScan => self.start_scan(),
            Effect::StopScan => self.stop_scan(),
            Effect::Emit(_) => {}
        }
    }

    fn start_scan(&mut self) {
        self.stop_scan();

        let (tx, events) = mpsc::channel(SCAN_EVENT_CAPACITY);
        let scanner = self.scanner.clone();
        let task = tokio::spawn(
            async move {
                scanner.scan(tx).await;
            }
            .in_current_span(),
        );
        self.scan = Some(ScanTask { task, events });
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            debug!("Aborting discovery task");
            scan.task.abort();
        }
    }

    fn test_address(&self, address: DeviceAddress, reply: oneshot::Sender<bool>) {
        let scanner = self.scanner.clone();
        let confirmed = self.confirmed_tx.clone();
        spawn_and_log(
            "address-test",
            async move {
                let found = scanner.test_address(address).await;
                let is_found = found.is_some();
                if let Some(pool) = found {
                    confirmed.send(pool).await?;
                }
                let _ = reply.send(is_found);
                Ok::<_, Error>(())
            }
            .in_current_span(),
        );
    }

    fn stop(&mut self) {
        self.stop_scan();
        self.timers.cancel_all();
        self.transport.close();
    }
}

async fn next_scan_event(scan: &mut Option<ScanTask>) -> Option<ScanEvent> {
    match scan {
        Some(scan) => scan.events.recv().await,
        None => std::future::pending().await,
    }
}
