/*!
 * Controller discovery for PoolFlow.
 *
 * A scan probes a prioritized list of local addresses with a bounded number
 * of probes in flight and stops at the first controller that answers.
 */
use std::ops::RangeInclusive;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use poolflow_core::config::{Config, ProbeTimeouts};
use poolflow_core::event::ScanOutcome;
use poolflow_core::logging::operation_span;
use poolflow_core::types::{DeviceAddress, DiscoveredPool, DiscoveryProgress, SignalEstimate};

use crate::connector::SharedConnector;
use crate::protocol::{Message, Request};

/// Host ranges of a /24, most likely to hold a controller first
const PRIORITY_TIERS: [RangeInclusive<u8>; 5] = [1..=10, 100..=120, 121..=200, 11..=99, 201..=254];

/// Build the probe order for the given /24 prefixes.
///
/// Each tier is laid out across every prefix before the next tier starts.
/// The first `shuffle_prefix` candidates are shuffled.
pub fn candidate_queue<R: Rng + ?Sized>(
    ranges: &[String],
    shuffle_prefix: usize,
    rng: &mut R,
) -> Vec<DeviceAddress> {
    let prefixes: Vec<[u8; 3]> = ranges
        .iter()
        .filter_map(|range| {
            let prefix = parse_prefix(range);
            if prefix.is_none() {
                warn!("Skipping invalid discovery range {:?}", range);
            }
            prefix
        })
        .collect();

    let mut queue = Vec::new();
    for tier in PRIORITY_TIERS.iter() {
        for [a, b, c] in &prefixes {
            for host in tier.clone() {
                let address = DeviceAddress::new(*a, *b, *c, host);
                if !queue.contains(&address) {
                    queue.push(address);
                }
            }
        }
    }

    let prefix = shuffle_prefix.min(queue.len());
    queue[..prefix].shuffle(rng);
    queue
}

fn parse_prefix(range: &str) -> Option<[u8; 3]> {
    let mut octets = range.split('.').map(|o| o.parse::<u8>().ok());
    let prefix = [octets.next()??, octets.next()??, octets.next()??];
    octets.next().is_none().then_some(prefix)
}

/// Something that happened during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A probe finished
    Progress(DiscoveryProgress),
    /// A controller answered
    Found(DiscoveredPool),
    /// The scan ended
    Finished(ScanOutcome),
}

/// Result of probing one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Answered like a controller
    Found,
    /// Answered, but not like a controller
    Rejected,
    /// Opened but stayed silent until the response timeout
    NoReply,
    /// Could not be opened in time
    Unreachable,
}

/// Scan settings
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Control port probed on each candidate
    pub port: u16,
    /// /24 prefixes to sweep
    pub ranges: Vec<String>,
    /// Maximum probes in flight
    pub max_concurrent: usize,
    /// Number of leading candidates to shuffle
    pub shuffle_prefix: usize,
    /// Timeouts for sweep probes
    pub sweep: ProbeTimeouts,
    /// Timeouts for single-address tests
    pub direct: ProbeTimeouts,
    /// Wall-clock ceiling for one scan
    pub scan_timeout: Duration,
}

impl ScanOptions {
    /// Derive the options from the configuration
    pub fn from_config(config: &Config) -> Self {
        let discovery = &config.discovery;
        Self {
            port: config.connection.port,
            ranges: discovery.active_ranges(),
            max_concurrent: discovery.max_concurrent.max(1),
            shuffle_prefix: discovery.shuffle_prefix,
            sweep: discovery.sweep_timeouts(),
            direct: discovery.direct_timeouts(),
            scan_timeout: discovery.scan_timeout(),
        }
    }
}

/// Finds controllers on the local network
#[derive(Debug, Clone)]
pub struct DiscoveryScanner {
    connector: SharedConnector,
    options: ScanOptions,
}

impl DiscoveryScanner {
    /// Create a scanner
    pub fn new(connector: SharedConnector, options: ScanOptions) -> Self {
        Self { connector, options }
    }

    /// Scan settings
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Probe order for the next scan
    pub fn candidates(&self) -> Vec<DeviceAddress> {
        candidate_queue(
            &self.options.ranges,
            self.options.shuffle_prefix,
            &mut rand::thread_rng(),
        )
    }

    /// Run one scan, reporting on `events`. The last event sent is `Finished`.
    ///
    /// Dropping the returned future cancels every probe in flight.
    pub async fn scan(&self, events: mpsc::Sender<ScanEvent>) -> ScanOutcome {
        let candidates = self.candidates();
        let total = candidates.len();
        info!(
            "Scanning {} addresses across {} range(s), {} at a time",
            total,
            self.options.ranges.len(),
            self.options.max_concurrent
        );

        let report = |event: ScanEvent| {
            let events = events.clone();
            async move {
                let _ = events.send(event).await;
            }
        };
        report(ScanEvent::Progress(DiscoveryProgress { scanned: 0, total })).await;

        let sweep = async {
            let mut queue = candidates.into_iter();
            let mut in_flight = FuturesUnordered::new();
            let mut scanned = 0;

            loop {
                while in_flight.len() < self.options.max_concurrent {
                    match queue.next() {
                        Some(address) => in_flight.push(self.probe(address, self.options.sweep)),
                        None => break,
                    }
                }

                let Some((address, outcome)) = in_flight.next().await else {
                    return ScanOutcome::Exhausted;
                };
                scanned += 1;
                report(ScanEvent::Progress(DiscoveryProgress { scanned, total })).await;

                if outcome == ProbeOutcome::Found {
                    let signal = SignalEstimate::new(rand::thread_rng().gen_range(4..=5));
                    report(ScanEvent::Found(DiscoveredPool::new(address, signal))).await;
                    return ScanOutcome::Found;
                }
            }
        };

        let outcome = match timeout(self.options.scan_timeout, sweep).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Discovery gave up after {:?}", self.options.scan_timeout);
                ScanOutcome::TimedOut
            }
        };

        info!("Discovery finished: {:?}", outcome);
        report(ScanEvent::Finished(outcome)).await;
        outcome
    }

    /// Probe a single address with the longer direct-test timeouts
    pub async fn test_address(&self, address: DeviceAddress) -> Option<DiscoveredPool> {
        match self.probe(address, self.options.direct).await {
            (address, ProbeOutcome::Found) => {
                info!("Controller confirmed at {}", address);
                Some(DiscoveredPool::new(address, SignalEstimate::MAX))
            }
            (address, outcome) => {
                debug!("No controller at {}: {:?}", address, outcome);
                None
            }
        }
    }

    /// Open a socket to `address`, send the mode query and classify the first line
    pub async fn probe(
        &self,
        address: DeviceAddress,
        timeouts: ProbeTimeouts,
    ) -> (DeviceAddress, ProbeOutcome) {
        let span = operation_span("probe", &address.to_string());
        let outcome = async {
            let connect = self.connector.connect(address, self.options.port);
            let mut stream = match timeout(timeouts.connect(), connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    trace!("Probe connect failed: {}", e);
                    return ProbeOutcome::Unreachable;
                }
                Err(_) => return ProbeOutcome::Unreachable,
            };

            let query = format!("{}\n", Request::PumpMode);
            if stream.write_all(query.as_bytes()).await.is_err() {
                return ProbeOutcome::Unreachable;
            }

            let mut lines = BufReader::new(stream).lines();
            match timeout(timeouts.response(), lines.next_line()).await {
                Ok(Ok(Some(line))) if Message::is_controller_reply(&line) => {
                    debug!("Controller reply {:?}", line);
                    ProbeOutcome::Found
                }
                Ok(Ok(Some(line))) => {
                    trace!("Not a controller: {:?}", line);
                    ProbeOutcome::Rejected
                }
                _ => ProbeOutcome::NoReply,
            }
        }
        .instrument(span)
        .await;

        (address, outcome)
    }
}
