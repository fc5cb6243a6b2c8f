/*!
 * The pool session state machine.
 *
 * All session state lives here and changes only through
 * [`PoolStateMachine::handle`]. The machine performs no I/O: every input
 * yields a list of [`Effect`]s that the session driver carries out (open or
 * close the socket, send a request, arm a timer, persist the pairing, start a
 * scan, emit an event). This keeps connection handling, the initial query
 * sequence and slot reply correlation testable without sockets or clocks.
 */
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use poolflow_core::config::ConnectionConfig;
use poolflow_core::event::{PoolEvent, ScanOutcome};
use poolflow_core::types::{
    ConnectionState, DeviceAddress, DiscoveredPool, DiscoveryProgress, ErrorFlags, LinkPhase,
    PumpMode, SlotIndex, TemperatureReading, TimeSlots,
};
use poolflow_devices::discovery::ScanEvent;
use poolflow_devices::protocol::{Message, Request};

use crate::timers::TimerId;

/// Everything a subscriber can observe about the session
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PoolSnapshot {
    /// Lifecycle phase
    pub phase: LinkPhase,
    /// Connection flags
    pub connection: ConnectionState,
    /// Paired controller, if any
    pub paired_address: Option<DeviceAddress>,
    /// Last reported pump mode
    pub pump_mode: PumpMode,
    /// Last reported temperatures
    pub temperature: TemperatureReading,
    /// Last reported slot durations
    pub time_slots: TimeSlots,
    /// Last reported fault flags
    pub error_flags: ErrorFlags,
    /// Controllers found since the last scan started
    pub discovered: Vec<DiscoveredPool>,
    /// Progress of the running (or last) scan
    pub discovery_progress: DiscoveryProgress,
}

/// Operations requested through the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a line verbatim
    SendRaw(String),
    /// Query water then air temperature
    FetchTemperatures,
    /// Query the pump mode
    FetchPumpMode,
    /// Change the pump mode
    SetPumpMode(PumpMode),
    /// Query one slot
    FetchTimeSlot(SlotIndex),
    /// Query all six slots
    FetchAllTimeSlots,
    /// Add an hour to a slot
    IncrementTimeSlot(SlotIndex),
    /// Remove an hour from a slot
    DecrementTimeSlot(SlotIndex),
    /// Query the fault flags
    FetchErrors,
    /// Start a discovery scan
    StartDiscovery,
    /// Stop the running scan
    StopDiscovery,
    /// Pair with a controller and connect to it
    Pair(DeviceAddress),
    /// Forget the paired controller
    Unpair,
    /// Re-run the initial query sequence
    ForceRefresh,
}

/// Everything the machine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The stored pairing was loaded at start-up
    Restored(Option<DeviceAddress>),
    /// A client command
    Command(Command),
    /// The socket opened
    Opened,
    /// A line arrived from the controller
    Received {
        /// Raw line
        line: String,
        /// Arrival time
        at: DateTime<Utc>,
    },
    /// The socket closed, or failed to open
    Closed,
    /// A timer went off
    Timer(TimerId),
    /// Progress from the running scan
    Scan(ScanEvent),
    /// A direct address test found a controller
    AddressConfirmed(DiscoveredPool),
}

/// Side effects for the driver to carry out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the socket, replacing any existing one
    Open(DeviceAddress),
    /// Close the socket
    Close,
    /// Write a request
    Send(Request),
    /// Arm a timer, replacing a pending one with the same id
    Schedule(TimerId, Duration),
    /// Disarm a timer
    Cancel(TimerId),
    /// Store the pairing (`None` removes it)
    Persist(Option<DeviceAddress>),
    /// Start a scan
    StartScan,
    /// Abort the running scan
    StopScan,
    /// Publish a notification
    Emit(PoolEvent),
}

/// Initial query sequence stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryStage {
    Mode,
    Water,
    Air,
    Slots,
    Errors,
}

/// Which initial data has arrived since the last reset
#[derive(Debug, Clone, Copy, Default)]
struct Latches {
    pump_mode: bool,
    water: bool,
    error_flags: bool,
}

/// Machine settings
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Connection timing
    pub connection: ConnectionConfig,
    /// Scan when nothing is paired at start-up
    pub scan_on_start: bool,
    /// Pair with the first controller a scan finds
    pub auto_pair: bool,
}

/// The session state machine
#[derive(Debug)]
pub struct PoolStateMachine {
    settings: MachineSettings,
    snapshot: PoolSnapshot,
    latches: Latches,
    next_stage: Option<QueryStage>,
    slot_in_flight: Option<SlotIndex>,
    slot_queue: VecDeque<Request>,
    slot_dispatch_pending: bool,
}

impl PoolStateMachine {
    /// Create an unpaired, disconnected machine
    pub fn new(settings: MachineSettings) -> Self {
        Self {
            settings,
            snapshot: PoolSnapshot::default(),
            latches: Latches::default(),
            next_stage: None,
            slot_in_flight: None,
            slot_queue: VecDeque::new(),
            slot_dispatch_pending: false,
        }
    }

    /// Current state
    pub fn snapshot(&self) -> &PoolSnapshot {
        &self.snapshot
    }

    /// Slot whose reply is awaited
    pub fn slot_in_flight(&self) -> Option<SlotIndex> {
        self.slot_in_flight
    }

    /// Slot requests waiting behind the in-flight one
    pub fn queued_slot_requests(&self) -> usize {
        self.slot_queue.len()
    }

    /// Apply one input
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Restored(address) => self.on_restored(address, &mut effects),
            Input::Command(command) => self.on_command(command, &mut effects),
            Input::Opened => self.on_opened(&mut effects),
            Input::Received { line, at } => self.on_received(&line, at, &mut effects),
            Input::Closed => self.on_closed(&mut effects),
            Input::Timer(id) => self.on_timer(id, &mut effects),
            Input::Scan(event) => self.on_scan(event, &mut effects),
            Input::AddressConfirmed(pool) => self.add_discovered(pool, &mut effects),
        }
        effects
    }

    fn on_restored(&mut self, address: Option<DeviceAddress>, effects: &mut Vec<Effect>) {
        match address {
            Some(address) => {
                info!("Restored pairing with {}", address);
                self.set_paired(Some(address));
                self.connect(address, effects);
            }
            None => {
                info!("No paired controller");
                self.set_paired(None);
                self.snapshot.phase = LinkPhase::Unpaired;
                if self.settings.scan_on_start {
                    self.start_discovery(effects);
                }
            }
        }
    }

    fn on_command(&mut self, command: Command, effects: &mut Vec<Effect>) {
        debug!("Command {:?}", command);
        match command {
            Command::SendRaw(line) => self.send(Request::Raw(line), effects),
            Command::FetchTemperatures => {
                self.send(Request::WaterTemperature, effects);
                if self.snapshot.connection.is_connected {
                    effects.push(Effect::Schedule(
                        TimerId::AirFollowUp,
                        self.settings.connection.query_interval(),
                    ));
                }
            }
            Command::FetchPumpMode => self.send(Request::PumpMode, effects),
            Command::SetPumpMode(mode) => {
                // Shown right away; the controller's GMD report has the last word
                if self.snapshot.connection.is_connected {
                    self.snapshot.pump_mode = mode;
                }
                self.send(Request::SetPumpMode(mode), effects);
            }
            Command::FetchTimeSlot(slot) => self.enqueue_slot(Request::TimeSlot(slot), effects),
            Command::FetchAllTimeSlots => self.enqueue_all_slots(effects),
            Command::IncrementTimeSlot(slot) => {
                self.enqueue_slot(Request::IncrementSlot(slot), effects)
            }
            Command::DecrementTimeSlot(slot) => {
                self.enqueue_slot(Request::DecrementSlot(slot), effects)
            }
            Command::FetchErrors => self.send(Request::Errors, effects),
            Command::StartDiscovery => self.start_discovery(effects),
            Command::StopDiscovery => self.stop_discovery(effects),
            Command::Pair(address) => {
                self.stop_discovery(effects);
                self.pair(address, effects);
            }
            Command::Unpair => self.unpair(effects),
            Command::ForceRefresh => self.force_refresh(effects),
        }
    }

    fn on_opened(&mut self, effects: &mut Vec<Effect>) {
        let Some(address) = self.snapshot.paired_address else {
            return;
        };
        info!("Connected to controller at {}", address);

        self.snapshot.connection.is_connected = true;
        self.reset_initial_data();
        self.reset_slot_queue(effects);
        self.snapshot.phase = LinkPhase::Initializing;

        effects.push(Effect::Cancel(TimerId::Reconnect));
        self.begin_query_sequence(self.settings.connection.initial_query_delay(), effects);
        effects.push(Effect::Emit(PoolEvent::Connected { address }));
    }

    fn on_closed(&mut self, effects: &mut Vec<Effect>) {
        let was_connected = self.snapshot.connection.is_connected;
        self.end_session(effects);

        let Some(address) = self.snapshot.paired_address else {
            self.snapshot.phase = LinkPhase::Unpaired;
            return;
        };

        let delay = self.settings.connection.reconnect_delay();
        if was_connected {
            warn!("Connection to {} lost, retrying in {:?}", address, delay);
            effects.push(Effect::Emit(PoolEvent::Disconnected {
                address,
                will_retry: true,
            }));
        } else {
            debug!("Could not reach {}, retrying in {:?}", address, delay);
        }
        self.snapshot.phase = LinkPhase::Disconnected;
        effects.push(Effect::Cancel(TimerId::Reconnect));
        effects.push(Effect::Schedule(TimerId::Reconnect, delay));
    }

    fn on_received(&mut self, line: &str, at: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if line.trim().is_empty() {
            return;
        }
        let message = match Message::decode(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping controller line {:?}: {}", line, e);
                return;
            }
        };
        debug!("Received {:?}", message);
        self.snapshot.connection.last_update = Some(at);

        match message {
            Message::WaterTemperature(water) => {
                self.snapshot.temperature = self.snapshot.temperature.with_water(water);
                self.latches.water = true;
            }
            Message::AirTemperature(air) => {
                self.snapshot.temperature = self.snapshot.temperature.with_air(air);
            }
            Message::PumpMode(mode) => {
                self.snapshot.pump_mode = mode;
                self.latches.pump_mode = true;
            }
            Message::ErrorFlags(flags) => {
                self.snapshot.error_flags = flags;
                self.latches.error_flags = true;
            }
            Message::TimeSlot { slot, hours } => self.on_slot_reply(slot, hours, effects),
        }

        self.check_initialized(effects);
    }

    fn on_slot_reply(&mut self, slot: Option<SlotIndex>, hours: u16, effects: &mut Vec<Effect>) {
        let in_flight = self.slot_in_flight.take();
        let Some(slot) = slot.or(in_flight) else {
            warn!("Dropping bare slot reply ({} h) with no request outstanding", hours);
            return;
        };
        self.snapshot.time_slots = self.snapshot.time_slots.with(slot, hours);

        if in_flight.is_some() {
            effects.push(Effect::Cancel(TimerId::SlotTimeout));
            self.schedule_slot_dispatch(effects);
        }
    }

    fn on_timer(&mut self, id: TimerId, effects: &mut Vec<Effect>) {
        match id {
            TimerId::Reconnect => {
                if let Some(address) = self.snapshot.paired_address {
                    if !self.snapshot.connection.is_connected {
                        self.connect(address, effects);
                    }
                }
            }
            TimerId::QueryStep => self.run_query_stage(effects),
            TimerId::AirFollowUp => self.send(Request::AirTemperature, effects),
            TimerId::SlotTimeout => {
                if let Some(slot) = self.slot_in_flight.take() {
                    warn!("No reply for slot {}, moving on", slot);
                    self.schedule_slot_dispatch(effects);
                }
            }
            TimerId::SlotDispatch => {
                self.slot_dispatch_pending = false;
                self.dispatch_next_slot(effects);
            }
        }
    }

    fn on_scan(&mut self, event: ScanEvent, effects: &mut Vec<Effect>) {
        if !self.snapshot.connection.is_discovering {
            return;
        }
        match event {
            ScanEvent::Progress(progress) => self.snapshot.discovery_progress = progress,
            ScanEvent::Found(pool) => {
                let address = pool.address;
                self.add_discovered(pool, effects);
                if self.settings.auto_pair && self.snapshot.paired_address.is_none() {
                    info!("Pairing automatically with {}", address);
                    self.pair(address, effects);
                }
            }
            ScanEvent::Finished(outcome) => self.finish_discovery(outcome, effects),
        }
    }

    fn connect(&mut self, address: DeviceAddress, effects: &mut Vec<Effect>) {
        self.snapshot.phase = LinkPhase::Connecting;
        effects.push(Effect::Cancel(TimerId::Reconnect));
        effects.push(Effect::Open(address));
    }

    fn send(&mut self, request: Request, effects: &mut Vec<Effect>) {
        if !self.snapshot.connection.is_connected {
            warn!("Not connected, dropping {}", request);
            return;
        }
        effects.push(Effect::Send(request));
    }

    fn set_paired(&mut self, address: Option<DeviceAddress>) {
        self.snapshot.paired_address = address;
        self.snapshot.connection.is_paired = address.is_some();
    }

    fn pair(&mut self, address: DeviceAddress, effects: &mut Vec<Effect>) {
        info!("Pairing with controller at {}", address);
        if self.snapshot.connection.is_connected {
            self.end_session(effects);
        }
        self.set_paired(Some(address));
        effects.push(Effect::Persist(Some(address)));
        effects.push(Effect::Emit(PoolEvent::Paired { address }));
        self.connect(address, effects);
    }

    fn unpair(&mut self, effects: &mut Vec<Effect>) {
        if self.snapshot.paired_address.is_none() {
            debug!("Unpair requested with nothing paired");
        }
        info!("Removing pairing");
        self.end_session(effects);
        effects.push(Effect::Cancel(TimerId::Reconnect));
        effects.push(Effect::Close);

        self.set_paired(None);
        self.reset_initial_data();
        self.snapshot.temperature = TemperatureReading::default();
        self.snapshot.pump_mode = PumpMode::default();
        self.snapshot.error_flags = ErrorFlags::default();
        self.snapshot.phase = LinkPhase::Unpaired;
        effects.push(Effect::Persist(None));
        effects.push(Effect::Emit(PoolEvent::Unpaired));
    }

    /// Drop per-connection state
    fn end_session(&mut self, effects: &mut Vec<Effect>) {
        self.snapshot.connection.is_connected = false;
        self.next_stage = None;
        self.reset_slot_queue(effects);
        for id in [TimerId::QueryStep, TimerId::AirFollowUp] {
            effects.push(Effect::Cancel(id));
        }
    }

    fn force_refresh(&mut self, effects: &mut Vec<Effect>) {
        if self.snapshot.connection.is_connected {
            info!("Refreshing controller data");
            self.reset_initial_data();
            self.snapshot.phase = LinkPhase::Initializing;
            self.begin_query_sequence(self.settings.connection.refresh_query_delay(), effects);
        } else if let Some(address) = self.snapshot.paired_address {
            info!("Refresh requested while disconnected, reconnecting now");
            self.reset_initial_data();
            self.connect(address, effects);
        } else {
            warn!("Refresh requested with nothing paired");
        }
    }

    fn reset_initial_data(&mut self) {
        self.latches = Latches::default();
        self.snapshot.connection.data_initialized = false;
    }

    fn check_initialized(&mut self, effects: &mut Vec<Effect>) {
        if self.snapshot.connection.data_initialized || !self.snapshot.connection.is_connected {
            return;
        }
        let latches = self.latches;
        let errors_ready = latches.error_flags || !self.settings.connection.require_error_flags;
        if latches.pump_mode && latches.water && errors_ready {
            info!("Controller data initialized");
            self.snapshot.connection.data_initialized = true;
            self.snapshot.phase = LinkPhase::Ready;
            effects.push(Effect::Emit(PoolEvent::DataReady));
        }
    }

    fn begin_query_sequence(&mut self, delay: Duration, effects: &mut Vec<Effect>) {
        self.next_stage = Some(QueryStage::Mode);
        effects.push(Effect::Schedule(TimerId::QueryStep, delay));
    }

    fn run_query_stage(&mut self, effects: &mut Vec<Effect>) {
        let Some(stage) = self.next_stage.take() else {
            return;
        };
        if !self.snapshot.connection.is_connected {
            return;
        }

        let interval = self.settings.connection.query_interval();
        let next = match stage {
            QueryStage::Mode => {
                self.send(Request::PumpMode, effects);
                Some((QueryStage::Water, interval))
            }
            QueryStage::Water => {
                self.send(Request::WaterTemperature, effects);
                Some((QueryStage::Air, interval))
            }
            QueryStage::Air => {
                self.send(Request::AirTemperature, effects);
                Some((QueryStage::Slots, interval))
            }
            QueryStage::Slots => {
                self.enqueue_all_slots(effects);
                Some((
                    QueryStage::Errors,
                    self.settings.connection.errors_query_delay(),
                ))
            }
            QueryStage::Errors => {
                self.send(Request::Errors, effects);
                None
            }
        };

        if let Some((stage, delay)) = next {
            self.next_stage = Some(stage);
            effects.push(Effect::Schedule(TimerId::QueryStep, delay));
        }
    }

    fn enqueue_all_slots(&mut self, effects: &mut Vec<Effect>) {
        for slot in SlotIndex::all() {
            self.enqueue_slot(Request::TimeSlot(slot), effects);
        }
    }

    fn enqueue_slot(&mut self, request: Request, effects: &mut Vec<Effect>) {
        if !self.snapshot.connection.is_connected {
            warn!("Not connected, dropping {}", request);
            return;
        }
        self.slot_queue.push_back(request);
        if self.slot_in_flight.is_none() && !self.slot_dispatch_pending {
            self.dispatch_next_slot(effects);
        }
    }

    fn dispatch_next_slot(&mut self, effects: &mut Vec<Effect>) {
        if self.slot_in_flight.is_some() || !self.snapshot.connection.is_connected {
            return;
        }
        let Some(request) = self.slot_queue.pop_front() else {
            return;
        };
        self.slot_in_flight = request.slot();
        effects.push(Effect::Send(request));
        effects.push(Effect::Schedule(
            TimerId::SlotTimeout,
            self.settings.connection.slot_response_timeout(),
        ));
    }

    fn schedule_slot_dispatch(&mut self, effects: &mut Vec<Effect>) {
        if self.slot_queue.is_empty() {
            return;
        }
        self.slot_dispatch_pending = true;
        effects.push(Effect::Schedule(
            TimerId::SlotDispatch,
            self.settings.connection.slot_chain_delay(),
        ));
    }

    fn reset_slot_queue(&mut self, effects: &mut Vec<Effect>) {
        if !self.slot_queue.is_empty() {
            debug!("Discarding {} queued slot request(s)", self.slot_queue.len());
        }
        self.slot_queue.clear();
        self.slot_in_flight = None;
        self.slot_dispatch_pending = false;
        effects.push(Effect::Cancel(TimerId::SlotTimeout));
        effects.push(Effect::Cancel(TimerId::SlotDispatch));
    }

    fn start_discovery(&mut self, effects: &mut Vec<Effect>) {
        if self.snapshot.connection.is_discovering {
            debug!("Discovery already running");
            return;
        }
        info!("Starting discovery");
        self.snapshot.connection.is_discovering = true;
        self.snapshot.discovered.clear();
        self.snapshot.discovery_progress = DiscoveryProgress::default();
        effects.push(Effect::StartScan);
    }

    fn stop_discovery(&mut self, effects: &mut Vec<Effect>) {
        if !self.snapshot.connection.is_discovering {
            return;
        }
        info!("Stopping discovery");
        effects.push(Effect::StopScan);
        self.finish_discovery(ScanOutcome::Stopped, effects);
    }

    fn finish_discovery(&mut self, outcome: ScanOutcome, effects: &mut Vec<Effect>) {
        self.snapshot.connection.is_discovering = false;
        effects.push(Effect::Emit(PoolEvent::DiscoveryFinished {
            outcome,
            found: self.snapshot.discovered.len(),
        }));
    }

    fn add_discovered(&mut self, pool: DiscoveredPool, effects: &mut Vec<Effect>) {
        if self.snapshot.discovered.iter().any(|known| known.id == pool.id) {
            return;
        }
        info!("Found controller {} at {}", pool.name, pool.address);
        self.snapshot.discovered.push(pool.clone());
        effects.push(Effect::Emit(PoolEvent::DeviceFound { pool }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolflow_core::types::SignalEstimate;

    const ADDRESS: DeviceAddress = DeviceAddress::new(10, 0, 0, 5);

    fn settings() -> MachineSettings {
        MachineSettings {
            connection: ConnectionConfig::default(),
            scan_on_start: true,
            auto_pair: false,
        }
    }

    fn slot(n: usize) -> SlotIndex {
        SlotIndex::new(n).unwrap()
    }

    fn receive(machine: &mut PoolStateMachine, line: &str) -> Vec<Effect> {
        machine.handle(Input::Received {
            line: line.to_string(),
            at: Utc::now(),
        })
    }

    fn sent(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(request) => Some(request.to_string()),
                _ => None,
            })
            .collect()
    }

    fn scheduled(effects: &[Effect], id: TimerId) -> Option<Duration> {
        effects.iter().rev().find_map(|e| match e {
            Effect::Schedule(timer, delay) if *timer == id => Some(*delay),
            _ => None,
        })
    }

    fn emitted(effects: &[Effect]) -> Vec<PoolEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// A machine paired with ADDRESS and connected
    fn connected(settings: MachineSettings) -> PoolStateMachine {
        let mut machine = PoolStateMachine::new(settings);
        machine.handle(Input::Restored(Some(ADDRESS)));
        machine.handle(Input::Opened);
        machine
    }

    #[test]
    fn test_restore_with_pairing_connects() {
        let mut machine = PoolStateMachine::new(settings());
        let effects = machine.handle(Input::Restored(Some(ADDRESS)));

        assert!(effects.contains(&Effect::Open(ADDRESS)));
        assert!(!effects.contains(&Effect::StartScan));
        assert_eq!(machine.snapshot().phase, LinkPhase::Connecting);
        assert!(machine.snapshot().connection.is_paired);
    }

    #[test]
    fn test_restore_without_pairing_scans() {
        let mut machine = PoolStateMachine::new(settings());
        let effects = machine.handle(Input::Restored(None));
        assert_eq!(effects, vec![Effect::StartScan]);
        assert!(machine.snapshot().connection.is_discovering);

        let mut quiet = PoolStateMachine::new(MachineSettings {
            scan_on_start: false,
            ..settings()
        });
        assert!(quiet.handle(Input::Restored(None)).is_empty());
        assert_eq!(quiet.snapshot().phase, LinkPhase::Unpaired);
    }

    #[test]
    fn test_initial_query_sequence() {
        let mut machine = PoolStateMachine::new(settings());
        machine.handle(Input::Restored(Some(ADDRESS)));
        let effects = machine.handle(Input::Opened);

        assert_eq!(scheduled(&effects, TimerId::QueryStep), Some(Duration::from_millis(1000)));
        assert_eq!(
            emitted(&effects),
            vec![PoolEvent::Connected { address: ADDRESS }]
        );
        assert!(sent(&effects).is_empty());

        let mut order = Vec::new();
        let mut delays = Vec::new();
        loop {
            let effects = machine.handle(Input::Timer(TimerId::QueryStep));
            order.extend(sent(&effects));
            match scheduled(&effects, TimerId::QueryStep) {
                Some(delay) => delays.push(delay),
                None => break,
            }
        }

        // Only the first slot goes out immediately; the rest are queued
        assert_eq!(
            order,
            vec!["/pompe/mode", "/temp/water", "/temp/air", "/slot/0", "/errors"]
        );
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(500),
                Duration::from_millis(500),
                Duration::from_millis(1000),
            ]
        );
        assert_eq!(machine.slot_in_flight(), Some(slot(0)));
        assert_eq!(machine.queued_slot_requests(), 5);
    }

    #[test]
    fn test_round_trip_initializes_data() {
        let mut machine = connected(settings());

        receive(&mut machine, "GMD2");
        receive(&mut machine, "GTW24");
        let effects = receive(&mut machine, "GTA19");
        assert!(emitted(&effects).is_empty());
        assert!(!machine.snapshot().connection.data_initialized);

        let effects = receive(&mut machine, "GER0");
        assert_eq!(emitted(&effects), vec![PoolEvent::DataReady]);

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.pump_mode, PumpMode::Auto);
        assert_eq!(snapshot.temperature.water, 24);
        assert_eq!(snapshot.temperature.air, 19);
        assert!(snapshot.connection.data_initialized);
        assert_eq!(snapshot.phase, LinkPhase::Ready);
        assert!(snapshot.connection.last_update.is_some());

        // The latch fires once
        assert!(emitted(&receive(&mut machine, "GER3")).is_empty());
    }

    #[test]
    fn test_snapshot_serializes_for_subscribers() {
        let mut machine = connected(settings());
        receive(&mut machine, "GMD1");
        receive(&mut machine, "GER33");

        let json = serde_json::to_value(machine.snapshot()).unwrap();
        assert_eq!(json["phase"], "initializing");
        assert_eq!(json["paired_address"], "10.0.0.5");
        assert_eq!(json["pump_mode"], "on");
        assert_eq!(json["error_flags"]["clock_error"], true);
        assert_eq!(json["error_flags"]["water_battery_low"], true);
        assert_eq!(json["connection"]["is_connected"], true);
    }

    #[test]
    fn test_latch_without_error_flags() {
        let mut connection = ConnectionConfig::default();
        connection.require_error_flags = false;
        let mut machine = connected(MachineSettings {
            connection,
            ..settings()
        });

        receive(&mut machine, "GTW24");
        let effects = receive(&mut machine, "GMD2");
        assert_eq!(emitted(&effects), vec![PoolEvent::DataReady]);
    }

    #[test]
    fn test_water_trend() {
        let mut machine = connected(settings());
        receive(&mut machine, "GTW24");
        assert_eq!(machine.snapshot().temperature.trend, 0);
        receive(&mut machine, "GTW26");
        assert_eq!(machine.snapshot().temperature.trend, 2);
        receive(&mut machine, "GTW26");
        assert_eq!(machine.snapshot().temperature.trend, 2);
        receive(&mut machine, "GTW25");
        assert_eq!(machine.snapshot().temperature.trend, -1);
    }

    #[test]
    fn test_set_pump_mode_is_optimistic() {
        let mut machine = connected(settings());
        receive(&mut machine, "GMD0");

        let effects = machine.handle(Input::Command(Command::SetPumpMode(PumpMode::Auto)));
        assert_eq!(sent(&effects), vec!["/pompe/auto".to_string()]);
        assert_eq!(machine.snapshot().pump_mode, PumpMode::Auto);

        // The controller's report wins
        receive(&mut machine, "GMD1");
        assert_eq!(machine.snapshot().pump_mode, PumpMode::On);
    }

    #[test]
    fn test_set_pump_mode_while_disconnected_changes_nothing() {
        let mut machine = PoolStateMachine::new(settings());
        machine.handle(Input::Restored(Some(ADDRESS)));

        let effects = machine.handle(Input::Command(Command::SetPumpMode(PumpMode::On)));
        assert!(sent(&effects).is_empty());
        assert_eq!(machine.snapshot().pump_mode, PumpMode::Off);
    }

    #[test]
    fn test_extreme_water_readings_do_not_panic() {
        let mut machine = connected(settings());
        receive(&mut machine, "GTW2147483647");
        receive(&mut machine, "GTW-2147483648");
        assert_eq!(machine.snapshot().temperature.water, i32::MIN);
        assert_eq!(machine.snapshot().temperature.trend, i32::MIN);
    }

    #[test]
    fn test_bad_lines_are_dropped() {
        let mut machine = connected(settings());
        receive(&mut machine, "GMD1");
        let before = machine.snapshot().clone();

        for line in ["GTWabc", "XYZ12", "", "GMD7", "GER200"] {
            assert!(receive(&mut machine, line).is_empty());
        }
        assert_eq!(machine.snapshot(), &before);
    }

    #[test]
    fn test_force_refresh_resets_latches() {
        let mut machine = connected(settings());
        for line in ["GMD0", "GTW20", "GER0"] {
            receive(&mut machine, line);
        }
        assert!(machine.snapshot().connection.data_initialized);

        let effects = machine.handle(Input::Command(Command::ForceRefresh));
        assert!(!machine.snapshot().connection.data_initialized);
        assert_eq!(machine.snapshot().phase, LinkPhase::Initializing);
        assert_eq!(scheduled(&effects, TimerId::QueryStep), Some(Duration::from_millis(100)));

        // Reports from before the refresh do not count toward the new latch
        receive(&mut machine, "GMD0");
        receive(&mut machine, "GTW20");
        assert!(!machine.snapshot().connection.data_initialized);
        assert_eq!(emitted(&receive(&mut machine, "GER0")), vec![PoolEvent::DataReady]);
    }

    #[test]
    fn test_slot_requests_are_serialized() {
        let mut machine = connected(settings());

        let effects = machine.handle(Input::Command(Command::FetchTimeSlot(slot(2))));
        assert_eq!(sent(&effects), vec!["/slot/2"]);
        assert_eq!(scheduled(&effects, TimerId::SlotTimeout), Some(Duration::from_millis(2000)));

        // A second request waits instead of overwriting the first
        let effects = machine.handle(Input::Command(Command::IncrementTimeSlot(slot(4))));
        assert!(sent(&effects).is_empty());
        assert_eq!(machine.queued_slot_requests(), 1);

        // A bare reply belongs to the in-flight slot
        let effects = receive(&mut machine, "GTS7");
        assert_eq!(machine.snapshot().time_slots.get(slot(2)), 7);
        assert!(effects.contains(&Effect::Cancel(TimerId::SlotTimeout)));
        assert_eq!(scheduled(&effects, TimerId::SlotDispatch), Some(Duration::from_millis(200)));
        assert_eq!(machine.slot_in_flight(), None);

        let effects = machine.handle(Input::Timer(TimerId::SlotDispatch));
        assert_eq!(sent(&effects), vec!["/slot/4/add"]);
        assert_eq!(machine.slot_in_flight(), Some(slot(4)));

        receive(&mut machine, "GTS43");
        assert_eq!(machine.snapshot().time_slots.get(slot(4)), 3);
        assert_eq!(machine.slot_in_flight(), None);
    }

    #[test]
    fn test_slot_timeout_moves_on() {
        let mut machine = connected(settings());
        machine.handle(Input::Command(Command::FetchAllTimeSlots));
        assert_eq!(machine.slot_in_flight(), Some(slot(0)));

        let effects = machine.handle(Input::Timer(TimerId::SlotTimeout));
        assert_eq!(machine.slot_in_flight(), None);
        assert!(scheduled(&effects, TimerId::SlotDispatch).is_some());

        let effects = machine.handle(Input::Timer(TimerId::SlotDispatch));
        assert_eq!(sent(&effects), vec!["/slot/1"]);

        // A late reply for slot 0 still names its slot, and resolves slot 1's wait
        receive(&mut machine, "GTS05");
        assert_eq!(machine.snapshot().time_slots.get(slot(0)), 5);
        assert_eq!(machine.slot_in_flight(), None);
    }

    #[test]
    fn test_bare_slot_reply_without_request_is_dropped() {
        let mut machine = connected(settings());
        let before = machine.snapshot().time_slots;
        assert!(receive(&mut machine, "GTS9").is_empty());
        assert_eq!(machine.snapshot().time_slots, before);

        // Indexed unsolicited replies are still applied
        receive(&mut machine, "GTS310");
        assert_eq!(machine.snapshot().time_slots.get(slot(3)), 10);
    }

    #[test]
    fn test_commands_while_disconnected_send_nothing() {
        let mut machine = PoolStateMachine::new(settings());
        machine.handle(Input::Restored(Some(ADDRESS)));

        for command in [
            Command::FetchTemperatures,
            Command::SetPumpMode(PumpMode::On),
            Command::FetchTimeSlot(slot(1)),
            Command::SendRaw("/pompe/mode".to_string()),
        ] {
            assert!(sent(&machine.handle(Input::Command(command))).is_empty());
        }
        assert_eq!(machine.queued_slot_requests(), 0);
    }

    #[test]
    fn test_fetch_temperatures_follows_up_with_air() {
        let mut machine = connected(settings());
        let effects = machine.handle(Input::Command(Command::FetchTemperatures));
        assert_eq!(sent(&effects), vec!["/temp/water"]);
        assert_eq!(scheduled(&effects, TimerId::AirFollowUp), Some(Duration::from_millis(500)));

        let effects = machine.handle(Input::Timer(TimerId::AirFollowUp));
        assert_eq!(sent(&effects), vec!["/temp/air"]);
    }

    #[test]
    fn test_close_schedules_single_reconnect() {
        let mut machine = connected(settings());
        machine.handle(Input::Command(Command::FetchAllTimeSlots));

        let effects = machine.handle(Input::Closed);
        assert_eq!(scheduled(&effects, TimerId::Reconnect), Some(Duration::from_secs(5)));
        assert_eq!(
            emitted(&effects),
            vec![PoolEvent::Disconnected {
                address: ADDRESS,
                will_retry: true
            }]
        );
        assert_eq!(machine.snapshot().phase, LinkPhase::Disconnected);
        assert_eq!(machine.queued_slot_requests(), 0);
        assert_eq!(machine.slot_in_flight(), None);

        // A second close replaces the pending reconnect rather than adding one
        let effects = machine.handle(Input::Closed);
        let cancel = effects
            .iter()
            .position(|e| *e == Effect::Cancel(TimerId::Reconnect))
            .unwrap();
        let schedule = effects
            .iter()
            .position(|e| matches!(e, Effect::Schedule(TimerId::Reconnect, _)))
            .unwrap();
        assert!(cancel < schedule);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Schedule(TimerId::Reconnect, _)))
                .count(),
            1
        );
        assert!(emitted(&effects).is_empty());

        let effects = machine.handle(Input::Timer(TimerId::Reconnect));
        assert!(effects.contains(&Effect::Open(ADDRESS)));
        assert_eq!(machine.snapshot().phase, LinkPhase::Connecting);
    }

    #[test]
    fn test_close_while_unpaired_does_not_reconnect() {
        let mut machine = PoolStateMachine::new(settings());
        let effects = machine.handle(Input::Closed);
        assert!(scheduled(&effects, TimerId::Reconnect).is_none());
        assert!(machine.handle(Input::Timer(TimerId::Reconnect)).is_empty());
    }

    #[test]
    fn test_pair_and_unpair() {
        let mut machine = PoolStateMachine::new(MachineSettings {
            scan_on_start: false,
            ..settings()
        });
        machine.handle(Input::Restored(None));

        let effects = machine.handle(Input::Command(Command::Pair(ADDRESS)));
        assert!(effects.contains(&Effect::Persist(Some(ADDRESS))));
        assert!(effects.contains(&Effect::Open(ADDRESS)));
        assert_eq!(emitted(&effects), vec![PoolEvent::Paired { address: ADDRESS }]);
        assert_eq!(machine.snapshot().paired_address, Some(ADDRESS));

        machine.handle(Input::Opened);
        for line in ["GMD2", "GTW24", "GTW26", "GTA19", "GER5"] {
            receive(&mut machine, line);
        }
        assert!(machine.snapshot().connection.data_initialized);
        assert_eq!(machine.snapshot().temperature.trend, 2);

        let effects = machine.handle(Input::Command(Command::Unpair));
        assert!(effects.contains(&Effect::Close));
        assert!(effects.contains(&Effect::Persist(None)));
        assert!(effects.contains(&Effect::Cancel(TimerId::Reconnect)));
        assert_eq!(emitted(&effects), vec![PoolEvent::Unpaired]);

        let connection = &machine.snapshot().connection;
        assert!(!connection.is_paired);
        assert!(!connection.is_connected);
        assert!(!connection.data_initialized);
        assert_eq!(machine.snapshot().phase, LinkPhase::Unpaired);

        // Device readings are cleared with the pairing
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.temperature, TemperatureReading { water: 0, air: 0, trend: 0 });
        assert_eq!(snapshot.pump_mode, PumpMode::Off);
        assert_eq!(snapshot.error_flags.mask(), 0);

        // The close that follows our own teardown does not schedule a reconnect
        let effects = machine.handle(Input::Closed);
        assert!(scheduled(&effects, TimerId::Reconnect).is_none());
    }

    #[test]
    fn test_discovery_lifecycle() {
        let mut machine = PoolStateMachine::new(settings());
        machine.handle(Input::Restored(None));
        assert!(machine.snapshot().connection.is_discovering);

        let progress = DiscoveryProgress { scanned: 3, total: 10 };
        machine.handle(Input::Scan(ScanEvent::Progress(progress)));

        // Starting again while running is a no-op that keeps progress
        assert!(machine.handle(Input::Command(Command::StartDiscovery)).is_empty());
        assert_eq!(machine.snapshot().discovery_progress, progress);

        let pool = DiscoveredPool::new(ADDRESS, SignalEstimate::new(4));
        let effects = machine.handle(Input::Scan(ScanEvent::Found(pool.clone())));
        assert_eq!(emitted(&effects), vec![PoolEvent::DeviceFound { pool: pool.clone() }]);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Open(_))));

        let effects = machine.handle(Input::Scan(ScanEvent::Finished(ScanOutcome::Found)));
        assert_eq!(
            emitted(&effects),
            vec![PoolEvent::DiscoveryFinished {
                outcome: ScanOutcome::Found,
                found: 1
            }]
        );
        assert!(!machine.snapshot().connection.is_discovering);
        assert_eq!(machine.snapshot().discovered, vec![pool]);

        // A new scan clears earlier results
        assert_eq!(
            machine.handle(Input::Command(Command::StartDiscovery)),
            vec![Effect::StartScan]
        );
        assert!(machine.snapshot().discovered.is_empty());
        assert_eq!(machine.snapshot().discovery_progress, DiscoveryProgress::default());
    }

    #[test]
    fn test_stop_discovery() {
        let mut machine = PoolStateMachine::new(settings());
        machine.handle(Input::Restored(None));

        let effects = machine.handle(Input::Command(Command::StopDiscovery));
        assert_eq!(effects[0], Effect::StopScan);
        assert_eq!(
            emitted(&effects),
            vec![PoolEvent::DiscoveryFinished {
                outcome: ScanOutcome::Stopped,
                found: 0
            }]
        );

        // Late events from the stopped scan are ignored
        let late = DiscoveredPool::new(ADDRESS, SignalEstimate::new(5));
        assert!(machine.handle(Input::Scan(ScanEvent::Found(late))).is_empty());
        assert!(machine.handle(Input::Command(Command::StopDiscovery)).is_empty());
    }

    #[test]
    fn test_auto_pair_on_first_find() {
        let mut machine = PoolStateMachine::new(MachineSettings {
            auto_pair: true,
            ..settings()
        });
        machine.handle(Input::Restored(None));

        let pool = DiscoveredPool::new(ADDRESS, SignalEstimate::new(4));
        let effects = machine.handle(Input::Scan(ScanEvent::Found(pool)));
        assert!(effects.contains(&Effect::Persist(Some(ADDRESS))));
        assert!(effects.contains(&Effect::Open(ADDRESS)));
        assert!(!effects.contains(&Effect::StopScan));
    }

    #[test]
    fn test_address_confirmation_joins_discovered_set() {
        let mut machine = PoolStateMachine::new(settings());
        let pool = DiscoveredPool::new(ADDRESS, SignalEstimate::MAX);

        let effects = machine.handle(Input::AddressConfirmed(pool.clone()));
        assert_eq!(emitted(&effects), vec![PoolEvent::DeviceFound { pool: pool.clone() }]);
        assert!(machine.handle(Input::AddressConfirmed(pool)).is_empty());
        assert_eq!(machine.snapshot().discovered.len(), 1);
    }
}
