/*!
 * In-process controller simulator.
 *
 * [`SimulatorConnector`] implements [`Connector`] over in-memory duplex pipes,
 * serving one [`SimulatedController`] per address. It backs the test suites
 * and the CLI's `--simulate` mode.
 */
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;
use tracing::{debug, trace};

use poolflow_core::types::{
    DeviceAddress, ErrorFlags, PumpMode, SlotIndex, TimeSlots, MAX_SLOT_HOURS,
};

use crate::connector::{BoxedStream, Connector};
use crate::protocol::{Message, Request};

const PIPE_CAPACITY: usize = 4096;

/// State and reply logic of one simulated controller
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimulatedController {
    mode: PumpMode,
    water: i32,
    air: i32,
    slots: TimeSlots,
    error_mask: u8,
    bare_slot_replies: bool,
    ignored: Vec<String>,
}

impl SimulatedController {
    /// A controller with pump off, 0 °C and empty slots
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pump mode
    pub fn with_mode(mut self, mode: PumpMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set both temperatures
    pub fn with_temperatures(mut self, water: i32, air: i32) -> Self {
        self.water = water;
        self.air = air;
        self
    }

    /// Set every slot duration
    pub fn with_slots(mut self, slots: [u16; 6]) -> Self {
        self.slots = TimeSlots::from(slots);
        self
    }

    /// Set the error bitmask
    pub fn with_error_mask(mut self, mask: u8) -> Self {
        self.error_mask = mask & ErrorFlags::MAX_MASK;
        self
    }

    /// Answer slot queries with the bare `GTS<hours>` form
    pub fn with_bare_slot_replies(mut self) -> Self {
        self.bare_slot_replies = true;
        self
    }

    /// Never answer the given command line
    pub fn ignoring(mut self, command: &str) -> Self {
        self.ignored.push(command.to_string());
        self
    }

    /// Current pump mode
    pub fn mode(&self) -> PumpMode {
        self.mode
    }

    /// Current slot durations
    pub fn slots(&self) -> TimeSlots {
        self.slots
    }

    /// Change the water temperature
    pub fn set_water(&mut self, water: i32) {
        self.water = water;
    }

    /// Apply one command line, returning the reply line if any
    pub fn handle(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if self.ignored.iter().any(|ignored| ignored == line) {
            trace!("Simulator ignoring {:?}", line);
            return None;
        }

        let reply = match Request::parse(line)? {
            Request::PumpMode => Message::PumpMode(self.mode),
            Request::SetPumpMode(mode) => {
                self.mode = mode;
                Message::PumpMode(mode)
            }
            Request::WaterTemperature => Message::WaterTemperature(self.water),
            Request::AirTemperature => Message::AirTemperature(self.air),
            Request::Errors => Message::ErrorFlags(ErrorFlags::from_mask(self.error_mask)),
            Request::TimeSlot(slot) => self.slot_reply(slot),
            Request::IncrementSlot(slot) => {
                let hours = (self.slots.get(slot) + 1).min(MAX_SLOT_HOURS);
                self.slots = self.slots.with(slot, hours);
                self.slot_reply(slot)
            }
            Request::DecrementSlot(slot) => {
                let hours = self.slots.get(slot).saturating_sub(1);
                self.slots = self.slots.with(slot, hours);
                self.slot_reply(slot)
            }
            Request::Raw(_) => return None,
        };
        Some(reply.encode())
    }

    fn slot_reply(&self, slot: SlotIndex) -> Message {
        Message::TimeSlot {
            slot: (!self.bare_slot_replies).then_some(slot),
            hours: self.slots.get(slot),
        }
    }
}

/// How a simulated address behaves when connected to
#[derive(Debug, Clone)]
enum Behavior {
    /// A pool controller
    Controller(Arc<Mutex<SimulatedController>>),
    /// Accepts connections, never writes
    Silent,
    /// Some other service answering every line with a fixed reply
    Foreign(String),
}

#[derive(Debug)]
struct Host {
    behavior: Behavior,
    reachable: bool,
    connections: usize,
    kill: watch::Sender<u64>,
}

/// Connector serving simulated hosts
#[derive(Debug, Clone, Default)]
pub struct SimulatorConnector {
    hosts: Arc<Mutex<HashMap<DeviceAddress, Host>>>,
}

impl SimulatorConnector {
    /// A connector with no hosts; every address refuses connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a controller at `address`
    pub fn add(&self, address: DeviceAddress, controller: SimulatedController) {
        self.insert(address, Behavior::Controller(Arc::new(Mutex::new(controller))));
    }

    /// Accept connections at `address` but never reply
    pub fn add_silent(&self, address: DeviceAddress) {
        self.insert(address, Behavior::Silent);
    }

    /// Serve a non-controller service at `address`
    pub fn add_foreign(&self, address: DeviceAddress, reply: &str) {
        self.insert(address, Behavior::Foreign(reply.to_string()));
    }

    fn insert(&self, address: DeviceAddress, behavior: Behavior) {
        let (kill, _) = watch::channel(0);
        self.lock().insert(
            address,
            Host {
                behavior,
                reachable: true,
                connections: 0,
                kill,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceAddress, Host>> {
        // A poisoned map only means a test panicked mid-update
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the controller state at `address`
    pub fn controller(&self, address: DeviceAddress) -> Option<SimulatedController> {
        match &self.lock().get(&address)?.behavior {
            Behavior::Controller(controller) => {
                Some(controller.lock().unwrap_or_else(|e| e.into_inner()).clone())
            }
            _ => None,
        }
    }

    /// Mutate the controller at `address`
    pub fn update<F>(&self, address: DeviceAddress, f: F)
    where
        F: FnOnce(&mut SimulatedController),
    {
        if let Some(Host {
            behavior: Behavior::Controller(controller),
            ..
        }) = self.lock().get(&address)
        {
            f(&mut controller.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    /// Number of connections ever accepted at `address`
    pub fn connection_count(&self, address: DeviceAddress) -> usize {
        self.lock().get(&address).map_or(0, |host| host.connections)
    }

    /// Make `address` refuse (or accept again) new connections
    pub fn set_reachable(&self, address: DeviceAddress, reachable: bool) {
        if let Some(host) = self.lock().get_mut(&address) {
            host.reachable = reachable;
        }
    }

    /// Close every open connection to `address` from the device side
    pub fn drop_connections(&self, address: DeviceAddress) {
        if let Some(host) = self.lock().get(&address) {
            debug!("Simulator dropping connections to {}", address);
            host.kill.send_modify(|epoch| *epoch += 1);
        }
    }
}

#[async_trait]
impl Connector for SimulatorConnector {
    async fn connect(&self, address: DeviceAddress, _port: u16) -> io::Result<BoxedStream> {
        let (behavior, kill) = {
            let mut hosts = self.lock();
            let host = hosts
                .get_mut(&address)
                .filter(|host| host.reachable)
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            host.connections += 1;
            (host.behavior.clone(), host.kill.subscribe())
        };

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(serve(server, behavior, kill));
        Ok(Box::new(client))
    }
}

async fn serve(stream: DuplexStream, behavior: Behavior, mut kill: watch::Receiver<u64>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = kill.changed() => break,
        };

        let reply = match &behavior {
            Behavior::Controller(controller) => controller
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle(&line),
            Behavior::Silent => None,
            Behavior::Foreign(reply) => Some(reply.clone()),
        };

        if let Some(reply) = reply {
            let written = async {
                writer.write_all(reply.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if written.await.is_err() {
                break;
            }
        }
    }
}
