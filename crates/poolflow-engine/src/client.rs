/*!
 * Handle for talking to a running pool session.
 */
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use poolflow_core::event::{PoolEvent, SharedEventBus};
use poolflow_core::types::{DeviceAddress, PumpMode, SlotIndex};
use poolflow_devices::error::DeviceError;

use crate::error::{Error, Result};
use crate::session::SessionRequest;
use crate::state_machine::{Command, PoolSnapshot};

/// Cheap, cloneable handle to the single session
#[derive(Debug, Clone)]
pub struct PoolClient {
    requests: mpsc::Sender<SessionRequest>,
    snapshots: watch::Receiver<PoolSnapshot>,
    events: SharedEventBus,
}

impl PoolClient {
    pub(crate) fn new(
        requests: mpsc::Sender<SessionRequest>,
        snapshots: watch::Receiver<PoolSnapshot>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            requests,
            snapshots,
            events,
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever the state changes
    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshots.clone()
    }

    /// Receiver of session notifications
    pub fn events(&self) -> Result<broadcast::Receiver<PoolEvent>> {
        Ok(self.events.subscribe::<PoolEvent>()?)
    }

    /// Wait until the state satisfies `predicate`, returning that state
    pub async fn wait_until<F>(&self, predicate: F) -> Result<PoolSnapshot>
    where
        F: FnMut(&PoolSnapshot) -> bool,
    {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(predicate)
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(snapshot.clone())
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.requests.send(SessionRequest::Command(command)).await?;
        Ok(())
    }

    /// Send a line to the controller verbatim
    pub async fn send_raw<S: Into<String>>(&self, line: S) -> Result<()> {
        self.command(Command::SendRaw(line.into())).await
    }

    /// Query water then air temperature
    pub async fn fetch_temperatures(&self) -> Result<()> {
        self.command(Command::FetchTemperatures).await
    }

    /// Query the pump mode
    pub async fn fetch_pump_mode(&self) -> Result<()> {
        self.command(Command::FetchPumpMode).await
    }

    /// Change the pump mode
    pub async fn set_pump_mode(&self, mode: PumpMode) -> Result<()> {
        self.command(Command::SetPumpMode(mode)).await
    }

    /// Query one slot (0..=5)
    pub async fn fetch_time_slot(&self, index: usize) -> Result<()> {
        self.command(Command::FetchTimeSlot(slot_index(index)?)).await
    }

    /// Query all six slots
    pub async fn fetch_all_time_slots(&self) -> Result<()> {
        self.command(Command::FetchAllTimeSlots).await
    }

    /// Add an hour to a slot (0..=5)
    pub async fn increment_time_slot(&self, index: usize) -> Result<()> {
        self.command(Command::IncrementTimeSlot(slot_index(index)?)).await
    }

    /// Remove an hour from a slot (0..=5)
    pub async fn decrement_time_slot(&self, index: usize) -> Result<()> {
        self.command(Command::DecrementTimeSlot(slot_index(index)?)).await
    }

    /// Query the fault flags
    pub async fn fetch_errors(&self) -> Result<()> {
        self.command(Command::FetchErrors).await
    }

    /// Start a discovery scan; no-op while one is running
    pub async fn start_discovery(&self) -> Result<()> {
        self.command(Command::StartDiscovery).await
    }

    /// Stop the running scan
    pub async fn stop_discovery(&self) -> Result<()> {
        self.command(Command::StopDiscovery).await
    }

    /// Probe one address with the direct-test timeouts.
    ///
    /// A controller found this way joins the discovered set.
    pub async fn test_address(&self, address: DeviceAddress) -> Result<bool> {
        let (reply, found) = oneshot::channel();
        self.requests
            .send(SessionRequest::TestAddress(address, reply))
            .await?;
        Ok(found.await?)
    }

    /// Pair with a controller and connect to it
    pub async fn pair(&self, address: DeviceAddress) -> Result<()> {
        self.command(Command::Pair(address)).await
    }

    /// Forget the paired controller and disconnect
    pub async fn unpair(&self) -> Result<()> {
        self.command(Command::Unpair).await
    }

    /// Re-run the initial query sequence
    pub async fn force_refresh(&self) -> Result<()> {
        self.command(Command::ForceRefresh).await
    }

    /// Stop the session, closing the socket and cancelling every timer
    pub async fn shutdown(&self) -> Result<()> {
        let (done, stopped) = oneshot::channel();
        self.requests.send(SessionRequest::Shutdown(done)).await?;
        Ok(stopped.await?)
    }
}

fn slot_index(index: usize) -> Result<SlotIndex> {
    SlotIndex::new(index).ok_or(Error::Device(DeviceError::InvalidSlot(index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (PoolClient, mpsc::Receiver<SessionRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let (_snapshots, snapshot_rx) = watch::channel(PoolSnapshot::default());
        (PoolClient::new(tx, snapshot_rx, SharedEventBus::new()), rx)
    }

    #[tokio::test]
    async fn test_invalid_slot_rejected_before_queueing() {
        let (client, mut rx) = client();
        let result = client.increment_time_slot(6).await;
        assert!(matches!(
            result,
            Err(Error::Device(DeviceError::InvalidSlot(6)))
        ));
        assert!(rx.try_recv().is_err());

        client.fetch_time_slot(5).await.unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionRequest::Command(Command::FetchTimeSlot(_)))
        ));
    }

    #[tokio::test]
    async fn test_closed_session() {
        let (client, rx) = client();
        drop(rx);
        assert!(matches!(client.fetch_errors().await, Err(Error::SessionClosed)));
        assert!(matches!(
            client.test_address(DeviceAddress::new(10, 0, 0, 5)).await,
            Err(Error::SessionClosed)
        ));
    }
}
