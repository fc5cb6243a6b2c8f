//! End-to-end session tests against the in-process controller simulator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use poolflow_core::config::Config;
use poolflow_core::event::{PoolEvent, ScanOutcome};
use poolflow_core::types::{DeviceAddress, LinkPhase, PumpMode, SlotIndex};
use poolflow_devices::pairing::{FilePairingStore, MemoryPairingStore};
use poolflow_devices::simulator::{SimulatedController, SimulatorConnector};
use poolflow_engine::{PoolClient, PoolService, PoolSnapshot};

const ADDRESS: DeviceAddress = DeviceAddress::new(10, 0, 0, 5);
const WAIT: Duration = Duration::from_secs(120);

fn config() -> Config {
    let mut config = Config::default();
    config.discovery.ranges = vec!["192.168.1".to_string()];
    config.discovery.scan_on_start = false;
    config
}

fn controller() -> SimulatedController {
    SimulatedController::new()
        .with_mode(PumpMode::Auto)
        .with_temperatures(24, 19)
        .with_slots([2, 4, 6, 8, 10, 12])
}

async fn start(
    config: Config,
    store: MemoryPairingStore,
    connector: &SimulatorConnector,
) -> PoolClient {
    PoolService::start(config, Arc::new(store), Arc::new(connector.clone()))
        .await
        .expect("session should start")
}

async fn wait_until<F>(client: &PoolClient, predicate: F) -> PoolSnapshot
where
    F: FnMut(&PoolSnapshot) -> bool,
{
    timeout(WAIT, client.wait_until(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("session closed")
}

async fn next_event<F>(events: &mut broadcast::Receiver<PoolEvent>, mut matches: F) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_round_trip_with_restored_pairing() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller().with_error_mask(0b0000100));

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    let snapshot = wait_until(&client, |s| s.connection.data_initialized).await;

    assert_eq!(snapshot.pump_mode, PumpMode::Auto);
    assert_eq!(snapshot.temperature.water, 24);
    assert_eq!(snapshot.temperature.air, 19);
    assert!(snapshot.error_flags.air_sensor_error);
    assert_eq!(snapshot.phase, LinkPhase::Ready);
    assert!(snapshot.connection.is_connected);
    assert!(snapshot.connection.is_paired);

    let snapshot = wait_until(&client, |s| s.time_slots.as_array() == &[2, 4, 6, 8, 10, 12]).await;
    assert!(snapshot.connection.data_initialized);
    assert_eq!(connector.connection_count(ADDRESS), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bare_slot_replies_are_correlated() {
    let connector = SimulatorConnector::new();
    // Bare replies carry hours only, so keep them to one digit
    connector.add(
        ADDRESS,
        controller()
            .with_slots([3, 1, 4, 1, 5, 9])
            .with_bare_slot_replies(),
    );

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    wait_until(&client, |s| s.time_slots.as_array() == &[3, 1, 4, 1, 5, 9]).await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_slot_does_not_block_the_rest() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller().ignoring("/slot/2"));

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    let snapshot = wait_until(&client, |s| s.time_slots.as_array()[5] == 12).await;
    assert_eq!(snapshot.time_slots.as_array(), &[2, 4, 0, 8, 10, 12]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_connection_loss() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    let mut events = client.events().unwrap();
    wait_until(&client, |s| s.connection.data_initialized).await;

    let dropped_at = tokio::time::Instant::now();
    connector.drop_connections(ADDRESS);

    let event = next_event(&mut events, |e| matches!(e, PoolEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        PoolEvent::Disconnected {
            address: ADDRESS,
            will_retry: true
        }
    );

    next_event(&mut events, |e| matches!(e, PoolEvent::Connected { .. })).await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(5));
    wait_until(&client, |s| s.connection.data_initialized).await;
    assert_eq!(connector.connection_count(ADDRESS), 2);

    // Exactly one reconnect: nothing else opens while the link is healthy
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.connection_count(ADDRESS), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_controller_is_reachable() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());
    connector.set_reachable(ADDRESS, false);

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    wait_until(&client, |s| s.phase == LinkPhase::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(connector.connection_count(ADDRESS), 0);
    assert!(!client.snapshot().connection.is_connected);

    connector.set_reachable(ADDRESS, true);
    wait_until(&client, |s| s.connection.data_initialized).await;
    assert_eq!(connector.connection_count(ADDRESS), 1);
}

#[tokio::test(start_paused = true)]
async fn test_commands_reach_the_controller() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    wait_until(&client, |s| s.time_slots.as_array()[5] == 12).await;

    client.set_pump_mode(PumpMode::On).await.unwrap();
    wait_until(&client, |s| s.pump_mode == PumpMode::On).await;
    assert_eq!(connector.controller(ADDRESS).unwrap().mode(), PumpMode::On);

    client.increment_time_slot(1).await.unwrap();
    client.decrement_time_slot(0).await.unwrap();
    let snapshot = wait_until(&client, |s| {
        s.time_slots.as_array()[1] == 5 && s.time_slots.as_array()[0] == 1
    })
    .await;
    assert_eq!(snapshot.time_slots.as_array()[2], 6);
    let slot = SlotIndex::new(1).unwrap();
    assert_eq!(connector.controller(ADDRESS).unwrap().slots().get(slot), 5);

    connector.update(ADDRESS, |c| c.set_water(27));
    client.fetch_temperatures().await.unwrap();
    let snapshot = wait_until(&client, |s| s.temperature.water == 27).await;
    assert_eq!(snapshot.temperature.trend, 3);

    client.send_raw("/temp/water").await.unwrap();
    assert!(client.increment_time_slot(9).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_reruns_initial_queries() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());

    let client = start(config(), MemoryPairingStore::with_address(ADDRESS), &connector).await;
    wait_until(&client, |s| s.connection.data_initialized).await;
    let mut events = client.events().unwrap();

    connector.update(ADDRESS, |c| c.set_water(30));
    client.force_refresh().await.unwrap();
    assert!(!wait_until(&client, |s| !s.connection.data_initialized)
        .await
        .connection
        .data_initialized);
    next_event(&mut events, |e| *e == PoolEvent::DataReady).await;

    let snapshot = client.snapshot();
    assert!(snapshot.connection.data_initialized);
    assert_eq!(snapshot.temperature.water, 30);
    assert_eq!(connector.connection_count(ADDRESS), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_discovery_on_first_run_with_auto_pair() {
    let found_at = DeviceAddress::new(192, 168, 1, 7);
    let connector = SimulatorConnector::new();
    connector.add(found_at, controller());

    let mut config = config();
    config.discovery.scan_on_start = true;
    config.discovery.auto_pair = true;

    let store = MemoryPairingStore::new();
    let client = start(config, store.clone(), &connector).await;

    let snapshot = wait_until(&client, |s| s.connection.data_initialized).await;
    assert_eq!(snapshot.paired_address, Some(found_at));
    assert_eq!(snapshot.discovered.len(), 1);
    assert!(!snapshot.connection.is_discovering);
    assert_eq!(store.peek(), Some(found_at));
}

#[tokio::test(start_paused = true)]
async fn test_manual_discovery_and_pairing() {
    let found_at = DeviceAddress::new(192, 168, 1, 110);
    let connector = SimulatorConnector::new();
    connector.add(found_at, controller());

    let store = MemoryPairingStore::new();
    let client = start(config(), store.clone(), &connector).await;
    let mut events = client.events().unwrap();
    assert_eq!(client.snapshot().phase, LinkPhase::Unpaired);

    client.start_discovery().await.unwrap();
    let finished =
        next_event(&mut events, |e| matches!(e, PoolEvent::DiscoveryFinished { .. })).await;
    assert_eq!(
        finished,
        PoolEvent::DiscoveryFinished {
            outcome: ScanOutcome::Found,
            found: 1
        }
    );

    let snapshot = client.snapshot();
    assert_eq!(snapshot.discovered[0].address, found_at);
    assert!(snapshot.paired_address.is_none());

    client.pair(found_at).await.unwrap();
    wait_until(&client, |s| s.connection.data_initialized).await;
    assert_eq!(store.peek(), Some(found_at));

    client.unpair().await.unwrap();
    let snapshot = wait_until(&client, |s| !s.connection.is_paired).await;
    assert!(!snapshot.connection.is_connected);
    assert_eq!(snapshot.phase, LinkPhase::Unpaired);
    assert_eq!(store.peek(), None);

    // No reconnect once unpaired
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(connector.connection_count(found_at), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discovery() {
    let connector = SimulatorConnector::new();
    for host in 1..=254 {
        connector.add_silent(DeviceAddress::new(192, 168, 1, host));
    }

    let client = start(config(), MemoryPairingStore::new(), &connector).await;
    let mut events = client.events().unwrap();

    client.start_discovery().await.unwrap();
    wait_until(&client, |s| s.discovery_progress.scanned > 0).await;
    client.stop_discovery().await.unwrap();

    let finished =
        next_event(&mut events, |e| matches!(e, PoolEvent::DiscoveryFinished { .. })).await;
    assert_eq!(
        finished,
        PoolEvent::DiscoveryFinished {
            outcome: ScanOutcome::Stopped,
            found: 0
        }
    );
    assert!(!client.snapshot().connection.is_discovering);
}

#[tokio::test(start_paused = true)]
async fn test_direct_address_test() {
    let connector = SimulatorConnector::new();
    let address = DeviceAddress::new(172, 16, 0, 9);
    connector.add(address, controller());

    let client = start(config(), MemoryPairingStore::new(), &connector).await;
    assert!(client.test_address(address).await.unwrap());
    assert!(!client
        .test_address(DeviceAddress::new(172, 16, 0, 10))
        .await
        .unwrap());

    let snapshot = wait_until(&client, |s| !s.discovered.is_empty()).await;
    assert_eq!(snapshot.discovered[0].address, address);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_survives_storage_failure() {
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());

    let client = start(config(), MemoryPairingStore::failing(), &connector).await;
    assert_eq!(client.snapshot().paired_address, None);

    client.pair(ADDRESS).await.unwrap();
    let snapshot = wait_until(&client, |s| s.connection.data_initialized).await;
    assert_eq!(snapshot.paired_address, Some(ADDRESS));
}

#[tokio::test(start_paused = true)]
async fn test_pairing_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pairing.json");
    let connector = SimulatorConnector::new();
    connector.add(ADDRESS, controller());

    let store = Arc::new(FilePairingStore::new(&path));
    let client = PoolService::start(config(), store.clone(), Arc::new(connector.clone()))
        .await
        .unwrap();
    tokio_test::assert_ok!(client.pair(ADDRESS).await);
    wait_until(&client, |s| s.connection.data_initialized).await;
    tokio_test::assert_ok!(client.shutdown().await);
    assert!(path.exists());

    let restarted = PoolService::start(config(), store, Arc::new(connector.clone()))
        .await
        .unwrap();
    let snapshot = wait_until(&restarted, |s| s.connection.data_initialized).await;
    assert_eq!(snapshot.paired_address, Some(ADDRESS));
    assert_eq!(connector.connection_count(ADDRESS), 2);

    tokio_test::assert_ok!(restarted.unpair().await);
    wait_until(&restarted, |s| !s.connection.is_paired).await;
    assert!(!path.exists());
}
