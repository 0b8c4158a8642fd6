/*!
 * Peripheral discovery for withub.
 *
 * The scan orchestrator filters advertisements by name, reserves registry
 * slots and launches one connect workflow per newly claimed peripheral. The
 * discovery handler itself never waits on a connection.
 */
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use withub_core::config::BleConfig;
use withub_core::logging::component_span;

use crate::connect::ConnectWorkflow;
use crate::device::{DeviceError, DeviceState};
use crate::radio::DiscoveryEvent;
use crate::registry::Reservation;

/// What a single advertisement led to
#[derive(Debug)]
pub enum DiscoveryOutcome {
    /// The advertised name does not match
    Ignored,
    /// The peripheral already has an entry
    Duplicate(DeviceState),
    /// A connect workflow was launched; the handle resolves to its final state
    Launched(JoinHandle<DeviceState>),
    /// The registry refused the peripheral
    Rejected(DeviceError),
}

/// Scan driver settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    /// How long one scan window lasts
    pub window: Duration,
    /// Pause between two windows
    pub interval: Duration,
    /// Whether failed entries are evicted before each window
    pub evict_failed: bool,
}

impl From<&BleConfig> for ScanSchedule {
    fn from(config: &BleConfig) -> Self {
        Self {
            window: config.scan_window(),
            interval: config.scan_interval(),
            evict_failed: config.evict_failed_on_scan,
        }
    }
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self::from(&BleConfig::default())
    }
}

/// Turns advertisements into connect workflows
#[derive(Debug)]
pub struct ScanOrchestrator {
    target_name: String,
    workflow: Arc<ConnectWorkflow>,
    runtime: Handle,
}

impl ScanOrchestrator {
    /// Create an orchestrator for peripherals advertising `target_name`
    ///
    /// Must be called from within a tokio runtime, workflows are spawned on it.
    pub fn new<S: Into<String>>(target_name: S, workflow: Arc<ConnectWorkflow>) -> Self {
        Self::with_runtime(target_name, workflow, Handle::current())
    }

    /// Create an orchestrator spawning workflows on `runtime`
    pub fn with_runtime<S: Into<String>>(
        target_name: S,
        workflow: Arc<ConnectWorkflow>,
        runtime: Handle,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            workflow,
            runtime,
        }
    }

    /// Name advertisements must carry to be considered
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Handle one advertisement
    ///
    /// Returns immediately. A launched workflow runs on its own task; drop
    /// the returned handle to detach it.
    pub fn on_discovery(&self, event: &DiscoveryEvent) -> DiscoveryOutcome {
        if event.name.as_deref() != Some(self.target_name.as_str()) {
            return DiscoveryOutcome::Ignored;
        }

        let address = event.address;
        match self.workflow.registry().reserve_or_get(address) {
            Ok(Reservation::Claimed) => {
                info!(
                    "Discovered {} at {} (rssi {:?})",
                    self.target_name, address, event.rssi
                );
                let workflow = self.workflow.clone();
                let handle = self
                    .runtime
                    .spawn(async move { workflow.run(address).await });
                DiscoveryOutcome::Launched(handle)
            }
            Ok(Reservation::Existing(state)) => {
                debug!("Ignoring {} ({})", address, state);
                DiscoveryOutcome::Duplicate(state)
            }
            Err(e) => {
                warn!("Not connecting to {}: {}", address, e);
                DiscoveryOutcome::Rejected(e)
            }
        }
    }

    /// Run one scan window, handling advertisements as they arrive
    ///
    /// Returns the workflows launched during the window.
    pub async fn scan_once(&self, window: Duration) -> Vec<JoinHandle<DeviceState>> {
        let (tx, mut rx) = mpsc::channel(32);
        let radio = self.workflow.radio().clone();
        let mut launched = Vec::new();

        let scan = radio.scan(window, tx);
        let consume = async {
            while let Some(event) = rx.recv().await {
                if let DiscoveryOutcome::Launched(handle) = self.on_discovery(&event) {
                    launched.push(handle);
                }
            }
        };

        let (result, ()) = tokio::join!(scan, consume);
        if let Err(e) = result {
            warn!("Scan window failed: {}", e);
        }
        launched
    }

    /// Scan periodically until the returned future is dropped
    ///
    /// Launched workflows are detached and run to completion on their own.
    pub async fn run(&self, schedule: ScanSchedule) {
        let span = component_span("scan");
        async {
            info!(
                "Scanning for {} every {:?} ({:?} windows)",
                self.target_name, schedule.interval, schedule.window
            );
            loop {
                if schedule.evict_failed {
                    if let Err(e) = self.workflow.registry().evict_failed() {
                        warn!("Could not evict failed devices: {}", e);
                    }
                }

                let launched = self.scan_once(schedule.window).await;
                if !launched.is_empty() {
                    debug!("Scan window launched {} workflow(s)", launched.len());
                }

                tokio::time::sleep(schedule.interval).await;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use withub_core::types::DeviceAddress;

    use crate::registry::DeviceRegistry;
    use crate::testing::{FakeRadio, PeripheralBehavior, RecordingSink};

    const TARGET: &str = "WT901BLE67";

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, last])
    }

    fn sighting(last: u8) -> DiscoveryEvent {
        DiscoveryEvent::new(Some(TARGET), addr(last)).with_rssi(-60)
    }

    fn orchestrator(radio: Arc<FakeRadio>, capacity: usize) -> ScanOrchestrator {
        let registry = Arc::new(DeviceRegistry::new(capacity));
        let sink = Arc::new(RecordingSink::new());
        let workflow = Arc::new(ConnectWorkflow::new(radio, registry, sink));
        ScanOrchestrator::new(TARGET, workflow)
    }

    #[tokio::test]
    async fn test_name_filter() {
        let radio = Arc::new(FakeRadio::new());
        let scanner = orchestrator(radio.clone(), 12);

        let other = DiscoveryEvent::new(Some("WT901BLE68"), addr(1));
        assert!(matches!(scanner.on_discovery(&other), DiscoveryOutcome::Ignored));
        let unnamed = DiscoveryEvent::new(None::<String>, addr(1));
        assert!(matches!(scanner.on_discovery(&unnamed), DiscoveryOutcome::Ignored));

        assert!(scanner.workflow.registry().is_empty());
        assert_eq!(radio.connect_calls(addr(1)), 0);
    }

    #[tokio::test]
    async fn test_discovery_launches_workflow() {
        let radio = Arc::new(FakeRadio::new().with_peripheral(addr(1), PeripheralBehavior::default()));
        let scanner = orchestrator(radio.clone(), 12);

        let handle = match scanner.on_discovery(&sighting(1)) {
            DiscoveryOutcome::Launched(handle) => handle,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(handle.await.unwrap(), DeviceState::Ready);
        assert_eq!(radio.connect_calls(addr(1)), 1);

        assert!(matches!(
            scanner.on_discovery(&sighting(1)),
            DiscoveryOutcome::Duplicate(DeviceState::Ready)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sightings_connect_once() {
        let radio = Arc::new(FakeRadio::new().with_peripheral(
            addr(1),
            PeripheralBehavior {
                connect_delay: Duration::from_secs(2),
                ..Default::default()
            },
        ));
        let scanner = orchestrator(radio.clone(), 12);

        let first = scanner.on_discovery(&sighting(1));
        let second = scanner.on_discovery(&sighting(1));
        let third = scanner.on_discovery(&sighting(1));

        assert!(matches!(second, DiscoveryOutcome::Duplicate(DeviceState::Connecting)));
        assert!(matches!(third, DiscoveryOutcome::Duplicate(DeviceState::Connecting)));
        match first {
            DiscoveryOutcome::Launched(handle) => {
                assert_eq!(handle.await.unwrap(), DeviceState::Ready)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(radio.connect_calls(addr(1)), 1);
    }

    #[tokio::test]
    async fn test_capacity_rejects_extra_devices() {
        let radio = Arc::new(FakeRadio::new());
        for i in 0..13 {
            radio.set_behavior(addr(i), PeripheralBehavior::default());
        }
        let scanner = orchestrator(radio.clone(), 12);

        let mut handles = Vec::new();
        for i in 0..12 {
            match scanner.on_discovery(&sighting(i)) {
                DiscoveryOutcome::Launched(handle) => handles.push(handle),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(matches!(
            scanner.on_discovery(&sighting(12)),
            DiscoveryOutcome::Rejected(DeviceError::CapacityExceeded { capacity: 12 })
        ));

        for handle in handles {
            assert_eq!(handle.await.unwrap(), DeviceState::Ready);
        }
        assert_eq!(scanner.workflow.registry().len(), 12);
        assert_eq!(radio.connect_calls(addr(12)), 0);
    }

    #[tokio::test]
    async fn test_failed_device_relaunched_on_next_sighting() {
        let radio = Arc::new(FakeRadio::new().with_peripheral(
            addr(1),
            PeripheralBehavior {
                connect_failures: 1,
                ..Default::default()
            },
        ));
        let scanner = orchestrator(radio.clone(), 12);

        match scanner.on_discovery(&sighting(1)) {
            DiscoveryOutcome::Launched(handle) => {
                assert_eq!(handle.await.unwrap(), DeviceState::Failed)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(radio.connect_calls(addr(1)), 1);

        // the workflow gave up, the next sighting starts a new one
        match scanner.on_discovery(&sighting(1)) {
            DiscoveryOutcome::Launched(handle) => {
                assert_eq!(handle.await.unwrap(), DeviceState::Ready)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(radio.connect_calls(addr(1)), 2);
        assert!(scanner.workflow.registry().find(addr(1)).unwrap().last_error.is_none());

        assert!(matches!(
            scanner.on_discovery(&sighting(1)),
            DiscoveryOutcome::Duplicate(DeviceState::Ready)
        ));
        assert_eq!(radio.connect_calls(addr(1)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_once_consumes_window() {
        let radio = Arc::new(
            FakeRadio::new()
                .with_peripheral(addr(1), PeripheralBehavior::default())
                .with_peripheral(addr(2), PeripheralBehavior::default()),
        );
        radio.queue_scan(vec![
            sighting(1),
            DiscoveryEvent::new(Some("Other"), addr(3)),
            sighting(2),
            sighting(1),
        ]);
        let scanner = orchestrator(radio.clone(), 12);

        let launched = scanner.scan_once(Duration::from_secs(5)).await;
        assert_eq!(launched.len(), 2);
        for handle in launched {
            assert_eq!(handle.await.unwrap(), DeviceState::Ready);
        }
        assert_eq!(radio.scan_count(), 1);
        assert_eq!(radio.connect_calls(addr(3)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_evicts_failed_between_windows() {
        let radio = Arc::new(FakeRadio::new().with_peripheral(addr(1), PeripheralBehavior::unreachable()));
        radio.queue_scan(vec![sighting(1)]);
        let scanner = Arc::new(orchestrator(radio.clone(), 1));
        let registry = scanner.workflow.registry().clone();

        let schedule = ScanSchedule {
            window: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            evict_failed: true,
        };
        let runner = scanner.clone();
        let task = tokio::spawn(async move { runner.run(schedule).await });

        // first window at t = 0 claims the only slot and fails
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.find(addr(1)).unwrap().state, DeviceState::Failed);

        // second window at t = 2 evicts it
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.is_empty());
        assert!(radio.scan_count() >= 2);

        task.abort();
    }
}
