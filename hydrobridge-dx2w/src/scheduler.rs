//! Per-group polling.
//!
//! Every poll group gets its own task and its own ticker, so a slow group (or
//! one stuck behind a reconnect) never delays another group's cadence.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::catalog::RegisterCatalog;
use crate::client::RegisterReader;
use crate::connection::stopped;
use crate::error::Dx2wError;
use crate::history::HistoryStore;
use crate::snapshot::SnapshotPersister;

/// What every group task needs.
struct PollContext<R> {
    reader: Arc<R>,
    detector: Arc<AnomalyDetector>,
    store: Arc<HistoryStore>,
}

/// A named set of registers sharing one cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollGroup {
    pub name: String,
    pub interval: Duration,
    pub members: Vec<String>,
}

/// Runs one polling loop per register group and the snapshot timer.
pub struct GroupScheduler<R: RegisterReader> {
    context: Arc<PollContext<R>>,
    groups: Vec<PollGroup>,
    persister: Option<SnapshotPersister>,
}

impl<R: RegisterReader> GroupScheduler<R> {
    /// Create a scheduler for every group in `catalog`, resolving each
    /// group's cadence with `interval_for` (see
    /// [`Dx2wBridgeConfig::group_interval`](crate::config::Dx2wBridgeConfig::group_interval)).
    pub fn new(
        reader: Arc<R>,
        catalog: &RegisterCatalog,
        detector: Arc<AnomalyDetector>,
        store: Arc<HistoryStore>,
        interval_for: impl Fn(&str) -> Duration,
    ) -> Self {
        let groups = catalog
            .groups()
            .into_iter()
            .map(|(name, members)| PollGroup {
                interval: interval_for(&name),
                name,
                members,
            })
            .collect();

        Self {
            context: Arc::new(PollContext {
                reader,
                detector,
                store,
            }),
            groups,
            persister: None,
        }
    }

    /// Save snapshots on the persister's interval and once at shutdown.
    pub fn with_persister(mut self, persister: SnapshotPersister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Groups in name order, with their resolved intervals.
    pub fn groups(&self) -> &[PollGroup] {
        &self.groups
    }

    /// Run until `true` is sent on `shutdown`.
    ///
    /// Returns after every group has finished its in-flight poll and the final
    /// snapshot has been written.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        for group in &self.groups {
            info!(
                "Starting poll group '{}' ({} register(s), interval: {}s)",
                group.name,
                group.members.len(),
                group.interval.as_secs()
            );

            let context = self.context.clone();
            let task = tokio::spawn(run_group(
                context,
                group.name.clone(),
                group.members.clone(),
                group.interval,
                shutdown.clone(),
            ));
            tasks.push((group.name.clone(), task));
        }

        if let Some(persister) = &self.persister {
            let task = tokio::spawn(
                persister
                    .clone()
                    .run(self.context.store.clone(), shutdown.clone()),
            );
            tasks.push(("snapshot".to_string(), task));
        }

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!("Task '{}' ended abnormally: {}", name, e);
            }
        }

        if let Some(persister) = &self.persister {
            info!("Writing final history snapshot");
            persister.save_in_background(&self.context.store).await;
        }

        info!("Scheduler stopped");
    }
}

async fn run_group<R: RegisterReader>(
    context: Arc<PollContext<R>>,
    group: String,
    members: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick completes immediately: poll on start.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let recorded = poll_registers(&context, &group, &members, &shutdown).await;
        debug!(group = %group, recorded, "Poll complete");
    }

    debug!(group = %group, "Poll group stopped");
}

/// Poll `members` in order, recording every result. Returns the number of
/// entries appended; stops early once shutdown is signalled.
async fn poll_registers<R: RegisterReader>(
    context: &PollContext<R>,
    group: &str,
    members: &[String],
    shutdown: &watch::Receiver<bool>,
) -> usize {
    let mut recorded = 0;

    for name in members {
        if *shutdown.borrow() {
            debug!(group = %group, "Shutdown requested, abandoning poll");
            break;
        }

        let reading = context.reader.read_value(name).await;
        let now = Utc::now();

        let reading = reading.and_then(|value| {
            context
                .detector
                .validate(name, value, &context.store, now)
                .map(|()| value)
        });

        match &reading {
            Ok(value) => debug!(register = %name, %value, "Read register"),
            Err(e @ Dx2wError::Validation(_)) => warn!(register = %name, error = %e, "Rejected reading"),
            Err(e) => warn!(register = %name, error = %e, "Register read failed"),
        }

        context.store.append(name, now, reading);
        recorded += 1;
    }

    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::ValidityRule;
    use crate::catalog::{DEFAULT_GROUP, RegisterDefinition, WireType};
    use crate::error::Result;
    use hydrobridge_common::{Format, Value};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use tempfile::TempDir;

    /// Scripted reader: queued values per register, optional per-register
    /// delay, optional shutdown trigger.
    #[derive(Default)]
    struct FakeReader {
        values: Mutex<HashMap<String, VecDeque<Value>>>,
        delays: HashMap<String, Duration>,
        reads: Mutex<Vec<String>>,
        trigger: Option<(String, watch::Sender<bool>)>,
    }

    impl FakeReader {
        fn push(&self, name: &str, value: Value) {
            self.values
                .lock()
                .entry(name.to_string())
                .or_default()
                .push_back(value);
        }

        fn reads_of(&self, name: &str) -> usize {
            self.reads.lock().iter().filter(|r| *r == name).count()
        }
    }

    impl RegisterReader for FakeReader {
        async fn read_value(&self, name: &str) -> Result<Value> {
            self.reads.lock().push(name.to_string());

            if let Some(delay) = self.delays.get(name).copied() {
                tokio::time::sleep(delay).await;
            }

            if let Some((trigger, tx)) = &self.trigger {
                if trigger == name {
                    let _ = tx.send(true);
                }
            }

            let next = {
                let mut values = self.values.lock();
                values.get_mut(name).and_then(|queue| {
                    if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().copied()
                    }
                })
            };
            next.ok_or_else(|| Dx2wError::Connection("no response".to_string()))
        }
    }

    fn catalog() -> RegisterCatalog {
        RegisterCatalog::from_definitions([
            RegisterDefinition::new("fast_reg", 1, WireType::Uint16).in_group("fast"),
            RegisterDefinition::new("slow_reg", 2, WireType::Uint16).in_group("slow"),
        ])
    }

    fn interval_for(group: &str) -> Duration {
        match group {
            "fast" => Duration::from_secs(1),
            "slow" => Duration::from_secs(5),
            _ => Duration::from_secs(60),
        }
    }

    fn scheduler(reader: Arc<FakeReader>, catalog: &RegisterCatalog) -> GroupScheduler<FakeReader> {
        GroupScheduler::new(
            reader,
            catalog,
            Arc::new(AnomalyDetector::from_catalog(catalog)),
            Arc::new(HistoryStore::new()),
            interval_for,
        )
    }

    #[test]
    fn test_groups_resolved_at_construction() {
        let catalog = RegisterCatalog::from_definitions([
            RegisterDefinition::new("fast_reg", 1, WireType::Uint16).in_group("fast"),
            RegisterDefinition::new("other_reg", 2, WireType::Uint16),
        ]);
        let s = scheduler(Arc::new(FakeReader::default()), &catalog);

        let groups: Vec<_> = s
            .groups()
            .iter()
            .map(|g| (g.name.as_str(), g.interval.as_secs(), g.members.len()))
            .collect();
        assert_eq!(groups, vec![(DEFAULT_GROUP, 60, 1), ("fast", 1, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_cadence_independence() {
        let mut reader = FakeReader::default();
        reader
            .delays
            .insert("slow_reg".to_string(), Duration::from_secs(3));
        let reader = Arc::new(reader);
        reader.push("fast_reg", Value::Numeric(1.0));
        reader.push("slow_reg", Value::Numeric(2.0));

        let catalog = catalog();
        let s = scheduler(reader.clone(), &catalog);
        let store = s.context.store.clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));

        tokio::time::sleep(Duration::from_millis(10_500)).await;

        // Fast group polled at t=0..=10 despite the slow group's 3s reads
        assert_eq!(reader.reads_of("fast_reg"), 11);
        // Slow group started reads at t=0, 5, 10
        assert_eq!(reader.reads_of("slow_reg"), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.list_all("fast_reg").len(), 11);
        assert_eq!(store.list_all("slow_reg").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reading_is_carried_forward() {
        let catalog = RegisterCatalog::from_definitions([RegisterDefinition::new(
            "supply_temp",
            1,
            WireType::Int16,
        )
        .in_group("fast")
        .with_validation(ValidityRule::water_temperature())]);

        let reader = Arc::new(FakeReader::default());
        reader.push("supply_temp", Value::Numeric(35.0));
        reader.push("supply_temp", Value::Numeric(5.0));

        let s = scheduler(reader.clone(), &catalog);
        let store = s.context.store.clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let log = store.list_all("supply_temp");
        assert_eq!(log.len(), 2);
        assert!(log[0].is_ok());
        assert_eq!(log[1].value, Some(Value::Numeric(35.0)));
        assert!(log[1].error.as_deref().unwrap().contains("supply_temp"));
    }

    #[tokio::test]
    async fn test_read_failure_recorded_without_value() {
        let catalog = catalog();
        let reader = Arc::new(FakeReader::default());
        let s = scheduler(reader, &catalog);
        let (_tx, rx) = watch::channel(false);

        let recorded =
            poll_registers(&s.context, "fast", &["fast_reg".to_string()], &rx).await;

        assert_eq!(recorded, 1);
        let entry = s.context.store.latest("fast_reg").unwrap();
        assert_eq!(entry.value, None);
        assert!(entry.error.is_some());
    }

    #[tokio::test]
    async fn test_poll_stops_between_registers_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let reader = FakeReader {
            trigger: Some(("a".to_string(), tx)),
            ..Default::default()
        };
        let reader = Arc::new(reader);
        reader.push("a", Value::Numeric(1.0));
        reader.push("b", Value::Numeric(2.0));

        let catalog = RegisterCatalog::from_definitions([
            RegisterDefinition::new("a", 1, WireType::Uint16),
            RegisterDefinition::new("b", 2, WireType::Uint16),
        ]);
        let s = scheduler(reader.clone(), &catalog);
        let members = vec!["a".to_string(), "b".to_string()];

        let recorded = poll_registers(&s.context, DEFAULT_GROUP, &members, &rx).await;

        // "a" finishes and is recorded; "b" is never read
        assert_eq!(recorded, 1);
        assert_eq!(reader.reads_of("b"), 0);
        assert!(s.context.store.latest("a").unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_snapshot() {
        let dir = TempDir::new().unwrap();
        let persister = SnapshotPersister::new(
            dir.path().join("history.gz"),
            Format::Json,
            Duration::from_secs(900),
        );

        let catalog = catalog();
        let reader = Arc::new(FakeReader::default());
        reader.push("fast_reg", Value::Numeric(1.0));
        reader.push("slow_reg", Value::Numeric(2.0));

        let s = scheduler(reader, &catalog).with_persister(persister.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let history = persister.read().unwrap().unwrap();
        assert_eq!(history.len(), 2);
    }
}
