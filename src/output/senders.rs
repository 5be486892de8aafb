use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::formatters::TelegramEncoder;
use super::telegram::TelegramSpec;
use crate::devices::Measurement;
use crate::modbus::{RegisterAssignment, RegisterStore};
use crate::services::connections::{ClientHandle, ClientId, ConnectionManager};
use crate::utils::error::SimulationError;

/// Outcome of one register batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Addresses written, in write order.
    pub written: Vec<u16>,
    pub skipped: usize,
}

/// Outcome of one telegram broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ClientId>,
    pub failed: Vec<ClientId>,
}

/// Totals a sink consumer reports when its queue closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub batches: u64,
    pub failures: u64,
}

/// Rounds a measurement to the nearest value a 16-bit register can hold.
pub fn to_register_value(value: f64) -> Result<u16, SimulationError> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 0.0 || rounded > f64::from(u16::MAX) {
        return Err(SimulationError::ValueOutOfRange(value));
    }
    Ok(rounded as u16)
}

pub struct RegisterSink {
    assignment: RegisterAssignment,
    store: Arc<dyn RegisterStore>,
}

impl RegisterSink {
    pub fn new(assignment: RegisterAssignment, store: Arc<dyn RegisterStore>) -> Self {
        Self { assignment, store }
    }

    pub fn assignment(&self) -> &RegisterAssignment {
        &self.assignment
    }

    /// Writes a batch in ascending address order. A rejected measurement is
    /// logged and skipped; the rest of the batch is still written.
    pub async fn write(&self, batch: &[Measurement]) -> WriteReport {
        let mut report = WriteReport::default();

        let mut resolved: Vec<(u16, &Measurement)> = Vec::with_capacity(batch.len());
        for measurement in batch {
            match self.assignment.address_of(measurement.sensor_id) {
                Some(address) => resolved.push((address, measurement)),
                None => {
                    warn!("⚠️  No holding register assigned to sensor {}", measurement.sensor_id);
                    report.skipped += 1;
                }
            }
        }
        resolved.sort_by_key(|(address, _)| *address);

        for (address, measurement) in resolved {
            let result = match to_register_value(measurement.value) {
                Ok(value) => self.store.write_holding_register(address, value).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.written.push(address),
                Err(e) if e.is_transient() => {
                    warn!("❌ Skipped HR[{}] for {}: {}", address, measurement.sensor_id, e);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("❌ Register store rejected HR[{}]: {}", address, e);
                    report.skipped += 1;
                }
            }
        }

        debug!(
            "📝 Register batch: {} written, {} skipped",
            report.written.len(),
            report.skipped
        );
        report
    }

    /// Drains register batches until the producer closes the queue.
    pub async fn run(self, mut queue: mpsc::Receiver<Vec<Measurement>>) -> SinkStats {
        let mut stats = SinkStats::default();
        while let Some(batch) = queue.recv().await {
            let report = self.write(&batch).await;
            stats.batches += 1;
            stats.failures += report.skipped as u64;
        }
        info!(
            "✅ Register sink drained: {} batches, {} skipped writes",
            stats.batches, stats.failures
        );
        stats
    }
}

pub struct TelegramSink {
    spec: TelegramSpec,
    encoder: Arc<dyn TelegramEncoder>,
    clients: ConnectionManager,
}

impl TelegramSink {
    pub fn new(spec: TelegramSpec, encoder: Arc<dyn TelegramEncoder>, clients: ConnectionManager) -> Self {
        Self {
            spec,
            encoder,
            clients,
        }
    }

    pub fn spec(&self) -> &TelegramSpec {
        &self.spec
    }

    /// Sends one encoded measurement to every client connected right now.
    /// Clients that connect after this call starts get nothing from it.
    pub async fn broadcast(&self, measurement: &Measurement) -> BroadcastReport {
        let targets = self.clients.broadcast_targets().await;
        self.broadcast_to(targets, measurement).await
    }

    /// Delivers to a fixed set of targets. Each delivery is independent; a
    /// failing client is dropped by the connection manager without affecting
    /// the others.
    pub async fn broadcast_to(&self, targets: Vec<ClientHandle>, measurement: &Measurement) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if targets.is_empty() {
            debug!("📭 No telegram clients for tick {}", measurement.tick);
            return report;
        }

        let fields = self.spec.fields(measurement.value);
        let frame = match self.encoder.encode(self.spec.talker, self.spec.kind, &fields) {
            Ok(frame) => frame,
            Err(e) => {
                error!("❌ Failed to encode {}: {}", measurement, e);
                return report;
            }
        };

        let mut deliveries = JoinSet::new();
        for target in targets {
            let clients = self.clients.clone();
            let frame = frame.clone();
            deliveries.spawn(async move {
                let delivered = clients.send(&target, frame).await.is_ok();
                (target.id, delivered)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((id, true)) => report.delivered.push(id),
                Ok((id, false)) => report.failed.push(id),
                Err(e) => warn!("Telegram delivery task failed: {}", e),
            }
        }
        report.delivered.sort();
        report.failed.sort();

        debug!(
            "📤 {} -> {} clients ({} failed)",
            String::from_utf8_lossy(&frame).trim_end(),
            report.delivered.len(),
            report.failed.len()
        );
        report
    }

    /// Drains telegram measurements until the producer closes the queue.
    pub async fn run(self, mut queue: mpsc::Receiver<Measurement>) -> SinkStats {
        let mut stats = SinkStats::default();
        while let Some(measurement) = queue.recv().await {
            let report = self.broadcast(&measurement).await;
            stats.batches += 1;
            stats.failures += report.failed.len() as u64;
        }
        info!(
            "✅ Telegram sink drained: {} broadcasts, {} failed deliveries",
            stats.batches, stats.failures
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{SensorId, SensorKind};
    use crate::modbus::HoldingRegisterBank;
    use crate::output::formatters::{parse_sentence, NmeaEncoder};
    use crate::output::telegram::{SentenceKind, TalkerId};
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::sync::Mutex;

    fn measurement(id: u16, kind: SensorKind, value: f64) -> Measurement {
        Measurement {
            sensor_id: SensorId(id),
            kind,
            value,
            tick: 1,
            timestamp: Instant::now(),
        }
    }

    /// Records writes and rejects one configured address.
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(u16, u16)>>,
        reject: Option<u16>,
    }

    #[async_trait]
    impl RegisterStore for RecordingStore {
        async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), SimulationError> {
            if self.reject == Some(address) {
                return Err(SimulationError::IllegalAddress(address));
            }
            self.writes.lock().await.push((address, value));
            Ok(())
        }
    }

    #[test]
    fn test_register_value_conversion() {
        assert_eq!(to_register_value(41.6).unwrap(), 42);
        assert_eq!(to_register_value(0.0).unwrap(), 0);
        assert_eq!(to_register_value(65535.0).unwrap(), u16::MAX);
        assert!(to_register_value(-1.0).is_err());
        assert!(to_register_value(70000.0).is_err());
        assert!(to_register_value(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_writes_are_address_ordered() {
        let store = Arc::new(RecordingStore::default());
        let ids = [SensorId(0), SensorId(1), SensorId(2)];
        let sink = RegisterSink::new(RegisterAssignment::contiguous(0, &ids).unwrap(), store.clone());

        let batch = vec![
            measurement(2, SensorKind::Temperature, 30.0),
            measurement(0, SensorKind::Temperature, 10.0),
            measurement(1, SensorKind::Temperature, 20.0),
        ];
        let report = sink.write(&batch).await;

        assert_eq!(report.written, vec![0, 1, 2]);
        assert_eq!(*store.writes.lock().await, vec![(0, 10), (1, 20), (2, 30)]);
    }

    #[tokio::test]
    async fn test_rejected_write_does_not_block_batch() {
        let store = Arc::new(RecordingStore {
            reject: Some(1),
            ..Default::default()
        });
        let ids = [SensorId(0), SensorId(1), SensorId(2)];
        let sink = RegisterSink::new(RegisterAssignment::contiguous(0, &ids).unwrap(), store.clone());

        let batch = vec![
            measurement(0, SensorKind::Temperature, 10.0),
            measurement(1, SensorKind::Temperature, 20.0),
            measurement(2, SensorKind::Temperature, 30.0),
            measurement(7, SensorKind::Temperature, 70.0),
        ];
        let report = sink.write(&batch).await;

        assert_eq!(report.written, vec![0, 2]);
        assert_eq!(report.skipped, 2);
        assert_eq!(*store.writes.lock().await, vec![(0, 10), (2, 30)]);
    }

    #[tokio::test]
    async fn test_register_consumer_drains_queue() {
        let bank = Arc::new(HoldingRegisterBank::new(4));
        let ids = [SensorId(0), SensorId(1)];
        let sink = RegisterSink::new(RegisterAssignment::contiguous(2, &ids).unwrap(), bank.clone());

        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![measurement(0, SensorKind::Temperature, 5.0)]).await.unwrap();
        tx.send(vec![measurement(1, SensorKind::Temperature, 6.0)]).await.unwrap();
        drop(tx);

        let stats = sink.run(rx).await;
        assert_eq!(stats, SinkStats { batches: 2, failures: 0 });
        assert_eq!(bank.read_holding_registers(0, 4).await.unwrap(), vec![0, 0, 5, 6]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let clients = ConnectionManager::new(3, Duration::from_secs(1));
        let (a, a_peer) = duplex(256);
        let (b, b_peer) = duplex(256);
        let first = clients.attach("a", a).await.unwrap();
        let second = clients.attach("b", b).await.unwrap();

        let spec = TelegramSpec::new(TalkerId::parse("MG").unwrap(), SentenceKind::Rot, 1);
        let sink = TelegramSink::new(spec, Arc::new(NmeaEncoder), clients.clone());
        let report = sink.broadcast(&measurement(4, SensorKind::AngularRate, 12.34)).await;

        assert_eq!(report.delivered, vec![first, second]);
        assert!(report.failed.is_empty());

        for peer in [a_peer, b_peer] {
            let mut line = String::new();
            BufReader::new(peer).read_line(&mut line).await.unwrap();
            let sentence = parse_sentence(&line).unwrap();
            assert_eq!(sentence.talker, "MG");
            assert_eq!(sentence.fields, vec!["12.3", "A"]);
        }
    }

    #[tokio::test]
    async fn test_late_client_misses_running_broadcast() {
        let clients = ConnectionManager::new(3, Duration::from_secs(1));
        let (early, early_peer) = duplex(256);
        let early_id = clients.attach("early", early).await.unwrap();

        let spec = TelegramSpec::new(TalkerId::parse("MG").unwrap(), SentenceKind::Rot, 1);
        let sink = TelegramSink::new(spec, Arc::new(NmeaEncoder), clients.clone());

        let targets = clients.broadcast_targets().await;
        let (late, mut late_peer) = duplex(256);
        let late_id = clients.attach("late", late).await.unwrap();

        let report = sink
            .broadcast_to(targets, &measurement(4, SensorKind::AngularRate, 7.0))
            .await;
        assert_eq!(report.delivered, vec![early_id]);
        assert!(!report.delivered.contains(&late_id));

        let mut line = String::new();
        BufReader::new(early_peer).read_line(&mut line).await.unwrap();
        assert_eq!(parse_sentence(&line).unwrap().fields, vec!["7.0", "A"]);

        let mut buf = [0u8; 16];
        let nothing = tokio::time::timeout(Duration::from_millis(100), late_peer.read(&mut buf)).await;
        assert!(nothing.is_err(), "late client received bytes");
        assert_eq!(clients.client_stats().await[1].messages_sent, 0);
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_is_noop() {
        let clients = ConnectionManager::new(3, Duration::from_secs(1));
        let spec = TelegramSpec::new(TalkerId::parse("MG").unwrap(), SentenceKind::Rot, 1);
        let sink = TelegramSink::new(spec, Arc::new(NmeaEncoder), clients);
        let report = sink.broadcast(&measurement(4, SensorKind::AngularRate, 1.0)).await;
        assert_eq!(report, BroadcastReport::default());
    }
}
