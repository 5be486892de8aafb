use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use super::connections::ConnectionManager;
use super::shutdown::{Shutdown, ShutdownTrigger};
use crate::config::SimulationConfig;
use crate::devices::{Measurement, MeasurementSource, SensorChannel, SensorKind};
use crate::modbus::{RegisterAssignment, RegisterStore};
use crate::output::{RegisterSink, SinkStats, TelegramEncoder, TelegramSink};
use crate::utils::error::SimulationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Splits one tick into the register batch and the telegram measurements.
/// Both halves are copies; a measurement may go to both sinks.
pub fn route(
    batch: &[Measurement],
    assignment: &RegisterAssignment,
    telegram_kind: SensorKind,
) -> (Vec<Measurement>, Vec<Measurement>) {
    let registers = batch
        .iter()
        .filter(|m| assignment.address_of(m.sensor_id).is_some())
        .copied()
        .collect();
    let telegrams = batch.iter().filter(|m| m.kind == telegram_kind).copied().collect();
    (registers, telegrams)
}

/// What the tick loop handed off, and what it had to drop on full queues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub ticks: u64,
    pub dropped_batches: u64,
    pub dropped_telegrams: u64,
}

/// Everything spawned by `start`, joined or aborted by `stop`.
struct RunningTasks {
    trigger: ShutdownTrigger,
    ticker: JoinHandle<DispatchStats>,
    acceptor: JoinHandle<()>,
    register_consumer: JoinHandle<SinkStats>,
    telegram_consumer: JoinHandle<SinkStats>,
}

impl RunningTasks {
    fn abort_all(&self) {
        self.ticker.abort();
        self.acceptor.abort();
        self.register_consumer.abort();
        self.telegram_consumer.abort();
    }
}

/// Producer side of the pipeline: owns the generator and both queue senders.
struct TickLoop {
    period: Duration,
    limit: Option<u64>,
    channels: Vec<SensorChannel>,
    source: MeasurementSource,
    assignment: RegisterAssignment,
    telegram_kind: SensorKind,
    register_queue: mpsc::Sender<Vec<Measurement>>,
    telegram_queue: mpsc::Sender<Measurement>,
    ticks: watch::Sender<u64>,
}

impl TickLoop {
    async fn run(mut self, mut shutdown: Shutdown) -> DispatchStats {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = 0u64;
        let mut stats = DispatchStats::default();

        'ticks: loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            tick += 1;
            let batch = self.source.generate(&self.channels, tick);
            let (registers, telegrams) = route(&batch, &self.assignment, self.telegram_kind);

            if !registers.is_empty() {
                match self.register_queue.try_send(registers) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.dropped_batches += 1;
                        warn!(
                            "⚠️  Register queue full, dropping tick {} ({} batches dropped so far)",
                            tick, stats.dropped_batches
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        error!("❌ Register consumer is gone, stopping ticks");
                        break 'ticks;
                    }
                }
            }
            for measurement in telegrams {
                match self.telegram_queue.try_send(measurement) {
                    Ok(()) => {}
                    Err(TrySendError::Full(m)) => {
                        stats.dropped_telegrams += 1;
                        warn!("⚠️  Telegram queue full, dropping {}", m);
                    }
                    Err(TrySendError::Closed(_)) => {
                        error!("❌ Telegram consumer is gone, stopping ticks");
                        break 'ticks;
                    }
                }
            }

            stats.ticks = tick;
            self.ticks.send_replace(tick);
            debug!("⏱️  Tick {} dispatched", tick);

            if self.limit.is_some_and(|limit| tick >= limit) {
                info!("🏁 Reached tick limit of {}", tick);
                break;
            }
        }
        stats
    }
}

/// Drives the crane simulation: one producer on a fixed tick feeding the
/// register and telegram consumers through bounded queues.
pub struct SimulationScheduler {
    config: SimulationConfig,
    store: Arc<dyn RegisterStore>,
    encoder: Arc<dyn TelegramEncoder>,
    connections: ConnectionManager,
    state: SchedulerState,
    tasks: Option<RunningTasks>,
    telegram_addr: Option<SocketAddr>,
    ticks_tx: Option<watch::Sender<u64>>,
    ticks_rx: watch::Receiver<u64>,
}

impl SimulationScheduler {
    pub fn new(
        config: SimulationConfig,
        store: Arc<dyn RegisterStore>,
        encoder: Arc<dyn TelegramEncoder>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let connections = ConnectionManager::new(config.max_clients, config.write_timeout());
        let (ticks_tx, ticks_rx) = watch::channel(0);

        Ok(Self {
            config,
            store,
            encoder,
            connections,
            state: SchedulerState::Idle,
            tasks: None,
            telegram_addr: None,
            ticks_tx: Some(ticks_tx),
            ticks_rx,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Bound telegram address while running.
    pub fn telegram_addr(&self) -> Option<SocketAddr> {
        self.telegram_addr
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Number of the last dispatched tick. The channel closes when the tick
    /// loop ends.
    pub fn ticks(&self) -> watch::Receiver<u64> {
        self.ticks_rx.clone()
    }

    /// Binds the telegram listener and spawns the pipeline. A bind failure
    /// leaves the scheduler idle.
    pub async fn start(&mut self) -> Result<SocketAddr, SimulationError> {
        if self.state != SchedulerState::Idle {
            return Err(SimulationError::InvalidState(format!(
                "cannot start a scheduler that is {}",
                self.state
            )));
        }
        let channels = self.config.channels();
        let register_sensors: Vec<_> = channels
            .iter()
            .filter(|c| c.kind == SensorKind::Temperature)
            .map(|c| c.id)
            .collect();
        let assignment = RegisterAssignment::contiguous(self.config.register_base, &register_sensors)?;
        let spec = self.config.telegram_spec()?;

        let listener = ConnectionManager::bind(&self.config.telegram_address()).await?;
        let local_addr = listener.local_addr()?;
        let Some(ticks_tx) = self.ticks_tx.take() else {
            return Err(SimulationError::InvalidState("tick channel already used".to_string()));
        };

        let (trigger, shutdown) = ShutdownTrigger::new();
        let (register_tx, register_rx) = mpsc::channel(self.config.queue_depth);
        let (telegram_tx, telegram_rx) = mpsc::channel(self.config.queue_depth);

        let register_sink = RegisterSink::new(assignment.clone(), self.store.clone());
        let telegram_sink = TelegramSink::new(spec, self.encoder.clone(), self.connections.clone());

        let manager = self.connections.clone();
        let accept_shutdown = shutdown.clone();
        let acceptor = tokio::spawn(async move { manager.run_accept_loop(listener, accept_shutdown).await });
        let register_consumer = tokio::spawn(register_sink.run(register_rx));
        let telegram_consumer = tokio::spawn(telegram_sink.run(telegram_rx));

        let tick_loop = TickLoop {
            period: self.config.tick_interval(),
            limit: self.config.tick_limit,
            channels,
            source: MeasurementSource::new(self.config.seed),
            assignment,
            telegram_kind: spec.kind.sensor_kind(),
            register_queue: register_tx,
            telegram_queue: telegram_tx,
            ticks: ticks_tx,
        };
        let ticker = tokio::spawn(tick_loop.run(shutdown));

        self.tasks = Some(RunningTasks {
            trigger,
            ticker,
            acceptor,
            register_consumer,
            telegram_consumer,
        });
        self.telegram_addr = Some(local_addr);
        self.state = SchedulerState::Running;

        info!(
            "🚀 Simulation running: {} register sensors every {:?}, {} telegrams on {} (max {} clients)",
            register_sensors.len(),
            self.config.tick_interval(),
            spec.kind,
            local_addr,
            self.connections.max_clients()
        );
        Ok(local_addr)
    }

    /// Stops the pipeline and releases the listener. Calling it again, or on
    /// a scheduler that never started, only ensures the `Stopped` state.
    pub async fn stop(&mut self) {
        let Some(tasks) = self.tasks.take() else {
            if self.state != SchedulerState::Stopped {
                debug!("Scheduler stopped while {}", self.state);
                self.state = SchedulerState::Stopped;
            }
            return;
        };

        self.state = SchedulerState::Stopping;
        info!("🛑 Stopping simulation");
        tasks.trigger.trigger();

        let wait = self.config.drain_timeout();
        let dispatched = join_within("tick loop", tasks.ticker, wait).await.unwrap_or_default();
        join_within("accept loop", tasks.acceptor, wait).await;

        // The tick loop owned the queue senders, so both consumers now see
        // closed queues and finish once drained.
        let registers = join_within("register consumer", tasks.register_consumer, wait).await;
        let telegrams = join_within("telegram consumer", tasks.telegram_consumer, wait).await;

        for client in self.connections.client_stats().await {
            info!(
                "📊 Client {} ({}): {} telegrams, {} bytes since {}",
                client.id,
                client.peer,
                client.messages_sent,
                client.bytes_sent,
                client.connected_at.format("%H:%M:%S")
            );
        }
        self.connections.close_all().await;
        self.telegram_addr = None;
        self.state = SchedulerState::Stopped;

        info!(
            "✅ Simulation stopped after {} ticks (register batches: {}, telegrams: {})",
            dispatched.ticks,
            registers.map(|s| s.batches).unwrap_or_default(),
            telegrams.map(|s| s.batches).unwrap_or_default()
        );
        if dispatched.dropped_batches > 0 || dispatched.dropped_telegrams > 0 {
            warn!(
                "⚠️  Full queues dropped {} register batches and {} telegrams",
                dispatched.dropped_batches, dispatched.dropped_telegrams
            );
        }
    }
}

impl Drop for SimulationScheduler {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.trigger.trigger();
            tasks.abort_all();
        }
    }
}

/// Waits for a task up to `wait`, aborting it afterwards.
async fn join_within<T>(name: &str, mut handle: JoinHandle<T>, wait: Duration) -> Option<T> {
    match timeout(wait, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("❌ {} ended abnormally: {}", name, e);
            None
        }
        Err(_) => {
            warn!("⏱️  {} did not finish within {:?}, aborting", name, wait);
            handle.abort();
            let _ = handle.await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::SensorId;
    use crate::modbus::HoldingRegisterBank;
    use crate::output::NmeaEncoder;
    use std::time::Instant;

    fn test_config() -> SimulationConfig {
        SimulationConfig {
            telegram_port: 0,
            tick_interval_ms: 20,
            seed: Some(5),
            ..Default::default()
        }
    }

    fn scheduler(config: SimulationConfig) -> SimulationScheduler {
        let bank = Arc::new(HoldingRegisterBank::new(config.register_count));
        SimulationScheduler::new(config, bank, Arc::new(NmeaEncoder)).unwrap()
    }

    fn reading(id: u16, kind: SensorKind) -> Measurement {
        Measurement {
            sensor_id: SensorId(id),
            kind,
            value: 1.0,
            tick: 1,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_route_splits_by_assignment_and_kind() {
        let assignment = RegisterAssignment::contiguous(0, &[SensorId(0), SensorId(1)]).unwrap();
        let batch = vec![
            reading(0, SensorKind::Temperature),
            reading(1, SensorKind::Temperature),
            reading(2, SensorKind::AngularRate),
        ];

        let (registers, telegrams) = route(&batch, &assignment, SensorKind::AngularRate);
        assert_eq!(registers.iter().map(|m| m.sensor_id).collect::<Vec<_>>(), vec![SensorId(0), SensorId(1)]);
        assert_eq!(telegrams.len(), 1);
        assert_eq!(telegrams[0].sensor_id, SensorId(2));

        let (registers, telegrams) = route(&batch, &assignment, SensorKind::Temperature);
        assert_eq!(registers.len(), 2);
        assert_eq!(telegrams.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queues_drop_and_count() {
        let config = test_config();
        let channels = config.channels();
        let ids: Vec<_> = channels
            .iter()
            .filter(|c| c.kind == SensorKind::Temperature)
            .map(|c| c.id)
            .collect();
        let (register_tx, _register_rx) = mpsc::channel(1);
        let (telegram_tx, _telegram_rx) = mpsc::channel(1);
        let (ticks_tx, _ticks_rx) = watch::channel(0);
        let (_trigger, shutdown) = ShutdownTrigger::new();

        // Nobody drains either queue, so only the first tick fits
        let tick_loop = TickLoop {
            period: Duration::from_millis(1),
            limit: Some(3),
            channels,
            source: MeasurementSource::seeded(9),
            assignment: RegisterAssignment::contiguous(0, &ids).unwrap(),
            telegram_kind: SensorKind::AngularRate,
            register_queue: register_tx,
            telegram_queue: telegram_tx,
            ticks: ticks_tx,
        };
        let stats = timeout(Duration::from_secs(2), tick_loop.run(shutdown)).await.unwrap();

        assert_eq!(
            stats,
            DispatchStats {
                ticks: 3,
                dropped_batches: 2,
                dropped_telegrams: 2,
            }
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SimulationConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        let bank = Arc::new(HoldingRegisterBank::new(10));
        assert!(SimulationScheduler::new(config, bank, Arc::new(NmeaEncoder)).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let mut scheduler = scheduler(test_config());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let addr = scheduler.start().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.telegram_addr(), Some(addr));
        assert!(matches!(scheduler.start().await, Err(SimulationError::InvalidState(_))));

        let mut ticks = scheduler.ticks();
        timeout(Duration::from_secs(2), ticks.wait_for(|t| *t >= 2))
            .await
            .unwrap()
            .unwrap();

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.telegram_addr(), None);
        assert!(matches!(scheduler.start().await, Err(SimulationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut scheduler = scheduler(test_config());
        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_scheduler_idle() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = SimulationConfig {
            telegram_port: taken.local_addr().unwrap().port(),
            ..test_config()
        };
        let mut scheduler = scheduler(config);

        assert!(matches!(scheduler.start().await, Err(SimulationError::BindError { .. })));
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        drop(taken);
        assert!(scheduler.start().await.is_ok());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_tick_limit_closes_tick_channel() {
        let config = SimulationConfig {
            tick_limit: Some(2),
            ..test_config()
        };
        let mut scheduler = scheduler(config);
        scheduler.start().await.unwrap();

        let mut ticks = scheduler.ticks();
        timeout(Duration::from_secs(2), async {
            while ticks.changed().await.is_ok() {}
        })
        .await
        .unwrap();
        assert_eq!(*ticks.borrow(), 2);

        scheduler.stop().await;
    }
}
