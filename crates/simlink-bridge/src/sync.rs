//! Tick synchronizer: the only place inbound work touches simulation state
//!
//! Called by the host once per tick on the simulation thread. Each call:
//! 1. sweeps stale sessions and has the transport hang up on closed peers
//! 2. registers new connections, handshakes and heartbeats
//! 3. drains the command queue (bounded by its capacity) and processes
//!    commands in arrival order
//! 4. retires connections that ended, after their last commands ran
//! 5. captures a snapshot on sampling ticks
//! 6. periodically logs throughput counters

use crate::host::{SimulationState, TickHook};
use crate::queue::{
    BridgeQueues, CloseSignals, InboundItem, InboundQueue, OutboundItem, OutboundQueue,
    SessionEvent, SessionEvents,
};
use crate::session::{PeerId, RegistryError, SessionRegistry};
use serde::Serialize;
use simlink_core::{
    AckPayload, Action, BridgeConfig, Command, Envelope, EnvelopeKind, ErrorPayload, Snapshot,
    ValidationError, error_codes,
};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Cumulative counters since the bridge started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub ticks: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub duplicates_dropped: u64,
    /// Commands from sessions that had already closed
    pub orphans_dropped: u64,
    pub snapshots_enqueued: u64,
    pub sessions_closed: u64,
    pub outbound_evicted: u64,
}

/// What one `on_tick` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub drained: usize,
    pub commands_applied: usize,
    pub commands_rejected: usize,
    pub duplicates_dropped: usize,
    pub orphans_dropped: usize,
    pub sessions_closed: usize,
    pub snapshot_taken: bool,
}

/// Check a command against the current simulation state without mutating it
pub fn validate_command(
    command: &Command,
    tick: u64,
    sim: &dyn SimulationState,
) -> Result<(), ValidationError> {
    if command.action == Action::Unknown {
        return Err(ValidationError::UnknownAction);
    }
    if !sim.supports(command.action) {
        return Err(ValidationError::Unsupported(command.action.to_string()));
    }
    if let Some(target) = command.target_tick {
        if target < tick {
            return Err(ValidationError::TargetTickElapsed {
                target,
                current: tick,
            });
        }
    }
    if let Some(missing) = command.referenced_entities().find(|id| !sim.entity_exists(*id)) {
        return Err(ValidationError::UnknownEntity(missing));
    }
    Ok(())
}

/// Moves work between the queues and the simulation at tick boundaries
pub struct TickSynchronizer {
    inbound: Arc<InboundQueue>,
    events: Arc<SessionEvents>,
    outbound: Arc<OutboundQueue>,
    closes: Arc<CloseSignals>,
    registry: SessionRegistry,
    sampling_interval: u64,
    stats_log_interval: u64,
    stats: BridgeStats,
    started: Instant,
}

impl TickSynchronizer {
    pub fn new(config: &BridgeConfig, queues: &BridgeQueues) -> Self {
        Self {
            inbound: queues.inbound.clone(),
            events: queues.events.clone(),
            outbound: queues.outbound.clone(),
            closes: queues.closes.clone(),
            registry: SessionRegistry::new(config.heartbeat_timeout_ticks, config.dedup_window),
            sampling_interval: config.sampling_interval.max(1),
            stats_log_interval: config.stats_log_interval,
            stats: BridgeStats::default(),
            started: Instant::now(),
        }
    }

    /// Run one tick's worth of bridge work
    pub fn on_tick(&mut self, tick: u64, sim: &mut dyn SimulationState) -> TickReport {
        let mut report = TickReport {
            tick,
            ..Default::default()
        };

        for session in self.registry.sweep_stale(tick) {
            report.sessions_closed += 1;
            self.hang_up(tick, session.peer);
        }

        let sessions = self.events.drain();
        for (peer, event) in sessions.opened {
            self.on_session_event(tick, peer, event);
        }
        for peer in sessions.heartbeats {
            self.on_session_event(tick, peer, SessionEvent::Heartbeat);
        }

        let batch = self.inbound.drain(self.inbound.capacity());
        report.drained = batch.len();
        for InboundItem { peer, command } in batch {
            self.on_command(tick, peer, command, sim, &mut report);
        }

        for (peer, event) in sessions.ended {
            self.on_session_event(tick, peer, event);
        }

        if tick % self.sampling_interval == 0 {
            report.snapshot_taken = self.capture(tick, sim);
        }

        self.record(&report);
        report
    }

    fn on_session_event(&mut self, tick: u64, peer: PeerId, event: SessionEvent) {
        let result = match event {
            SessionEvent::Connected | SessionEvent::Heartbeat => {
                self.registry.register_or_touch(peer, tick).map(|_| ())
            }
            SessionEvent::Negotiated { version } => self.registry.mark_negotiated(peer, version, tick),
            SessionEvent::Lost => {
                debug!("Connection to {} lost", peer);
                self.registry.mark_lost(peer);
                Ok(())
            }
            SessionEvent::Disconnected => {
                self.registry.close(peer);
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            // The transport refuses these; make sure the connection is gone
            Err(RegistryError::Closed(_)) if !event.ends_connection() => {
                warn!("{} reported {:?} after its session closed", peer, event);
                self.hang_up(tick, peer);
            }
            Err(e) => debug!("Ignoring {:?} from {}: {}", event, peer, e),
        }
    }

    /// Have the transport tell the peer its session is over and disconnect it
    fn hang_up(&self, tick: u64, peer: PeerId) {
        let reason = ErrorPayload {
            code: error_codes::SESSION_CLOSED,
            message: "session closed".into(),
            tick: Some(tick),
        };
        if !self.closes.close(peer, reason) {
            debug!("{} already disconnected", peer);
        }
    }

    fn on_command(
        &mut self,
        tick: u64,
        peer: PeerId,
        command: Command,
        sim: &mut dyn SimulationState,
        report: &mut TickReport,
    ) {
        let correlation_id = command.correlation_id;

        if self.registry.register_or_touch(peer, tick).is_err() {
            warn!(
                "Dropping command {} from closed session {}",
                correlation_id, peer
            );
            report.orphans_dropped += 1;
            self.hang_up(tick, peer);
            return;
        }
        if !self.registry.validate(correlation_id, peer) {
            debug!("Dropping duplicate command {} from {}", correlation_id, peer);
            report.duplicates_dropped += 1;
            return;
        }

        let outcome = validate_command(&command, tick, sim).and_then(|()| sim.apply(&command));
        match outcome {
            Ok(()) => {
                debug!("Applied {} ({}) from {} at tick {}", command.action, correlation_id, peer, tick);
                report.commands_applied += 1;
                let ack = AckPayload { applied_tick: tick };
                self.send(peer, EnvelopeKind::Ack, correlation_id, &ack);
            }
            Err(e) => {
                debug!("Rejected {} ({}) from {}: {}", command.action, correlation_id, peer, e);
                report.commands_rejected += 1;
                let payload = ErrorPayload {
                    code: e.code(),
                    message: e.to_string(),
                    tick: Some(tick),
                };
                self.send(peer, EnvelopeKind::Error, correlation_id, &payload);
            }
        }
    }

    fn capture(&mut self, tick: u64, sim: &dyn SimulationState) -> bool {
        let snapshot = Snapshot::capture(tick, unix_millis(), sim.entities());
        match Envelope::seal(EnvelopeKind::Snapshot, 0, &snapshot) {
            Ok(envelope) => {
                self.enqueue(OutboundItem::broadcast(envelope));
                true
            }
            Err(e) => {
                error!("Failed to encode snapshot for tick {}: {}", tick, e);
                false
            }
        }
    }

    fn send<T: Serialize>(
        &mut self,
        peer: PeerId,
        kind: EnvelopeKind,
        correlation_id: u64,
        payload: &T,
    ) {
        match Envelope::seal(kind, correlation_id, payload) {
            Ok(envelope) => self.enqueue(OutboundItem::to_peer(peer, envelope)),
            Err(e) => error!("Failed to encode {:?} for {}: {}", kind, peer, e),
        }
    }

    fn enqueue(&mut self, item: OutboundItem) {
        if let Some(evicted) = self.outbound.push(item) {
            self.stats.outbound_evicted += 1;
            debug!(
                "Outbound queue full, evicted {:?} envelope ({})",
                evicted.envelope.kind, evicted.envelope.correlation_id
            );
        }
    }

    fn record(&mut self, report: &TickReport) {
        let stats = &mut self.stats;
        stats.ticks += 1;
        stats.commands_applied += report.commands_applied as u64;
        stats.commands_rejected += report.commands_rejected as u64;
        stats.duplicates_dropped += report.duplicates_dropped as u64;
        stats.orphans_dropped += report.orphans_dropped as u64;
        stats.sessions_closed += report.sessions_closed as u64;
        if report.snapshot_taken {
            stats.snapshots_enqueued += 1;
        }

        if self.stats_log_interval > 0 && stats.ticks % self.stats_log_interval == 0 {
            let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                "Bridge: {} commands applied ({:.1}/sec), {} rejected, {} snapshots, {} inbound overflows, {} outbound evictions, {} active sessions",
                stats.commands_applied,
                stats.commands_applied as f64 / elapsed,
                stats.commands_rejected,
                stats.snapshots_enqueued,
                self.inbound.rejected(),
                stats.outbound_evicted,
                self.registry.active_count()
            );
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl TickHook for TickSynchronizer {
    fn on_tick(&mut self, tick: u64, sim: &mut dyn SimulationState) {
        TickSynchronizer::on_tick(self, tick, sim);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Target;
    use simlink_core::{EntityId, EntityState, ParamValue};
    use std::collections::BTreeMap;

    /// Minimal host: entities on a line, only MoveEntity and Noop supported
    #[derive(Default)]
    struct TestSim {
        entities: BTreeMap<EntityId, [f64; 3]>,
        applied: Vec<u64>,
    }

    impl TestSim {
        fn with_entities(ids: &[EntityId]) -> Self {
            Self {
                entities: ids.iter().map(|id| (*id, [0.0; 3])).collect(),
                applied: Vec::new(),
            }
        }
    }

    impl SimulationState for TestSim {
        fn entities(&self) -> Vec<EntityState> {
            self.entities
                .iter()
                .map(|(id, pos)| EntityState::new(*id, "cow", *pos))
                .collect()
        }

        fn entity_exists(&self, id: EntityId) -> bool {
            self.entities.contains_key(&id)
        }

        fn supports(&self, action: Action) -> bool {
            matches!(action, Action::MoveEntity | Action::Noop)
        }

        fn apply(&mut self, command: &Command) -> Result<(), ValidationError> {
            if command.action == Action::MoveEntity {
                let id = command.param("Entity")?.as_entity().unwrap();
                let pos = command.param("Position")?.as_vec3().ok_or_else(|| {
                    ValidationError::InvalidParameter {
                        name: "Position".into(),
                        reason: "expected Vec3".into(),
                    }
                })?;
                self.entities.insert(id, pos);
            }
            self.applied.push(command.correlation_id);
            Ok(())
        }
    }

    fn config(capacity: usize, sampling: u64) -> BridgeConfig {
        BridgeConfig {
            inbound_capacity: capacity,
            outbound_capacity: 64,
            sampling_interval: sampling,
            heartbeat_timeout_ticks: 5,
            ..Default::default()
        }
    }

    fn setup(capacity: usize, sampling: u64) -> (TickSynchronizer, BridgeQueues) {
        let config = config(capacity, sampling);
        let queues = BridgeQueues::new(config.inbound_capacity, config.outbound_capacity);
        let sync = TickSynchronizer::new(&config, &queues);
        (sync, queues)
    }

    fn drain_outbound(outbound: &OutboundQueue) -> Vec<OutboundItem> {
        std::iter::from_fn(|| outbound.pop()).collect()
    }

    fn connect(queues: &BridgeQueues, peer: u64) {
        queues
            .events
            .report(PeerId(peer), SessionEvent::Negotiated { version: 1 });
    }

    fn noop(peer: u64, id: u64) -> InboundItem {
        InboundItem::new(PeerId(peer), Command::new(id, Action::Noop))
    }

    #[test]
    fn test_snapshot_cadence() {
        let (mut sync, queues) = setup(8, 10);
        let mut sim = TestSim::with_entities(&[1]);

        for tick in 1..=25 {
            sync.on_tick(tick, &mut sim);
        }

        let snapshots: Vec<u64> = drain_outbound(&queues.outbound)
            .into_iter()
            .filter(|item| item.envelope.kind == EnvelopeKind::Snapshot)
            .map(|item| {
                assert_eq!(item.target, Target::All);
                item.envelope.open::<Snapshot>().unwrap().tick
            })
            .collect();
        assert_eq!(snapshots, vec![10, 20]);
        assert_eq!(sync.stats().snapshots_enqueued, 2);
    }

    #[test]
    fn test_commands_acked_in_order() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::with_entities(&[1]);
        connect(&queues, 1);
        for id in [3, 1, 2] {
            queues.inbound.try_push(noop(1, id)).unwrap();
        }

        let report = sync.on_tick(1, &mut sim);
        assert_eq!(report.commands_applied, 3);
        assert_eq!(sim.applied, vec![3, 1, 2]);

        let acks: Vec<u64> = drain_outbound(&queues.outbound)
            .into_iter()
            .map(|item| {
                assert_eq!(item.envelope.kind, EnvelopeKind::Ack);
                assert_eq!(item.target, Target::Peer(PeerId(1)));
                item.envelope.correlation_id
            })
            .collect();
        assert_eq!(acks, vec![3, 1, 2]);
    }

    #[test]
    fn test_duplicate_applied_once() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);
        queues.inbound.try_push(noop(1, 7)).unwrap();
        queues.inbound.try_push(noop(1, 7)).unwrap();
        sync.on_tick(1, &mut sim);

        // Resent on a later tick
        queues.inbound.try_push(noop(1, 7)).unwrap();
        let report = sync.on_tick(2, &mut sim);

        assert_eq!(sim.applied, vec![7]);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(sync.stats().duplicates_dropped, 2);
        assert_eq!(drain_outbound(&queues.outbound).len(), 1);
    }

    #[test]
    fn test_invalid_commands_get_error_envelopes() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::with_entities(&[1]);
        connect(&queues, 1);

        let commands = [
            Command::new(1, Action::Unknown),
            Command::new(2, Action::RemoveEntity).with_param("Entity", ParamValue::Entity(1)),
            Command::new(3, Action::Noop).targeting(4),
            Command::new(4, Action::MoveEntity)
                .with_param("Entity", ParamValue::Entity(99))
                .with_param("Position", ParamValue::Vec3([1.0, 2.0, 3.0])),
            Command::new(5, Action::MoveEntity).with_param("Entity", ParamValue::Entity(1)),
        ];
        for command in commands {
            queues.inbound.try_push(InboundItem::new(PeerId(1), command)).unwrap();
        }

        let report = sync.on_tick(5, &mut sim);
        assert_eq!(report.commands_rejected, 5);
        assert!(sim.applied.is_empty());

        let codes: Vec<(u64, i32)> = drain_outbound(&queues.outbound)
            .into_iter()
            .map(|item| {
                assert_eq!(item.envelope.kind, EnvelopeKind::Error);
                let payload: ErrorPayload = item.envelope.open().unwrap();
                (item.envelope.correlation_id, payload.code)
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                (1, error_codes::UNKNOWN_ACTION),
                (2, error_codes::UNKNOWN_ACTION),
                (3, error_codes::TARGET_TICK_ELAPSED),
                (4, error_codes::UNKNOWN_ENTITY),
                (5, error_codes::INVALID_PARAMETER),
            ]
        );
    }

    #[test]
    fn test_target_tick_equal_to_current_is_accepted() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);
        queues
            .inbound
            .try_push(InboundItem::new(PeerId(1), Command::new(1, Action::Noop).targeting(3)))
            .unwrap();

        assert_eq!(sync.on_tick(3, &mut sim).commands_applied, 1);
    }

    #[test]
    fn test_move_entity_changes_next_snapshot() {
        let (mut sync, queues) = setup(8, 1);
        let mut sim = TestSim::with_entities(&[1]);
        connect(&queues, 1);
        let command = Command::new(1, Action::MoveEntity)
            .with_param("Entity", ParamValue::Entity(1))
            .with_param("Position", ParamValue::Vec3([4.0, 5.0, 6.0]));
        queues.inbound.try_push(InboundItem::new(PeerId(1), command)).unwrap();

        sync.on_tick(1, &mut sim);

        let snapshot = drain_outbound(&queues.outbound)
            .into_iter()
            .find(|item| item.envelope.kind == EnvelopeKind::Snapshot)
            .map(|item| item.envelope.open::<Snapshot>().unwrap())
            .unwrap();
        assert_eq!(snapshot.entity(1).unwrap().position, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_overflow_then_drain_applies_first_four() {
        let (mut sync, queues) = setup(4, 100);
        let mut sim = TestSim::default();

        for id in 1..=4 {
            queues.inbound.try_push(noop(1, id)).unwrap();
        }
        let overflow = queues.inbound.try_push(noop(1, 5)).unwrap_err();
        assert_eq!(overflow.error.capacity, 4);

        let report = sync.on_tick(1, &mut sim);
        assert_eq!(sim.applied, vec![1, 2, 3, 4]);
        assert_eq!(report.drained, 4);
    }

    #[test]
    fn test_stale_session_closed_and_hung_up() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        let link = queues.closes.attach(PeerId(1));
        connect(&queues, 1);
        sync.on_tick(1, &mut sim);

        // Timeout is 5 ticks: stale at 7, closed at 8
        sync.on_tick(7, &mut sim);
        assert!(link.borrow().is_none());
        let report = sync.on_tick(8, &mut sim);
        assert_eq!(report.sessions_closed, 1);

        let reason = link.borrow().clone().unwrap();
        assert_eq!(reason.code, error_codes::SESSION_CLOSED);
        assert_eq!(reason.tick, Some(8));
        assert!(drain_outbound(&queues.outbound).is_empty());

        // Late command from the closed session is dropped
        queues.inbound.try_push(noop(1, 9)).unwrap();
        let report = sync.on_tick(9, &mut sim);
        assert_eq!(report.orphans_dropped, 1);
        assert!(sim.applied.is_empty());
    }

    #[test]
    fn test_unnegotiated_connection_is_closed_when_stale() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        let link = queues.closes.attach(PeerId(3));
        queues.events.report(PeerId(3), SessionEvent::Connected);

        for tick in 1..=8 {
            sync.on_tick(tick, &mut sim);
        }
        assert!(sync.sessions().is_closed(PeerId(3)));
        assert!(link.borrow().is_some());
    }

    #[test]
    fn test_late_handshake_on_closed_session_hangs_up_again() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        queues.events.report(PeerId(5), SessionEvent::Connected);
        sync.on_tick(1, &mut sim);
        for tick in 7..=8 {
            sync.on_tick(tick, &mut sim);
        }
        assert!(sync.sessions().is_closed(PeerId(5)));

        let link = queues.closes.attach(PeerId(5));
        connect(&queues, 5);
        sync.on_tick(9, &mut sim);
        assert!(sync.sessions().get(PeerId(5)).is_none());
        assert_eq!(
            link.borrow().as_ref().map(|reason| reason.code),
            Some(error_codes::SESSION_CLOSED)
        );
    }

    #[test]
    fn test_lifecycle_survives_command_flood() {
        let (mut sync, queues) = setup(4, 100);
        let mut sim = TestSim::default();
        queues.events.report(PeerId(1), SessionEvent::Connected);
        connect(&queues, 1);
        for id in 1..=4 {
            queues.inbound.try_push(noop(1, id)).unwrap();
        }
        assert!(queues.inbound.try_push(noop(1, 5)).is_err());

        let report = sync.on_tick(1, &mut sim);
        assert_eq!(report.commands_applied, 4);
        assert_eq!(sim.applied, vec![1, 2, 3, 4]);
        assert_eq!(sync.sessions().active_count(), 1);
    }

    #[test]
    fn test_commands_before_disconnect_still_run() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);
        queues.inbound.try_push(noop(1, 1)).unwrap();
        queues.events.report(PeerId(1), SessionEvent::Disconnected);

        let report = sync.on_tick(1, &mut sim);
        assert_eq!(report.commands_applied, 1);
        assert_eq!(report.orphans_dropped, 0);
        assert!(sync.sessions().is_closed(PeerId(1)));
    }

    #[test]
    fn test_heartbeats_keep_session_alive() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);

        for tick in 0..30 {
            if tick % 4 == 0 {
                queues.events.report(PeerId(1), SessionEvent::Heartbeat);
            }
            assert_eq!(sync.on_tick(tick, &mut sim).sessions_closed, 0);
        }
        assert_eq!(sync.sessions().active_count(), 1);
    }

    #[test]
    fn test_clean_disconnect_closes_immediately() {
        let (mut sync, queues) = setup(8, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);
        queues.events.report(PeerId(1), SessionEvent::Disconnected);

        sync.on_tick(1, &mut sim);
        assert!(sync.sessions().is_closed(PeerId(1)));
        assert!(sync.sessions().is_empty());
    }

    #[test]
    fn test_interleaved_sessions_keep_receipt_order() {
        let (mut sync, queues) = setup(16, 100);
        let mut sim = TestSim::default();
        connect(&queues, 1);
        connect(&queues, 2);
        for (peer, id) in [(1, 10), (2, 20), (1, 11), (2, 21), (1, 12)] {
            queues.inbound.try_push(noop(peer, id)).unwrap();
        }

        sync.on_tick(1, &mut sim);
        assert_eq!(sim.applied, vec![10, 20, 11, 21, 12]);
    }
}
