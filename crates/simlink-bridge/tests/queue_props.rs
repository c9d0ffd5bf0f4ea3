//! Property tests for the bounded queues under flooding

use proptest::prelude::*;
use simlink_bridge::{
    BridgeQueues, InboundItem, InboundQueue, OutboundItem, OutboundQueue, PeerId, SessionEvent,
};
use simlink_core::{AckPayload, Action, Command, Envelope, EnvelopeKind};

fn ack(correlation_id: u64) -> OutboundItem {
    let envelope =
        Envelope::seal(EnvelopeKind::Ack, correlation_id, &AckPayload { applied_tick: 0 }).unwrap();
    OutboundItem::broadcast(envelope)
}

fn command_id(item: InboundItem) -> u64 {
    item.command.correlation_id
}

proptest! {
    /// Flooding the inbound queue keeps the oldest items and rejects the rest
    #[test]
    fn inbound_keeps_oldest(capacity in 1usize..32, pushed in 0usize..96) {
        let queue = InboundQueue::new(capacity);
        let mut accepted = 0usize;
        for id in 0..pushed as u64 {
            if queue.try_push(InboundItem::new(PeerId(1), Command::new(id, Action::Noop))).is_ok() {
                accepted += 1;
            }
        }

        prop_assert_eq!(accepted, pushed.min(capacity));
        prop_assert_eq!(queue.rejected() as usize, pushed - accepted);

        let ids: Vec<u64> = queue
            .drain(capacity)
            .into_iter()
            .map(command_id)
            .collect();
        let expected: Vec<u64> = (0..accepted as u64).collect();
        prop_assert_eq!(ids, expected);
        prop_assert!(queue.is_empty());
    }

    /// Flooding the outbound queue keeps the newest items in FIFO order
    #[test]
    fn outbound_keeps_newest(capacity in 1usize..32, pushed in 0usize..96) {
        let queue = OutboundQueue::new(capacity);
        let mut evicted = Vec::new();
        for id in 0..pushed as u64 {
            if let Some(old) = queue.push(ack(id)) {
                evicted.push(old.envelope.correlation_id);
            }
        }

        let kept: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.envelope.correlation_id)
            .collect();
        let first_kept = pushed.saturating_sub(capacity) as u64;
        prop_assert_eq!(kept, (first_kept..pushed as u64).collect::<Vec<_>>());
        prop_assert_eq!(evicted, (0..first_kept).collect::<Vec<_>>());
        prop_assert_eq!(queue.evicted(), first_kept);
    }

    /// Draining never exceeds the requested limit and preserves order across batches
    #[test]
    fn drain_in_batches(capacity in 1usize..32, limit in 1usize..8) {
        let queue = InboundQueue::new(capacity);
        for id in 0..capacity as u64 {
            queue.try_push(InboundItem::new(PeerId(2), Command::new(id, Action::Noop))).unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let batch = queue.drain(limit);
            prop_assert!(batch.len() <= limit);
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.into_iter().map(command_id));
        }
        prop_assert_eq!(seen, (0..capacity as u64).collect::<Vec<_>>());
    }

    /// A full command queue never costs a connection its lifecycle events
    #[test]
    fn lifecycle_independent_of_command_flood(capacity in 1usize..16, flood in 0usize..64, peers in 1u64..8) {
        let queues = BridgeQueues::new(capacity, 4);
        for id in 0..flood as u64 {
            let _ = queues.inbound.try_push(InboundItem::new(PeerId(100), Command::new(id, Action::Noop)));
        }
        for peer in 1..=peers {
            queues.events.report(PeerId(peer), SessionEvent::Connected);
            queues.events.report(PeerId(peer), SessionEvent::Negotiated { version: 1 });
            queues.events.report(PeerId(peer), SessionEvent::Heartbeat);
            queues.events.report(PeerId(peer), SessionEvent::Disconnected);
        }

        let batch = queues.events.drain();
        prop_assert_eq!(batch.opened.len() as u64, peers * 2);
        prop_assert_eq!(batch.heartbeats.len() as u64, peers);
        prop_assert_eq!(batch.ended.len() as u64, peers);
        prop_assert_eq!(queues.inbound.len(), flood.min(capacity));
    }
}
