//! Latest status per device and the derived global danger flag.
//!
//! `AggregateState` is the pure state machine; `AggregateStateMachine` wraps
//! it in a mutex so update, recompute, compare and publish happen as one unit
//! per event, and fans alarm edges out to every subscriber.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use tokio::sync::broadcast;

use crate::device::DeviceId;
use crate::messages::AlarmEdge;
use crate::status::StatusUpdate;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateState {
    devices: HashMap<DeviceId, StatusUpdate>,
    any_danger: bool,
}

impl AggregateState {
    pub fn any_danger(&self) -> bool {
        self.any_danger
    }

    pub fn get(&self, id: &DeviceId) -> Option<&StatusUpdate> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> &HashMap<DeviceId, StatusUpdate> {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices currently reporting danger.
    pub fn danger_sources(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|(_, update)| update.is_danger())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Replace the entry for `id` and return the edge this caused, if any.
    pub fn apply(&mut self, id: DeviceId, update: StatusUpdate) -> Option<AlarmEdge> {
        self.devices.insert(id, update);
        self.transition(id)
    }

    /// Drop the entry for `id` and return the edge this caused, if any.
    pub fn remove(&mut self, id: &DeviceId) -> Option<AlarmEdge> {
        self.devices.remove(id)?;
        self.transition(*id)
    }

    fn transition(&mut self, cause: DeviceId) -> Option<AlarmEdge> {
        let next = self.devices.values().any(StatusUpdate::is_danger);
        if next == self.any_danger {
            return None;
        }
        self.any_danger = next;
        Some(if next {
            AlarmEdge::Rising(cause)
        } else {
            AlarmEdge::Falling(cause)
        })
    }
}

/// Single writer over an [`AggregateState`].
pub struct AggregateStateMachine {
    state: Mutex<AggregateState>,
    edges: broadcast::Sender<AlarmEdge>,
}

impl AggregateStateMachine {
    pub fn new(edge_buffer: usize) -> Self {
        let (edges, _) = broadcast::channel(edge_buffer.max(1));
        AggregateStateMachine {
            state: Mutex::new(AggregateState::default()),
            edges,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        // The state is replaced wholesale per entry, so a poisoned lock
        // still holds a consistent table.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply an update unless `is_live` reports the subscription was
    /// cancelled, then run `on_applied` before releasing the lock. A
    /// cancellation made through [`Self::fenced`] therefore either sees the
    /// write and its notification both done, or neither. Returns whether
    /// the update was applied.
    pub fn apply_if_live(
        &self,
        id: DeviceId,
        update: StatusUpdate,
        is_live: impl FnOnce() -> bool,
        on_applied: impl FnOnce(),
    ) -> bool {
        let mut state = self.lock();
        if !is_live() {
            return false;
        }
        let edge = state.apply(id, update);
        self.publish(edge);
        on_applied();
        true
    }

    pub fn apply(&self, id: DeviceId, update: StatusUpdate) {
        self.apply_if_live(id, update, || true, || {});
    }

    /// Run `f` while holding the state lock, serialized with every write.
    pub fn fenced<T>(&self, f: impl FnOnce() -> T) -> T {
        let _state = self.lock();
        f()
    }

    pub fn remove(&self, id: &DeviceId) {
        let mut state = self.lock();
        let edge = state.remove(id);
        self.publish(edge);
    }

    /// Immutable copy of the current table and flag.
    pub fn snapshot(&self) -> AggregateState {
        self.lock().clone()
    }

    pub fn alarm_active(&self) -> bool {
        self.lock().any_danger()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlarmEdge> {
        self.edges.subscribe()
    }

    /// Current alarm level plus a receiver for every edge after it, taken
    /// atomically so no edge falls between the two.
    pub fn subscribe_with_state(&self) -> (bool, broadcast::Receiver<AlarmEdge>) {
        let state = self.lock();
        (state.any_danger(), self.edges.subscribe())
    }

    fn publish(&self, edge: Option<AlarmEdge>) {
        let Some(edge) = edge else {
            return;
        };
        match &edge {
            AlarmEdge::Rising(id) => warn!("Alarm raised: device {} reports danger", id),
            AlarmEdge::Falling(id) => info!("Alarm cleared after update from {}", id),
        }
        // Nobody listening is not an error
        let _ = self.edges.send(edge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{DeviceState, DeviceStatusRecord};

    fn id(addr: &str) -> DeviceId {
        DeviceId::parse(addr).unwrap()
    }

    fn update(state: DeviceState) -> StatusUpdate {
        StatusUpdate::Record(DeviceStatusRecord {
            state,
            latitude: -6.2,
            longitude: 106.8,
            timestamp: Some(1),
        })
    }

    fn safe() -> StatusUpdate {
        update(DeviceState::Safe)
    }

    fn danger() -> StatusUpdate {
        update(DeviceState::Danger)
    }

    #[test]
    fn test_initial_state() {
        let state = AggregateState::default();
        assert!(!state.any_danger());
        assert!(state.is_empty());
    }

    #[test]
    fn test_edge_sequence_across_two_devices() {
        let a = id("AAAAAAAAAAAA");
        let b = id("BBBBBBBBBBBB");
        let mut state = AggregateState::default();

        assert_eq!(state.apply(a, safe()), None);
        assert_eq!(state.apply(b, danger()), Some(AlarmEdge::Rising(b)));
        assert_eq!(state.apply(a, danger()), None);
        assert_eq!(state.apply(b, safe()), None);
        assert!(state.any_danger());
        assert_eq!(state.apply(a, safe()), Some(AlarmEdge::Falling(a)));
        assert!(!state.any_danger());
    }

    #[test]
    fn test_repeated_danger_ticks_raise_once() {
        let a = id("AAAAAAAAAAAA");
        let mut state = AggregateState::default();
        let mut edges = Vec::new();

        for update in [danger(), danger(), danger(), safe(), safe(), danger(), safe()] {
            edges.extend(state.apply(a, update));
        }

        assert_eq!(
            edges,
            vec![
                AlarmEdge::Rising(a),
                AlarmEdge::Falling(a),
                AlarmEdge::Rising(a),
                AlarmEdge::Falling(a),
            ]
        );
    }

    #[test]
    fn test_flag_matches_table_after_every_event() {
        let ids = [id("AAAAAAAAAAAA"), id("BBBBBBBBBBBB"), id("CCCCCCCCCCCC")];
        let states = [
            safe(),
            danger(),
            StatusUpdate::NoData,
            update(DeviceState::Offline),
            update(DeviceState::Unknown("CHARGING".to_string())),
        ];
        let mut state = AggregateState::default();
        let mut rising = 0;
        let mut falling = 0;

        for step in 0..200usize {
            let device = ids[(step * 7 + step / 3) % ids.len()];
            let edge = if step % 11 == 10 {
                state.remove(&device)
            } else {
                state.apply(device, states[(step * 5 + step / 4) % states.len()].clone())
            };
            match edge {
                Some(AlarmEdge::Rising(_)) => rising += 1,
                Some(AlarmEdge::Falling(_)) => falling += 1,
                None => {}
            }
            let expected = state.devices().values().any(StatusUpdate::is_danger);
            assert_eq!(state.any_danger(), expected, "step {}", step);
            // Edges strictly alternate, starting with rising
            assert!(rising == falling || rising == falling + 1);
            assert_eq!(state.any_danger(), rising == falling + 1);
        }
    }

    #[test]
    fn test_removing_only_danger_source_falls() {
        let a = id("AAAAAAAAAAAA");
        let b = id("BBBBBBBBBBBB");
        let mut state = AggregateState::default();
        state.apply(a, safe());
        state.apply(b, danger());

        assert_eq!(state.remove(&b), Some(AlarmEdge::Falling(b)));
        assert!(state.get(&b).is_none());
        assert_eq!(state.remove(&b), None);
    }

    #[test]
    fn test_no_data_clears_danger() {
        let a = id("AAAAAAAAAAAA");
        let mut state = AggregateState::default();
        state.apply(a, danger());
        assert_eq!(
            state.apply(a, StatusUpdate::NoData),
            Some(AlarmEdge::Falling(a))
        );
        assert_eq!(state.get(&a), Some(&StatusUpdate::NoData));
    }

    #[test]
    fn test_machine_publishes_edges_only() {
        let a = id("AAAAAAAAAAAA");
        let machine = AggregateStateMachine::new(16);
        let mut edges = machine.subscribe();

        machine.apply(a, danger());
        machine.apply(a, danger());
        machine.apply(a, danger());
        machine.apply(a, safe());

        assert_eq!(edges.try_recv().unwrap(), AlarmEdge::Rising(a));
        assert_eq!(edges.try_recv().unwrap(), AlarmEdge::Falling(a));
        assert!(edges.try_recv().is_err());
    }

    #[test]
    fn test_cancelled_writer_is_rejected() {
        let a = id("AAAAAAAAAAAA");
        let machine = AggregateStateMachine::new(16);

        let mut notified = false;
        assert!(!machine.apply_if_live(a, danger(), || false, || notified = true));
        assert!(!notified);
        assert!(machine.snapshot().is_empty());
        assert!(!machine.alarm_active());

        assert!(machine.apply_if_live(a, danger(), || true, || notified = true));
        assert!(notified);
        assert!(machine.alarm_active());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let a = id("AAAAAAAAAAAA");
        let machine = AggregateStateMachine::new(16);
        machine.apply(a, danger());
        let before = machine.snapshot();

        machine.remove(&a);

        assert!(before.any_danger());
        assert!(before.get(&a).is_some());
        assert!(machine.snapshot().is_empty());
    }

    #[test]
    fn test_subscribe_with_state_reports_active_alarm() {
        let a = id("AAAAAAAAAAAA");
        let machine = AggregateStateMachine::new(16);
        machine.apply(a, danger());

        let (active, mut edges) = machine.subscribe_with_state();
        assert!(active);
        assert!(edges.try_recv().is_err());

        machine.remove(&a);
        assert_eq!(edges.try_recv().unwrap(), AlarmEdge::Falling(a));
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let machine = std::sync::Arc::new(AggregateStateMachine::new(1024));
        let ids: Vec<DeviceId> = (0..8u8)
            .map(|i| id(&format!("0000000000{:02X}", i)))
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .map(|device| {
                let machine = machine.clone();
                let device = *device;
                std::thread::spawn(move || {
                    for tick in 0..100 {
                        let next = if tick % 2 == 0 { danger() } else { safe() };
                        machine.apply(device, next);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.len(), 8);
        assert!(!snapshot.any_danger());
        assert!(snapshot.danger_sources().is_empty());
    }
}
