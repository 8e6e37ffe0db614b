//! Shared, thread-safe table of device input states
//!
//! Setters are called from whatever thread delivers touch input; the transport
//! loop takes snapshots on its own clock. All access goes through one short
//! `std::sync::Mutex` critical section that never spans I/O, so a slow channel
//! or socket can never stall input handling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::codec::{self, CodecError};
use super::state::{
    ButtonId, ControllerKind, DeviceState, DpadDirection, JoystickType, TriggerType,
    MAX_CLIENT_REF_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Client ref id is {0} bytes, limit is 255")]
    ClientRefTooLong(usize),

    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// How trigger presses turn into trigger bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerMode {
    /// Press snaps to 0xFF, release snaps to 0
    #[default]
    Hard,
    /// Press only sets a target; the ramp timer moves the byte by `step`
    /// toward 255 and by three times `step` toward 0
    Soft { step: u8 },
}

/// One analog trigger emulated in soft mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftTriggerRamp {
    pub current: u8,
    pub target_pressed: bool,
}

impl SoftTriggerRamp {
    /// Moves one step toward the target and returns the new value
    pub fn advance(&mut self, increase: u8, decrease: u8) -> u8 {
        self.current = if self.target_pressed {
            self.current.saturating_add(increase)
        } else {
            self.current.saturating_sub(decrease)
        };
        self.current
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SoftTriggers {
    left: SoftTriggerRamp,
    right: SoftTriggerRamp,
}

impl SoftTriggers {
    fn side(&mut self, trigger: TriggerType) -> &mut SoftTriggerRamp {
        match trigger {
            TriggerType::Left => &mut self.left,
            TriggerType::Right => &mut self.right,
        }
    }
}

#[derive(Debug)]
struct DeviceEntry {
    state: DeviceState,
    // Present only in soft trigger mode
    ramp: Option<SoftTriggers>,
}

#[derive(Debug, Default)]
pub struct GamepadStore {
    devices: Mutex<BTreeMap<String, DeviceEntry>>,
    trigger_mode: TriggerMode,
}

impl GamepadStore {
    pub fn new(trigger_mode: TriggerMode) -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            trigger_mode,
        }
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger_mode
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, DeviceEntry>> {
        // A panicking setter leaves plain data behind, keep serving it
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<R>(
        &self,
        client_ref_id: &str,
        f: impl FnOnce(&mut DeviceEntry) -> R,
    ) -> Result<R, StoreError> {
        let mut devices = self.devices();
        let entry = devices
            .get_mut(client_ref_id)
            .ok_or_else(|| StoreError::DeviceNotFound(client_ref_id.to_string()))?;
        Ok(f(entry))
    }

    /// Creates a fresh state, replacing any entry with the same client ref id
    pub fn register(
        &self,
        numeric_id: u8,
        client_ref_id: &str,
        kind: ControllerKind,
    ) -> Result<(), StoreError> {
        if client_ref_id.len() > MAX_CLIENT_REF_LEN {
            return Err(StoreError::ClientRefTooLong(client_ref_id.len()));
        }

        let ramp = match self.trigger_mode {
            TriggerMode::Hard => None,
            TriggerMode::Soft { .. } => Some(SoftTriggers::default()),
        };
        let entry = DeviceEntry {
            state: DeviceState::new(numeric_id, client_ref_id, kind),
            ramp,
        };

        let replaced = self
            .devices()
            .insert(client_ref_id.to_string(), entry)
            .is_some();
        info!(
            "Registered device {} (id {}, {:?}){}",
            client_ref_id,
            numeric_id,
            kind,
            if replaced { ", replacing previous entry" } else { "" }
        );
        Ok(())
    }

    pub fn get(&self, client_ref_id: &str) -> Result<DeviceState, StoreError> {
        self.with_device(client_ref_id, |entry| entry.state.clone())
    }

    pub fn contains(&self, client_ref_id: &str) -> bool {
        self.devices().contains_key(client_ref_id)
    }

    /// Detaches a device; its soft trigger ramp goes with it
    pub fn remove(&self, client_ref_id: &str) -> Option<DeviceState> {
        let removed = self.devices().remove(client_ref_id).map(|entry| entry.state);
        if removed.is_some() {
            info!("Removed device {}", client_ref_id);
        } else {
            debug!("Remove requested for unknown device {}", client_ref_id);
        }
        removed
    }

    /// Copies of every state, ordered by client ref id
    pub fn all_snapshots(&self) -> Vec<DeviceState> {
        self.devices()
            .values()
            .map(|entry| entry.state.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut devices = self.devices();
        let count = devices.len();
        devices.clear();
        if count > 0 {
            info!("Cleared {} devices", count);
        }
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }

    pub fn encode(&self, client_ref_id: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.get(client_ref_id)?;
        Ok(codec::encode(&state)?)
    }

    pub fn set_button(
        &self,
        client_ref_id: &str,
        button: ButtonId,
        pressed: bool,
    ) -> Result<(), StoreError> {
        let Some(bit) = button.bit() else {
            return match button.trigger() {
                Some(trigger) => self.set_trigger(client_ref_id, trigger, pressed),
                None => Ok(()),
            };
        };

        let mask = self.with_device(client_ref_id, |entry| {
            entry.state.apply_bit(bit, pressed);
            entry.state.button_mask
        })?;
        debug!("{:?} {} mask = {:016b}", button, pressed, mask);
        Ok(())
    }

    pub fn set_dpad(
        &self,
        client_ref_id: &str,
        direction: DpadDirection,
        pressed: bool,
    ) -> Result<(), StoreError> {
        let mask = self.with_device(client_ref_id, |entry| {
            entry.state.apply_dpad(direction, pressed);
            entry.state.button_mask
        })?;
        debug!("{:?} {} mask = {:016b}", direction, pressed, mask);
        Ok(())
    }

    pub fn set_stick(
        &self,
        client_ref_id: &str,
        stick: JoystickType,
        x: i16,
        y: i16,
    ) -> Result<(), StoreError> {
        self.with_device(client_ref_id, |entry| entry.state.set_stick(stick, x, y))
    }

    pub fn set_sticks(
        &self,
        client_ref_id: &str,
        left: (i16, i16),
        right: (i16, i16),
    ) -> Result<(), StoreError> {
        self.with_device(client_ref_id, |entry| {
            entry.state.set_stick(JoystickType::Left, left.0, left.1);
            entry.state.set_stick(JoystickType::Right, right.0, right.1);
        })
    }

    pub fn set_trigger(
        &self,
        client_ref_id: &str,
        trigger: TriggerType,
        pressed: bool,
    ) -> Result<(), StoreError> {
        self.with_device(client_ref_id, |entry| match entry.ramp.as_mut() {
            Some(ramp) => ramp.side(trigger).target_pressed = pressed,
            None => entry
                .state
                .set_trigger_value(trigger, if pressed { u8::MAX } else { 0 }),
        })?;
        debug!("{:?} trigger pressed = {}", trigger, pressed);
        Ok(())
    }

    /// One ramp tick for every soft-trigger device; returns how many changed
    pub fn advance_soft_triggers(&self) -> usize {
        let TriggerMode::Soft { step } = self.trigger_mode else {
            return 0;
        };
        let decrease = step.saturating_mul(3);

        let mut changed = 0;
        for entry in self.devices().values_mut() {
            let Some(ramp) = entry.ramp.as_mut() else {
                continue;
            };
            let left = ramp.left.advance(step, decrease);
            let right = ramp.right.advance(step, decrease);
            if entry.state.trigger_left != left || entry.state.trigger_right != right {
                entry.state.trigger_left = left;
                entry.state.trigger_right = right;
                changed += 1;
            }
        }
        changed
    }

    /// Runs the shared soft trigger timer until `cancel` fires.
    ///
    /// Returns `None` in hard mode, where there is nothing to ramp.
    pub fn spawn_ramp(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.trigger_mode == TriggerMode::Hard {
            return None;
        }

        let store = Arc::clone(self);
        info!("Starting soft trigger ramp with {:?} tick", period);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.advance_soft_triggers();
                    }
                }
            }
            debug!("Soft trigger ramp stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: &str) -> GamepadStore {
        let store = GamepadStore::new(TriggerMode::Hard);
        store.register(1, id, ControllerKind::Ps4).unwrap();
        store
    }

    #[test]
    fn primary_action_sets_bit_zero() {
        let store = store_with("A1");
        store.set_button("A1", ButtonId::PRIMARY_ACTION, true).unwrap();
        let state = store.get("A1").unwrap();
        assert_eq!(state.button_mask, 0x0001);

        let bytes = store.encode("A1").unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[5], 0x01);
    }

    #[test]
    fn button_press_is_idempotent() {
        let store = store_with("A1");
        store.set_button("A1", ButtonId::Triangle, true).unwrap();
        let once = store.get("A1").unwrap().button_mask;
        store.set_button("A1", ButtonId::Triangle, true).unwrap();
        assert_eq!(store.get("A1").unwrap().button_mask, once);
        assert_eq!(once.count_ones(), 1);

        store.set_button("A1", ButtonId::Triangle, false).unwrap();
        assert_eq!(store.get("A1").unwrap().button_mask, 0);
    }

    #[test]
    fn diagonal_sets_and_clears_two_bits() {
        let store = store_with("A1");
        store.set_button("A1", ButtonId::Cross, true).unwrap();
        store.set_dpad("A1", DpadDirection::SouthEast, true).unwrap();
        let mask = store.get("A1").unwrap().button_mask;
        assert_eq!(mask, 1 | (1 << 13) | (1 << 15));

        store.set_dpad("A1", DpadDirection::SouthEast, false).unwrap();
        assert_eq!(store.get("A1").unwrap().button_mask, 1);
    }

    #[test]
    fn hard_trigger_snaps() {
        let store = store_with("A1");
        store.set_button("A1", ButtonId::R2, true).unwrap();
        let state = store.get("A1").unwrap();
        assert_eq!(state.trigger_right, 0xFF);
        assert_eq!(state.button_mask, 0);

        store.set_trigger("A1", TriggerType::Right, false).unwrap();
        assert_eq!(store.get("A1").unwrap().trigger_right, 0);
    }

    #[test]
    fn soft_trigger_ramps_up_slow_and_down_fast() {
        let store = GamepadStore::new(TriggerMode::Soft { step: 50 });
        store.register(1, "A1", ControllerKind::Xbox).unwrap();
        store.set_trigger("A1", TriggerType::Left, true).unwrap();
        assert_eq!(store.get("A1").unwrap().trigger_left, 0);

        assert_eq!(store.advance_soft_triggers(), 1);
        assert_eq!(store.get("A1").unwrap().trigger_left, 50);
        for _ in 0..10 {
            store.advance_soft_triggers();
        }
        assert_eq!(store.get("A1").unwrap().trigger_left, 255);
        assert_eq!(store.advance_soft_triggers(), 0);

        store.set_trigger("A1", TriggerType::Left, false).unwrap();
        store.advance_soft_triggers();
        assert_eq!(store.get("A1").unwrap().trigger_left, 105);
        store.advance_soft_triggers();
        store.advance_soft_triggers();
        assert_eq!(store.get("A1").unwrap().trigger_left, 0);
    }

    #[test]
    fn unknown_device_is_an_error() {
        let store = GamepadStore::new(TriggerMode::Hard);
        assert_eq!(
            store.get("nope"),
            Err(StoreError::DeviceNotFound("nope".to_string()))
        );
        assert!(store.set_button("nope", ButtonId::A, true).is_err());
        assert!(store.remove("nope").is_none());
    }

    #[test]
    fn register_replaces_and_snapshots_are_ordered() {
        let store = GamepadStore::new(TriggerMode::Hard);
        store.register(2, "b", ControllerKind::Ps4).unwrap();
        store.register(1, "a", ControllerKind::Ps4).unwrap();
        store.set_button("b", ButtonId::A, true).unwrap();
        store.register(5, "b", ControllerKind::Xbox).unwrap();

        let snapshots = store.all_snapshots();
        let ids: Vec<_> = snapshots.iter().map(|s| s.client_ref_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(snapshots[1].numeric_id, 5);
        assert_eq!(snapshots[1].button_mask, 0);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn oversized_ref_is_rejected() {
        let store = GamepadStore::new(TriggerMode::Hard);
        let id = "x".repeat(300);
        assert_eq!(
            store.register(1, &id, ControllerKind::Ps4),
            Err(StoreError::ClientRefTooLong(300))
        );
    }

    #[test]
    fn concurrent_setters_do_not_lose_bits() {
        let store = Arc::new(store_with("A1"));
        let handles: Vec<_> = [ButtonId::A, ButtonId::B, ButtonId::X, ButtonId::Y]
            .into_iter()
            .map(|button| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        store.set_button("A1", button, true).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("A1").unwrap().button_mask, 0b1111);
    }
}
