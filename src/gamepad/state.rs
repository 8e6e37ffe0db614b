//! Per-device input state and the fixed button table
//!
//! Both controller kinds share one 16-bit button mask. Buttons that sit in the
//! same physical position (Cross/A, Circle/B, ...) share the same bit, so the
//! host can decode a packet without knowing which face layout produced it.

use serde::{Deserialize, Serialize};

/// Longest client reference id that fits the one-byte length prefix
pub const MAX_CLIENT_REF_LEN: usize = 255;

// Controller layout reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    Ps4,
    Xbox,
}

impl ControllerKind {
    /// Ordinal used on the wire and in the `AddGamepad` call
    pub fn wire_value(self) -> u8 {
        match self {
            ControllerKind::Ps4 => 0,
            ControllerKind::Xbox => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ControllerKind::Ps4),
            1 => Some(ControllerKind::Xbox),
            _ => None,
        }
    }
}

// Joystick type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoystickType {
    Left,
    Right,
}

// Trigger type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    Left,
    Right,
}

/// Every button an on-screen layout can emit.
///
/// Face, shoulder, stick-click and system buttons map onto a bit of the mask.
/// `L2`/`R2`/`LT`/`RT` are analog triggers and have no bit; feeding them to
/// [`ButtonId::bit`] yields `None` and the store routes them to the trigger
/// setter instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ButtonId {
    // Xbox face layout
    A,
    B,
    X,
    Y,
    LB,
    RB,
    LT,
    RT,
    Menu,
    Back,
    Xbox,

    // PS4 face layout
    Cross,
    Circle,
    Square,
    Triangle,
    L1,
    R1,
    L2,
    R2,
    Options,
    Share,
    Ps,
    TouchPad,

    // Stick clicks, shared
    LS,
    RS,
}

impl ButtonId {
    /// Bit 0 on either layout
    pub const PRIMARY_ACTION: ButtonId = ButtonId::A;

    pub fn bit(self) -> Option<u8> {
        match self {
            ButtonId::A | ButtonId::Cross => Some(0),
            ButtonId::B | ButtonId::Circle => Some(1),
            ButtonId::X | ButtonId::Square => Some(2),
            ButtonId::Y | ButtonId::Triangle => Some(3),
            ButtonId::LB | ButtonId::L1 => Some(4),
            ButtonId::RB | ButtonId::R1 => Some(5),
            ButtonId::LS => Some(6),
            ButtonId::RS => Some(7),
            ButtonId::Menu | ButtonId::Options => Some(8),
            ButtonId::Back | ButtonId::Share => Some(9),
            ButtonId::Xbox | ButtonId::Ps => Some(10),
            ButtonId::TouchPad => Some(11),
            ButtonId::LT | ButtonId::RT | ButtonId::L2 | ButtonId::R2 => None,
        }
    }

    /// Trigger side for the analog buttons
    pub fn trigger(self) -> Option<TriggerType> {
        match self {
            ButtonId::LT | ButtonId::L2 => Some(TriggerType::Left),
            ButtonId::RT | ButtonId::R2 => Some(TriggerType::Right),
            _ => None,
        }
    }
}

/// D-pad directions; diagonals press two cardinal bits at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DpadDirection {
    North,
    South,
    West,
    East,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl DpadDirection {
    pub fn bits(self) -> &'static [u8] {
        match self {
            DpadDirection::North => &[12],
            DpadDirection::South => &[13],
            DpadDirection::West => &[14],
            DpadDirection::East => &[15],
            DpadDirection::NorthEast => &[12, 15],
            DpadDirection::NorthWest => &[12, 14],
            DpadDirection::SouthEast => &[13, 15],
            DpadDirection::SouthWest => &[13, 14],
        }
    }

    pub fn mask(self) -> u16 {
        self.bits().iter().fold(0u16, |mask, bit| mask | (1 << bit))
    }
}

/// Complete input state of one virtual device, exactly as it goes on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub numeric_id: u8,
    pub client_ref_id: String,
    pub kind: ControllerKind,
    pub button_mask: u16,
    // Trigger bytes; the wire treats them as signed, 0xFF is fully pressed
    pub trigger_left: u8,
    pub trigger_right: u8,
    pub stick_left_x: i16,
    pub stick_left_y: i16,
    pub stick_right_x: i16,
    pub stick_right_y: i16,
}

impl DeviceState {
    pub fn new(numeric_id: u8, client_ref_id: impl Into<String>, kind: ControllerKind) -> Self {
        Self {
            numeric_id,
            client_ref_id: client_ref_id.into(),
            kind,
            button_mask: 0,
            trigger_left: 0,
            trigger_right: 0,
            stick_left_x: 0,
            stick_left_y: 0,
            stick_right_x: 0,
            stick_right_y: 0,
        }
    }

    pub fn apply_bit(&mut self, bit: u8, pressed: bool) {
        if pressed {
            self.button_mask |= 1 << bit;
        } else {
            self.button_mask &= !(1 << bit);
        }
    }

    pub fn apply_dpad(&mut self, direction: DpadDirection, pressed: bool) {
        for bit in direction.bits() {
            self.apply_bit(*bit, pressed);
        }
    }

    pub fn set_trigger_value(&mut self, trigger: TriggerType, value: u8) {
        match trigger {
            TriggerType::Left => self.trigger_left = value,
            TriggerType::Right => self.trigger_right = value,
        }
    }

    pub fn set_stick(&mut self, stick: JoystickType, x: i16, y: i16) {
        match stick {
            JoystickType::Left => {
                self.stick_left_x = x;
                self.stick_left_y = y;
            }
            JoystickType::Right => {
                self.stick_right_x = x;
                self.stick_right_y = y;
            }
        }
    }
}
