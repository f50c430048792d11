//! Controller input overrides and the `controller` surface.
//!
//! Scripts never touch the emulated controller directly. They fill per-port
//! override tables during a frame, and the input collaborator folds those
//! tables into whatever the real controller reported when it next polls
//! that port. Tables are one-shot: [`ControllerOverrides::end_frame`] clears
//! them so a script has to re-assert overrides every frame.

use crate::api::{Args, FunctionMetadata, ScriptApi};
use crate::error::BridgeError;
use crate::script_value::ScriptValue;
use bitflags::bitflags;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use tracing::trace;

pub const PORT_COUNT: usize = 4;

pub const CONTROLLER_CLASS: &str = "controller";

bitflags! {
    #[derive(Default)]
    pub struct Buttons: u16 {
        const A = 1 << 0;
        const B = 1 << 1;
        const X = 1 << 2;
        const Y = 1 << 3;
        const Z = 1 << 4;
        const L = 1 << 5;
        const R = 1 << 6;
        const START = 1 << 7;
        const DPAD_UP = 1 << 8;
        const DPAD_DOWN = 1 << 9;
        const DPAD_LEFT = 1 << 10;
        const DPAD_RIGHT = 1 << 11;
    }
}

const BUTTON_NAMES: &[(&str, Buttons)] = &[
    ("A", Buttons::A),
    ("B", Buttons::B),
    ("X", Buttons::X),
    ("Y", Buttons::Y),
    ("Z", Buttons::Z),
    ("L", Buttons::L),
    ("R", Buttons::R),
    ("Start", Buttons::START),
    ("dPadUp", Buttons::DPAD_UP),
    ("dPadDown", Buttons::DPAD_DOWN),
    ("dPadLeft", Buttons::DPAD_LEFT),
    ("dPadRight", Buttons::DPAD_RIGHT),
];

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != ' ')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl Buttons {
    /// Look up a single button by script name, ignoring case and `_`.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        BUTTON_NAMES
            .iter()
            .find(|(n, _)| normalize(n) == wanted)
            .map(|(_, b)| *b)
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        BUTTON_NAMES
            .iter()
            .filter(move |(_, b)| self.contains(*b))
            .map(|(n, _)| *n)
    }
}

/// Analog inputs, each a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalogAxis {
    StickX,
    StickY,
    CStickX,
    CStickY,
    TriggerL,
    TriggerR,
}

impl AnalogAxis {
    pub const ALL: [Self; 6] = [
        Self::StickX,
        Self::StickY,
        Self::CStickX,
        Self::CStickY,
        Self::TriggerL,
        Self::TriggerR,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::StickX => "analogStickX",
            Self::StickY => "analogStickY",
            Self::CStickX => "cStickX",
            Self::CStickY => "cStickY",
            Self::TriggerL => "triggerL",
            Self::TriggerR => "triggerR",
        }
    }

    /// Resting value: sticks center at 128, triggers rest at 0.
    pub const fn neutral(self) -> u8 {
        match self {
            Self::TriggerL | Self::TriggerR => 0,
            _ => 128,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = normalize(name);
        Self::ALL
            .into_iter()
            .find(|axis| normalize(axis.name()) == wanted)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Complete input state of one controller for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControllerState {
    pub buttons: Buttons,
    analog: [u8; 6],
    pub connected: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::neutral()
    }
}

impl ControllerState {
    /// Connected, nothing pressed, sticks centered.
    pub fn neutral() -> Self {
        Self {
            buttons: Buttons::empty(),
            analog: AnalogAxis::ALL.map(AnalogAxis::neutral),
            connected: true,
        }
    }

    pub fn axis(&self, axis: AnalogAxis) -> u8 {
        self.analog[axis.index()]
    }

    pub fn set_axis(&mut self, axis: AnalogAxis, value: u8) {
        self.analog[axis.index()] = value;
    }

    pub fn with_buttons(mut self, buttons: Buttons) -> Self {
        self.buttons = buttons;
        self
    }
}

/// Partial input state: only the buttons and axes a script mentioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputPatch {
    pub mentioned: Buttons,
    pub pressed: Buttons,
    pub analog: [Option<u8>; 6],
    pub connected: Option<bool>,
}

impl InputPatch {
    pub fn press(mut self, buttons: Buttons) -> Self {
        self.mentioned |= buttons;
        self.pressed |= buttons;
        self
    }

    pub fn release(mut self, buttons: Buttons) -> Self {
        self.mentioned |= buttons;
        self.pressed &= !buttons;
        self
    }

    pub fn axis(mut self, axis: AnalogAxis, value: u8) -> Self {
        self.analog[axis.index()] = Some(value);
        self
    }

    pub fn apply_to(&self, state: &mut ControllerState) {
        state.buttons = (state.buttons & !self.mentioned) | (self.pressed & self.mentioned);
        for axis in AnalogAxis::ALL {
            if let Some(value) = self.analog[axis.index()] {
                state.set_axis(axis, value);
            }
        }
        if let Some(connected) = self.connected {
            state.connected = connected;
        }
    }

    /// Later patches win for everything they mention.
    pub fn merge(&mut self, later: &Self) {
        self.pressed = (self.pressed & !later.mentioned) | (later.pressed & later.mentioned);
        self.mentioned |= later.mentioned;
        for (mine, theirs) in self.analog.iter_mut().zip(later.analog) {
            if theirs.is_some() {
                *mine = theirs;
            }
        }
        if later.connected.is_some() {
            self.connected = later.connected;
        }
    }
}

/// A probability in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Probability(f64);

impl Probability {
    pub fn new(value: f64) -> Result<Self, BridgeError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(BridgeError::InvalidProbability(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    fn roll<R: Rng + ?Sized>(self, rng: &mut R) -> bool {
        rng.random::<f64>() < self.0
    }
}

/// A randomized input perturbation, checked once per poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbabilityEvent {
    Press {
        probability: Probability,
        buttons: Buttons,
    },
    Release {
        probability: Probability,
        buttons: Buttons,
    },
    Flip {
        probability: Probability,
        buttons: Buttons,
    },
    Combo {
        probability: Probability,
        buttons: Buttons,
        release_others: bool,
    },
    /// Nudge the current axis value by up to `max_delta` either way.
    AnalogDelta {
        probability: Probability,
        axis: AnalogAxis,
        max_delta: u8,
    },
    /// Set the axis to `base` nudged by up to `max_delta` either way.
    AnalogFromBase {
        probability: Probability,
        axis: AnalogAxis,
        base: u8,
        max_delta: u8,
    },
    /// Release everything and center every axis.
    Clear { probability: Probability },
}

fn nudge<R: Rng + ?Sized>(value: u8, max_delta: u8, rng: &mut R) -> u8 {
    let max = i32::from(max_delta);
    let delta = rng.random_range(-max..=max);
    (i32::from(value) + delta).clamp(0, 255) as u8
}

impl ProbabilityEvent {
    pub fn probability(&self) -> Probability {
        match self {
            Self::Press { probability, .. }
            | Self::Release { probability, .. }
            | Self::Flip { probability, .. }
            | Self::Combo { probability, .. }
            | Self::AnalogDelta { probability, .. }
            | Self::AnalogFromBase { probability, .. }
            | Self::Clear { probability } => *probability,
        }
    }

    /// Roll the event and apply it when it fires.
    pub fn apply<R: Rng + ?Sized>(&self, state: &mut ControllerState, rng: &mut R) -> bool {
        if !self.probability().roll(rng) {
            return false;
        }
        match *self {
            Self::Press { buttons, .. } => state.buttons.insert(buttons),
            Self::Release { buttons, .. } => state.buttons.remove(buttons),
            Self::Flip { buttons, .. } => state.buttons.toggle(buttons),
            Self::Combo {
                buttons,
                release_others,
                ..
            } => {
                if release_others {
                    state.buttons = buttons;
                } else {
                    state.buttons.insert(buttons);
                }
            }
            Self::AnalogDelta {
                axis, max_delta, ..
            } => {
                let value = nudge(state.axis(axis), max_delta, rng);
                state.set_axis(axis, value);
            }
            Self::AnalogFromBase {
                axis,
                base,
                max_delta,
                ..
            } => {
                let value = nudge(base, max_delta, rng);
                state.set_axis(axis, value);
            }
            Self::Clear { .. } => {
                *state = ControllerState {
                    connected: state.connected,
                    ..ControllerState::neutral()
                };
            }
        }
        true
    }
}

/// Overrides registered for one port during the current frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortOverride {
    pub overwrite: Option<ControllerState>,
    pub add: Option<InputPatch>,
    pub random_events: Vec<ProbabilityEvent>,
}

impl PortOverride {
    pub fn is_empty(&self) -> bool {
        self.overwrite.is_none() && self.add.is_none() && self.random_events.is_empty()
    }
}

/// Override tables for every port.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerOverrides {
    ports: [PortOverride; PORT_COUNT],
}

/// Override tables shared between sessions and the input collaborator.
pub type SharedOverrides = Arc<Mutex<ControllerOverrides>>;

pub fn shared_overrides() -> SharedOverrides {
    Arc::new(Mutex::new(ControllerOverrides::default()))
}

impl ControllerOverrides {
    pub fn port(&self, port: usize) -> Option<&PortOverride> {
        self.ports.get(port)
    }

    fn port_mut(&mut self, port: usize) -> Result<&mut PortOverride, BridgeError> {
        self.ports
            .get_mut(port)
            .ok_or(BridgeError::InvalidPort(port as i64 + 1))
    }

    /// Replace the port's input outright (last call in a frame wins).
    pub fn set_inputs(&mut self, port: usize, state: ControllerState) -> Result<(), BridgeError> {
        self.port_mut(port)?.overwrite = Some(state);
        Ok(())
    }

    /// Merge buttons and axes into the port's input.
    pub fn add_inputs(&mut self, port: usize, patch: InputPatch) -> Result<(), BridgeError> {
        let slot = self.port_mut(port)?;
        match &mut slot.add {
            Some(existing) => existing.merge(&patch),
            None => slot.add = Some(patch),
        }
        Ok(())
    }

    pub fn add_event(&mut self, port: usize, event: ProbabilityEvent) -> Result<(), BridgeError> {
        self.port_mut(port)?.random_events.push(event);
        Ok(())
    }

    /// Fold this frame's overrides for `port` into `current`.
    ///
    /// Order is fixed: overwrite, then add, then each random event in
    /// registration order.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        port: usize,
        current: ControllerState,
        rng: &mut R,
    ) -> ControllerState {
        let Some(slot) = self.ports.get(port) else {
            return current;
        };
        let mut state = slot.overwrite.unwrap_or(current);
        if let Some(patch) = &slot.add {
            patch.apply_to(&mut state);
        }
        let mut fired = 0usize;
        for event in &slot.random_events {
            if event.apply(&mut state, rng) {
                fired += 1;
            }
        }
        if !slot.is_empty() {
            trace!(port = port + 1, fired, "applied controller overrides");
        }
        state
    }

    /// Drop every table; called once the frame's input has been consumed.
    pub fn end_frame(&mut self) {
        for slot in &mut self.ports {
            *slot = PortOverride::default();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(PortOverride::is_empty)
    }
}

const FUNCTIONS: &[FunctionMetadata] = &[
    FunctionMetadata::new(
        "set_inputs",
        "controller:set_inputs(1, {A = true, analogStickX = 200})",
    ),
    FunctionMetadata::new("add_inputs", "controller:add_inputs(1, {B = true})"),
    FunctionMetadata::new(
        "add_button_press_chance",
        "controller:add_button_press_chance(1, 0.5, \"A\")",
    ),
    FunctionMetadata::new(
        "add_button_release_chance",
        "controller:add_button_release_chance(1, 0.5, \"A\")",
    ),
    FunctionMetadata::new(
        "add_button_flip_chance",
        "controller:add_button_flip_chance(1, 0.5, \"A\")",
    ),
    FunctionMetadata::new(
        "add_button_combo_chance",
        "controller:add_button_combo_chance(1, 0.5, {A = true, B = true}, false)",
    ),
    FunctionMetadata::new(
        "add_or_subtract_from_current_analog_value_chance",
        "controller:add_or_subtract_from_current_analog_value_chance(1, 0.5, \"cStickX\", 20)",
    ),
    FunctionMetadata::new(
        "add_or_subtract_from_specific_analog_value_chance",
        "controller:add_or_subtract_from_specific_analog_value_chance(1, 0.5, \"cStickX\", 128, 20)",
    ),
    FunctionMetadata::new(
        "add_controller_clear_chance",
        "controller:add_controller_clear_chance(1, 0.5)",
    ),
];

/// Script access to the override tables.
pub struct ControllerApi {
    overrides: SharedOverrides,
}

impl ControllerApi {
    pub fn new(overrides: SharedOverrides) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> &SharedOverrides {
        &self.overrides
    }
}

/// Scripts number ports from 1; tables are indexed from 0.
fn port_arg(args: &Args<'_>, position: usize) -> Result<usize, BridgeError> {
    let port = args.integer(position)?;
    if (1..=PORT_COUNT as i64).contains(&port) {
        Ok((port - 1) as usize)
    } else {
        Err(BridgeError::InvalidPort(port))
    }
}

fn probability_arg(args: &Args<'_>, position: usize) -> Result<Probability, BridgeError> {
    Probability::new(args.number(position)?)
}

fn byte_arg(args: &Args<'_>, position: usize) -> Result<u8, BridgeError> {
    let value = args.integer(position)?;
    u8::try_from(value).map_err(|_| BridgeError::InvalidArgument {
        position,
        expected: "integer between 0 and 255",
        found: value.to_string(),
    })
}

fn button_arg(args: &Args<'_>, position: usize) -> Result<Buttons, BridgeError> {
    let name = args.string(position)?;
    Buttons::from_name(&name).ok_or(BridgeError::UnknownButton(name))
}

fn axis_arg(args: &Args<'_>, position: usize) -> Result<AnalogAxis, BridgeError> {
    let name = args.string(position)?;
    AnalogAxis::from_name(&name).ok_or(BridgeError::UnknownButton(name))
}

fn key_name(key: &ScriptValue) -> String {
    match key {
        ScriptValue::String(s) => s.to_string(),
        other => other.to_string(),
    }
}

/// Parse `{A = true, analogStickX = 200, connected = false}`.
fn patch_from_table(args: &Args<'_>, position: usize) -> Result<InputPatch, BridgeError> {
    let mut patch = InputPatch::default();
    for (key, value) in args.table(position)? {
        let name = key_name(key);
        if let Some(button) = Buttons::from_name(&name) {
            patch = if value.truthy() {
                patch.press(button)
            } else {
                patch.release(button)
            };
        } else if let Some(axis) = AnalogAxis::from_name(&name) {
            let byte = value
                .coerce_signed()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| BridgeError::InvalidArgument {
                    position,
                    expected: "analog value between 0 and 255",
                    found: value.to_string(),
                })?;
            patch = patch.axis(axis, byte);
        } else if normalize(&name) == "connected" {
            patch.connected = Some(value.truthy());
        } else {
            return Err(BridgeError::UnknownButton(name));
        }
    }
    Ok(patch)
}

/// Buttons from either a list of names or a `{A = true}` table.
fn buttons_from_table(args: &Args<'_>, position: usize) -> Result<Buttons, BridgeError> {
    let mut buttons = Buttons::empty();
    for (key, value) in args.table(position)? {
        let name = match value {
            ScriptValue::String(s) => s.to_string(),
            _ if value.truthy() => key_name(key),
            _ => continue,
        };
        buttons |= Buttons::from_name(&name).ok_or(BridgeError::UnknownButton(name))?;
    }
    Ok(buttons)
}

impl ScriptApi for ControllerApi {
    fn class_name(&self) -> &'static str {
        CONTROLLER_CLASS
    }

    fn functions(&self) -> &'static [FunctionMetadata] {
        FUNCTIONS
    }

    fn dispatch(
        &self,
        function: &'static str,
        args: &Args<'_>,
    ) -> Result<ScriptValue, BridgeError> {
        let port = port_arg(args, 1)?;
        match function {
            "set_inputs" => {
                let mut state = ControllerState::neutral();
                patch_from_table(args, 2)?.apply_to(&mut state);
                self.overrides.lock().set_inputs(port, state)?;
            }
            "add_inputs" => {
                let patch = patch_from_table(args, 2)?;
                self.overrides.lock().add_inputs(port, patch)?;
            }
            _ => {
                let event = parse_event(function, args)?;
                self.overrides.lock().add_event(port, event)?;
            }
        }
        Ok(ScriptValue::Nil)
    }
}

fn parse_event(function: &str, args: &Args<'_>) -> Result<ProbabilityEvent, BridgeError> {
    let probability = probability_arg(args, 2)?;
    let event = match function {
        "add_button_press_chance" => ProbabilityEvent::Press {
            probability,
            buttons: button_arg(args, 3)?,
        },
        "add_button_release_chance" => ProbabilityEvent::Release {
            probability,
            buttons: button_arg(args, 3)?,
        },
        "add_button_flip_chance" => ProbabilityEvent::Flip {
            probability,
            buttons: button_arg(args, 3)?,
        },
        "add_button_combo_chance" => ProbabilityEvent::Combo {
            probability,
            buttons: buttons_from_table(args, 3)?,
            release_others: args.boolean(4)?,
        },
        "add_or_subtract_from_current_analog_value_chance" => ProbabilityEvent::AnalogDelta {
            probability,
            axis: axis_arg(args, 3)?,
            max_delta: byte_arg(args, 4)?,
        },
        "add_or_subtract_from_specific_analog_value_chance" => {
            ProbabilityEvent::AnalogFromBase {
                probability,
                axis: axis_arg(args, 3)?,
                base: byte_arg(args, 4)?,
                max_delta: byte_arg(args, 5)?,
            }
        }
        "add_controller_clear_chance" => ProbabilityEvent::Clear { probability },
        other => return Err(BridgeError::UnknownFunction(other.to_string())),
    };
    Ok(event)
}
