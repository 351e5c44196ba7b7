use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use smart_leds::RGB8;

use crate::color::ColorClass;
use crate::control::MotorCommand;
use crate::motors::{Direction, MotorTarget, NUM_MOTORS};

pub const CONTROL_QUEUE_LEN: usize = 8;
pub const MOTOR_QUEUE_LEN: usize = 10;
pub const TRIGGER_QUEUE_LEN: usize = 10;

pub type ControlChannel = Channel<CriticalSectionRawMutex, ControlMessage, CONTROL_QUEUE_LEN>;
pub type MotorQueue = Channel<CriticalSectionRawMutex, MotorTarget, MOTOR_QUEUE_LEN>;
pub type TriggerChannel = Channel<CriticalSectionRawMutex, Instant, TRIGGER_QUEUE_LEN>;
pub type DisplaySignal = Signal<CriticalSectionRawMutex, RGB8>;

/// Everything the controller reacts to.
pub static CONTROL_CHANNEL: ControlChannel = Channel::new();
/// One queue per motor, drained by that motor's task only.
pub static MOTOR_QUEUES: [MotorQueue; NUM_MOTORS] = [Channel::new(), Channel::new()];
/// Timestamps of sensor edges, filled from the edge handler.
pub static TRIGGER_CHANNEL: TriggerChannel = Channel::new();

pub static INDICATOR_SIGNAL: DisplaySignal = Signal::new();
pub static HEADLIGHT_SIGNAL: DisplaySignal = Signal::new();
pub static TAILLIGHT_SIGNAL: DisplaySignal = Signal::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Color(ColorClass),
    Command(MotorCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    TooShort(usize),
    WrongLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    InvalidMotor(usize),
    QueueFull(usize),
}

fn direction(byte: u8) -> Direction {
    if byte == 0 {
        Direction::Backward
    } else {
        Direction::Forward
    }
}

/// `[speed A, dir A, speed B, dir B, duration]`. Extra trailing bytes are
/// ignored, speeds clamp to 100.
pub fn parse_motor_command(data: &[u8]) -> Result<MotorCommand, PayloadError> {
    let [speed_a, dir_a, speed_b, dir_b, duration, ..] = *data else {
        return Err(PayloadError::TooShort(data.len()));
    };

    Ok(MotorCommand::new(
        speed_a.min(100),
        direction(dir_a),
        speed_b.min(100),
        direction(dir_b),
        duration as u32,
    ))
}

pub fn parse_headlight(data: &[u8]) -> Result<RGB8, PayloadError> {
    match *data {
        [r, g, b] => Ok(RGB8::new(r, g, b)),
        _ => Err(PayloadError::WrongLength(data.len())),
    }
}

/// Write handler for the motor characteristic, the entry point for a GATT
/// layer. Never blocks: a full control queue drops the command.
pub fn on_motor_write(data: &[u8], channel: &ControlChannel) -> Result<(), PayloadError> {
    let command = parse_motor_command(data)?;
    log::info!("Received motor packet: {:?}", data);
    if channel.try_send(ControlMessage::Command(command)).is_err() {
        log::error!("Control queue full, dropping {:?}", command);
    }
    Ok(())
}

/// Write handler for the headlight characteristic. Goes straight to the
/// LEDs, the controller never sees it.
pub fn on_headlight_write(data: &[u8], signal: &DisplaySignal) -> Result<(), PayloadError> {
    let color = parse_headlight(data)?;
    signal.signal(color);
    Ok(())
}

pub fn dispatch(queues: &[MotorQueue], target: MotorTarget) -> Result<(), DispatchError> {
    let queue = queues
        .get(target.motor)
        .ok_or(DispatchError::InvalidMotor(target.motor))?;
    queue
        .try_send(target)
        .map_err(|_| DispatchError::QueueFull(target.motor))
}
