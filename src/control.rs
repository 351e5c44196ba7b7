use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use embassy_time::{Duration, Instant, Timer};

use crate::color::ColorClass;
use crate::comm::{dispatch, ControlMessage, DisplaySignal, MotorQueue};
use crate::game::{self, GameEffect, GameState};
use crate::motors::{Direction, MotorTarget, NUM_MOTORS};

const DURATION_UNIT: u64 = 100; // ms per command duration count
const SPIN_OUT_SPEED: u8 = 80;
const SPIN_OUT_DURATION: u32 = 10;
const SPEED_UP_STEP: u8 = 10;
const SLOW_DOWN_STEP: u8 = 30;

pub struct Config {
    /// Wall time of one count of `MotorCommand::duration`.
    pub duration_unit: Duration,
    pub spin_out_speed: u8,
    pub spin_out_duration: u32,
    pub speed_up_step: u8,
    pub slow_down_step: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            duration_unit: Duration::from_millis(DURATION_UNIT),
            spin_out_speed: SPIN_OUT_SPEED,
            spin_out_duration: SPIN_OUT_DURATION,
            speed_up_step: SPEED_UP_STEP,
            slow_down_step: SLOW_DOWN_STEP,
        }
    }
}

/// A drive request for both motors, as received from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub speed_a: u8,
    pub direction_a: Direction,
    pub speed_b: u8,
    pub direction_b: Direction,
    /// Counts of `Config::duration_unit` before the motors are stopped.
    /// 0 keeps driving until the next command.
    pub duration: u32,
}

impl MotorCommand {
    pub fn new(
        speed_a: u8,
        direction_a: Direction,
        speed_b: u8,
        direction_b: Direction,
        duration: u32,
    ) -> Self {
        Self {
            speed_a,
            direction_a,
            speed_b,
            direction_b,
            duration,
        }
    }

    pub fn targets(&self) -> [MotorTarget; NUM_MOTORS] {
        [
            MotorTarget {
                motor: 0,
                speed: self.speed_a,
                direction: self.direction_a,
            },
            MotorTarget {
                motor: 1,
                speed: self.speed_b,
                direction: self.direction_b,
            },
        ]
    }

    /// Same directions, zero speed: stops without reversing first.
    pub fn stopped(&self) -> Self {
        Self {
            speed_a: 0,
            speed_b: 0,
            duration: 0,
            ..*self
        }
    }
}

impl Default for MotorCommand {
    fn default() -> Self {
        Self::new(0, Direction::Forward, 0, Direction::Forward, 0)
    }
}

/// Rewrites a base command according to the active effect.
pub fn apply_effect(effect: GameEffect, base: MotorCommand, config: &Config) -> MotorCommand {
    let mut command = base;
    match effect {
        GameEffect::Off => {}
        GameEffect::SpinOut => {
            command.speed_a = config.spin_out_speed;
            command.direction_a = Direction::Forward;
            command.speed_b = config.spin_out_speed;
            command.direction_b = Direction::Backward;
            command.duration = config.spin_out_duration;
        }
        GameEffect::SpeedUp => {
            let step = config.speed_up_step as u16;
            if (command.speed_a as u16 + step) < 100 && (command.speed_b as u16 + step) < 100 {
                command.speed_a += config.speed_up_step;
                command.speed_b += config.speed_up_step;
            }
        }
        GameEffect::SlowDown => {
            let step = config.slow_down_step;
            if command.speed_a > step && command.speed_b > step {
                command.speed_a -= step;
                command.speed_b -= step;
            }
        }
    }
    command
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub effect: bool,
    pub watchdog: bool,
}

/// Sole owner of the game state and the command watchdog.
pub struct Controller {
    game: GameState,
    watchdog: Option<Instant>,
    active: MotorCommand,
    config: Config,
}

impl Controller {
    pub fn new(game: GameState, config: Config) -> Self {
        Self {
            game,
            watchdog: None,
            active: MotorCommand::default(),
            config,
        }
    }

    pub fn effect(&self) -> GameEffect {
        self.game.effect()
    }

    pub fn watchdog(&self) -> Option<Instant> {
        self.watchdog
    }

    pub fn on_color(&mut self, color: ColorClass, now: Instant) -> Option<GameEffect> {
        self.game.on_color(color, now)
    }

    /// Merges `base` with the current effect and (re)arms the watchdog.
    pub fn on_command(&mut self, base: MotorCommand, now: Instant) -> MotorCommand {
        let command = apply_effect(self.game.effect(), base, &self.config);

        self.watchdog = match command.duration {
            0 => None,
            counts => Some(now + self.config.duration_unit * counts),
        };
        self.active = command;

        log::info!(
            "Motor command A {}% {:?}, B {}% {:?}, duration {} ({:?})",
            command.speed_a,
            command.direction_a,
            command.speed_b,
            command.direction_b,
            command.duration,
            self.game.effect()
        );
        command
    }

    /// The earliest pending effect or watchdog deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.game.deadline(), self.watchdog) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires whatever deadlines `now` has reached. On a watchdog expiry the
    /// caller must push [`Controller::stop_targets`].
    pub fn on_timeout(&mut self, now: Instant) -> Expired {
        let effect = self.game.expire(now);
        let watchdog = match self.watchdog {
            Some(deadline) if now >= deadline => {
                self.watchdog = None;
                self.active = self.active.stopped();
                true
            }
            _ => false,
        };
        Expired { effect, watchdog }
    }

    pub fn stop_targets(&self) -> [MotorTarget; NUM_MOTORS] {
        self.active.stopped().targets()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(GameState::new(game::Config::default()), Config::default())
    }
}

fn push_targets(queues: &[MotorQueue], targets: [MotorTarget; NUM_MOTORS]) {
    for target in targets {
        if let Err(e) = dispatch(queues, target) {
            log::error!("Failed to send update for motor {}: {:?}", target.motor, e);
        }
    }
}

/// Runs the controller: the only place game state and watchdog change.
///
/// Deadlines are waited on in the same `select` as incoming messages, so
/// expiry is just another event for this task.
pub async fn control_loop<const N: usize>(
    controller: &mut Controller,
    events: Receiver<'_, CriticalSectionRawMutex, ControlMessage, N>,
    queues: &[MotorQueue],
    indicator: &DisplaySignal,
) -> ! {
    log::info!("Starting control loop");
    loop {
        let message = match controller.next_deadline() {
            Some(deadline) => match select(Timer::at(deadline), events.receive()).await {
                Either::First(()) => None,
                Either::Second(message) => Some(message),
            },
            None => Some(events.receive().await),
        };
        let now = Instant::now();

        // Expire first so a late message never sees a stale effect
        let expired = controller.on_timeout(now);
        if expired.effect {
            indicator.signal(GameEffect::Off.indicator());
        }
        if expired.watchdog {
            log::info!("Command timer expired, stopping motors");
            push_targets(queues, controller.stop_targets());
        }

        match message {
            Some(ControlMessage::Color(color)) => {
                if let Some(effect) = controller.on_color(color, now) {
                    indicator.signal(effect.indicator());
                }
            }
            Some(ControlMessage::Command(base)) => {
                let command = controller.on_command(base, now);
                push_targets(queues, command.targets());
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{on_motor_write, ControlChannel};
    use embassy_sync::channel::Channel;
    use embassy_sync::signal::Signal;

    use Direction::{Backward, Forward};

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn command(a: u8, b: u8, duration: u32) -> MotorCommand {
        MotorCommand::new(a, Forward, b, Forward, duration)
    }

    #[test]
    fn off_leaves_command_unchanged() {
        let config = Config::default();
        for a in (0..=100).step_by(7) {
            for b in (0..=100).step_by(11) {
                for (da, db) in [(Forward, Backward), (Backward, Forward)] {
                    let base = MotorCommand::new(a, da, b, db, (a as u32) % 4);
                    assert_eq!(apply_effect(GameEffect::Off, base, &config), base);
                }
            }
        }
    }

    #[test]
    fn speed_up_adds_step() {
        let merged = apply_effect(GameEffect::SpeedUp, command(60, 60, 5), &Config::default());
        assert_eq!(merged, command(70, 70, 5));
    }

    #[test]
    fn speed_up_never_exceeds_full_speed() {
        let config = Config::default();
        for a in 0..=100u8 {
            for b in 0..=100u8 {
                let merged = apply_effect(GameEffect::SpeedUp, command(a, b, 0), &config);
                assert!(merged.speed_a <= 100 && merged.speed_b <= 100);
            }
        }

        assert_eq!(
            apply_effect(GameEffect::SpeedUp, command(89, 20, 0), &config),
            command(99, 30, 0)
        );
        assert_eq!(
            apply_effect(GameEffect::SpeedUp, command(90, 20, 0), &config),
            command(90, 20, 0)
        );
    }

    #[test]
    fn slow_down_only_when_both_motors_are_fast_enough() {
        let config = Config::default();
        assert_eq!(
            apply_effect(GameEffect::SlowDown, command(60, 31, 3), &config),
            command(30, 1, 3)
        );
        assert_eq!(
            apply_effect(GameEffect::SlowDown, command(60, 30, 3), &config),
            command(60, 30, 3)
        );
        for a in 0..=100u8 {
            for b in 0..=100u8 {
                let merged = apply_effect(GameEffect::SlowDown, command(a, b, 0), &config);
                assert!(merged.speed_a <= a && merged.speed_b <= b);
            }
        }
    }

    #[test]
    fn spin_out_overrides_command() {
        let merged = apply_effect(GameEffect::SpinOut, command(20, 90, 0), &Config::default());
        assert_eq!(merged, MotorCommand::new(80, Forward, 80, Backward, 10));
    }

    #[test]
    fn watchdog_armed_in_duration_units() {
        let mut controller = Controller::default();
        controller.on_command(command(60, 60, 5), at(1_000));
        assert_eq!(controller.watchdog(), Some(at(1_500)));

        assert_eq!(controller.on_timeout(at(1_499)), Expired::default());
        let expired = controller.on_timeout(at(1_500));
        assert!(expired.watchdog);
        assert_eq!(controller.watchdog(), None);
        assert_eq!(
            controller.stop_targets(),
            [MotorTarget::stop(0), MotorTarget::stop(1)]
        );
    }

    #[test]
    fn new_command_resets_watchdog() {
        let mut controller = Controller::default();
        controller.on_command(command(60, 60, 5), at(1_000));
        controller.on_command(command(40, 40, 5), at(1_300));

        assert_eq!(controller.watchdog(), Some(at(1_800)));
        assert!(!controller.on_timeout(at(1_500)).watchdog);
    }

    #[test]
    fn zero_duration_runs_continuously() {
        let mut controller = Controller::default();
        controller.on_command(command(60, 60, 5), at(0));
        controller.on_command(command(60, 60, 0), at(100));

        assert_eq!(controller.watchdog(), None);
        assert_eq!(controller.next_deadline(), None);
    }

    #[test]
    fn stop_keeps_last_directions() {
        let mut controller = Controller::default();
        controller.on_command(MotorCommand::new(50, Backward, 40, Forward, 2), at(0));
        controller.on_timeout(at(200));

        let [a, b] = controller.stop_targets();
        assert_eq!((a.speed, a.direction), (0, Backward));
        assert_eq!((b.speed, b.direction), (0, Forward));
    }

    #[test]
    fn commands_follow_the_active_effect() {
        let mut controller = Controller::default();
        controller.on_color(ColorClass::Blue, at(0));
        assert_eq!(controller.on_command(command(60, 60, 0), at(10)), command(30, 30, 0));

        controller.on_timeout(at(10_000));
        assert_eq!(controller.effect(), GameEffect::Off);
        assert_eq!(controller.on_command(command(60, 60, 0), at(10_001)), command(60, 60, 0));
    }

    #[test]
    fn spin_out_command_arms_its_own_watchdog() {
        let mut controller = Controller::default();
        controller.on_color(ColorClass::Yellow, at(0));
        controller.on_command(command(60, 60, 0), at(100));

        assert_eq!(controller.watchdog(), Some(at(1_100)));
        // Effect deadline at 1000 ms comes first
        assert_eq!(controller.next_deadline(), Some(at(1_000)));

        let expired = controller.on_timeout(at(1_100));
        assert_eq!(
            expired,
            Expired {
                effect: true,
                watchdog: true
            }
        );
    }

    #[test]
    fn loop_merges_and_enqueues_targets() {
        let events: Channel<CriticalSectionRawMutex, ControlMessage, 4> = Channel::new();
        let queues: [MotorQueue; NUM_MOTORS] = [Channel::new(), Channel::new()];
        let indicator: DisplaySignal = Signal::new();
        let mut controller = Controller::default();

        events.try_send(ControlMessage::Color(ColorClass::Red)).unwrap();
        events.try_send(ControlMessage::Command(command(60, 60, 0))).unwrap();

        let res = embassy_futures::block_on(select(
            control_loop(&mut controller, events.receiver(), &queues, &indicator),
            async {},
        ));

        assert!(matches!(res, Either::Second(())));
        assert_eq!(indicator.try_take(), Some(GameEffect::SpeedUp.indicator()));
        let a = queues[0].try_receive().unwrap();
        let b = queues[1].try_receive().unwrap();
        assert_eq!((a.motor, a.speed, a.direction), (0, 70, Forward));
        assert_eq!((b.motor, b.speed, b.direction), (1, 70, Forward));
        assert!(queues[0].is_empty() && queues[1].is_empty());
    }

    fn drain(queue: &MotorQueue) -> Vec<(u8, Direction)> {
        let mut targets = Vec::new();
        while let Ok(target) = queue.try_receive() {
            targets.push((target.speed, target.direction));
        }
        targets
    }

    #[test]
    fn loop_stops_motors_when_command_runs_out() {
        let events = ControlChannel::new();
        let queues: [MotorQueue; NUM_MOTORS] = [Channel::new(), Channel::new()];
        let indicator: DisplaySignal = Signal::new();
        let mut controller = Controller::default();

        // 60 % forward on A, backward on B, for 2 counts
        on_motor_write(&[60, 1, 60, 0, 2], &events).unwrap();

        let res = embassy_futures::block_on(select(
            control_loop(&mut controller, events.receiver(), &queues, &indicator),
            Timer::after(Duration::from_millis(400)),
        ));

        assert!(matches!(res, Either::Second(())));
        assert_eq!(drain(&queues[0]), [(60, Forward), (0, Forward)]);
        assert_eq!(drain(&queues[1]), [(60, Backward), (0, Backward)]);
        assert_eq!(controller.watchdog(), None);
        assert_eq!(indicator.try_take(), None);
    }

    #[test]
    fn loop_clears_indicator_when_effect_expires() {
        let events = ControlChannel::new();
        let queues: [MotorQueue; NUM_MOTORS] = [Channel::new(), Channel::new()];
        let indicator: DisplaySignal = Signal::new();
        let mut controller = Controller::default();

        events.try_send(ControlMessage::Color(ColorClass::Yellow)).unwrap();
        events.try_send(ControlMessage::Command(command(60, 60, 2))).unwrap();

        let res = embassy_futures::block_on(select(
            control_loop(&mut controller, events.receiver(), &queues, &indicator),
            Timer::after(Duration::from_millis(1_500)),
        ));

        assert!(matches!(res, Either::Second(())));
        assert_eq!(controller.effect(), GameEffect::Off);
        assert_eq!(indicator.try_take(), Some(GameEffect::Off.indicator()));
        assert_eq!(drain(&queues[0]), [(80, Forward), (0, Forward)]);
        assert_eq!(drain(&queues[1]), [(80, Backward), (0, Backward)]);
    }
}
