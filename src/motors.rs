use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;

pub const NUM_MOTORS: usize = 2;

const MIN_SPEED_PERCENT: u8 = 15;
const MAX_DUTY: u16 = (1 << 10) - 1; // 10-bit PWM
const SOFT_START_DELAY: u64 = 30; // ms

pub struct Config {
    /// Slowest speed that still turns the wheels. Anything lower is off.
    pub min_speed_percent: u8,
    pub max_duty: u16,
    pub step_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_speed_percent: MIN_SPEED_PERCENT,
            max_duty: MAX_DUTY,
            step_delay: Duration::from_millis(SOFT_START_DELAY),
        }
    }
}

impl Config {
    /// Maps `min_speed_percent..=100` linearly onto `min_duty..=max_duty`.
    pub fn duty(&self, speed_percent: u8) -> u16 {
        let speed = speed_percent.min(100) as u32;
        let floor = self.min_speed_percent as u32;
        if speed < floor || speed == 0 {
            return 0;
        }

        let max_duty = self.max_duty as u32;
        let min_duty = floor * max_duty / 100;
        if floor >= 100 {
            return max_duty as u16;
        }
        (min_duty + (speed - floor) * (max_duty - min_duty) / (100 - floor)) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// What one motor should converge to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorTarget {
    pub motor: usize,
    pub speed: u8,
    pub direction: Direction,
}

#[cfg(test)]
impl MotorTarget {
    /// Forward at zero speed. Production stops go through
    /// `MotorCommand::stopped`, which keeps the last directions.
    pub fn stop(motor: usize) -> Self {
        Self {
            motor,
            speed: 0,
            direction: Direction::Forward,
        }
    }
}

/// Speeds from `current` towards `target`, one percent per step.
/// `target` itself is not yielded.
pub struct Ramp {
    current: u8,
    target: u8,
}

impl Ramp {
    pub fn new(current: u8, target: u8) -> Self {
        Self { current, target }
    }
}

impl Iterator for Ramp {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.current == self.target {
            return None;
        }
        let speed = self.current;
        if self.target > self.current {
            self.current += 1;
        } else {
            self.current -= 1;
        }
        Some(speed)
    }
}

/// A motor's pair of PWM channels.
pub trait MotorOutput {
    type Error: core::fmt::Debug;

    fn set_duty(&mut self, forward: u16, backward: u16) -> Result<(), Self::Error>;
}

/// Soft-start driver for one motor. Owns the motor's speed and direction;
/// nothing else writes them.
pub struct Actuator<M, D> {
    index: usize,
    output: M,
    delay: D,
    config: Config,
    speed: u8,
    direction: Direction,
}

impl<M: MotorOutput, D: DelayNs> Actuator<M, D> {
    pub fn new(index: usize, output: M, delay: D, config: Config) -> Self {
        let mut actuator = Self {
            index,
            output,
            delay,
            config,
            speed: 0,
            direction: Direction::Forward,
        };
        actuator.write(0, Direction::Forward);
        actuator
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn write(&mut self, speed: u8, direction: Direction) {
        let duty = self.config.duty(speed);
        let (forward, backward) = match direction {
            Direction::Forward => (duty, 0),
            Direction::Backward => (0, duty),
        };
        if let Err(e) = self.output.set_duty(forward, backward) {
            log::error!("Motor {}: couldn't set duty {}: {:?}", self.index, duty, e);
        }
        log::debug!(
            "Motor {} set to speed {}% (duty {}), direction {:?}",
            self.index,
            speed,
            duty,
            direction
        );
    }

    async fn pause(&mut self, delay: Duration) {
        self.delay.delay_ms(delay.as_millis() as u32).await;
    }

    /// Ramps to `target_speed` in `target_direction`. Blocks the calling
    /// task for roughly one step delay per percent travelled.
    pub async fn set_target(&mut self, target_speed: u8, target_direction: Direction) {
        let target_speed = target_speed.min(100);
        let step = self.config.step_delay;
        let floor = self.config.min_speed_percent;
        let mut start = self.speed;

        if self.direction != target_direction && start > 0 {
            log::debug!("Slow stopping motor {}", self.index);
            let old_direction = self.direction;
            if start >= floor {
                for speed in (floor..=start).rev() {
                    self.write(speed, old_direction);
                    self.pause(step).await;
                }
            }
            self.write(0, old_direction);
            start = 0;
        }

        if target_speed > 0 {
            if start == 0 {
                self.write(floor, target_direction);
                self.pause(step * 2).await;
                start = floor;
            }
            for speed in Ramp::new(start, target_speed) {
                self.write(speed, target_direction);
                self.pause(step).await;
            }
        } else {
            self.write(0, target_direction);
        }

        // Land exactly on the target
        self.write(target_speed, target_direction);

        self.speed = target_speed;
        self.direction = target_direction;
        log::debug!("Done with motor {}", self.index);
    }
}

/// Drains one motor's queue in order, ramping to each target.
pub async fn motor_loop<M, D, const N: usize>(
    actuator: &mut Actuator<M, D>,
    queue: Receiver<'_, CriticalSectionRawMutex, MotorTarget, N>,
) -> !
where
    M: MotorOutput,
    D: DelayNs,
{
    log::info!("Starting motor {} task", actuator.index());
    loop {
        let target = queue.receive().await;
        if target.motor != actuator.index() {
            log::error!(
                "Invalid motor index {} on motor {} queue, dropping",
                target.motor,
                actuator.index()
            );
            continue;
        }
        log::info!(
            "Motor {} speed {}% direction {:?}",
            target.motor,
            target.speed,
            target.direction
        );
        actuator.set_target(target.speed, target.direction).await;
    }
}
