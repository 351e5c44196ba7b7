use embassy_time::{Duration, Instant};
use smart_leds::RGB8;

use crate::color::ColorClass;

const SPIN_OUT_TIME: u64 = 1000; // ms
const BOOST_TIME: u64 = 10000; // ms
const COOLDOWN_TIME: u64 = 1000; // ms

pub struct Config {
    /// How long a spin-out lasts.
    pub spin_out: Duration,
    /// How long speed-up and slow-down last.
    pub boost: Duration,
    /// Minimum gap between two accepted spin-outs.
    pub cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spin_out: Duration::from_millis(SPIN_OUT_TIME),
            boost: Duration::from_millis(BOOST_TIME),
            cooldown: Duration::from_millis(COOLDOWN_TIME),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEffect {
    Off,
    SpeedUp,
    SlowDown,
    SpinOut,
}

impl GameEffect {
    /// Status LED color shown while the effect is active.
    pub fn indicator(self) -> RGB8 {
        match self {
            GameEffect::Off => RGB8::new(0, 0, 0),
            GameEffect::SpeedUp => RGB8::new(0, 255, 0),
            GameEffect::SlowDown => RGB8::new(0, 0, 255),
            GameEffect::SpinOut => RGB8::new(255, 0, 0),
        }
    }
}

/// The single active effect plus its expiry deadline.
///
/// Not shared: the controller owns it and feeds it both color events and
/// expiry checks, so there is exactly one writer.
pub struct GameState {
    effect: GameEffect,
    cooldown_until: Instant,
    deadline: Option<Instant>,
    config: Config,
}

impl GameState {
    pub fn new(config: Config) -> Self {
        Self {
            effect: GameEffect::Off,
            cooldown_until: Instant::from_ticks(0),
            deadline: None,
            config,
        }
    }

    pub fn effect(&self) -> GameEffect {
        self.effect
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Applies a classified color. Returns the new effect when the color
    /// caused a transition.
    pub fn on_color(&mut self, color: ColorClass, now: Instant) -> Option<GameEffect> {
        let (effect, period) = match color {
            ColorClass::Yellow => {
                if now < self.cooldown_until {
                    log::warn!("Cooldown. Ignoring {}", color.name());
                    return None;
                }
                self.cooldown_until = now + self.config.cooldown;
                (GameEffect::SpinOut, self.config.spin_out)
            }
            ColorClass::Red | ColorClass::Green => (GameEffect::SpeedUp, self.config.boost),
            ColorClass::Blue => (GameEffect::SlowDown, self.config.boost),
            ColorClass::Cyan | ColorClass::White | ColorClass::Unknown => return None,
        };

        // Replacing the deadline cancels whatever effect was running
        self.effect = effect;
        self.deadline = Some(now + period);
        log::warn!(
            "{} -> {:?} for {} ms",
            color.name(),
            effect,
            period.as_millis()
        );
        Some(effect)
    }

    /// Reverts to `Off` once the deadline has passed. Returns true if the
    /// effect expired on this call.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                log::warn!("Game effect {:?} expired", self.effect);
                self.effect = GameEffect::Off;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
