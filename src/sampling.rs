use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use heapless::HistoryBuffer;

use crate::color::{self, ColorClass, ColorSample};
use crate::comm::{ControlMessage, DisplaySignal};

pub const RING_CAPACITY: usize = 3;

const SETTLE_TIME: u64 = 10; // ms
const SAMPLE_INTERVAL: u64 = 3; // ms
const BURST_SAMPLES: usize = 5;
const DEBOUNCE_TIME: u64 = 200; // ms

pub struct Config {
    pub settle: Duration,
    pub interval: Duration,
    pub samples: usize,
    pub debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(SETTLE_TIME),
            interval: Duration::from_millis(SAMPLE_INTERVAL),
            samples: BURST_SAMPLES,
            debounce: Duration::from_millis(DEBOUNCE_TIME),
        }
    }
}

/// Keeps the most recent `N` samples, overwriting the oldest.
pub struct RingBuffer<const N: usize> {
    samples: HistoryBuffer<ColorSample, N>,
}

impl<const N: usize> RingBuffer<N> {
    pub const fn new() -> Self {
        Self {
            samples: HistoryBuffer::new(),
        }
    }

    pub fn put(&mut self, sample: ColorSample) {
        self.samples.write(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.len() == 0
    }

    /// Per-channel mean of whatever is stored, `None` when empty.
    pub fn average(&self) -> Option<ColorSample> {
        let stored = self.samples.as_slice();
        if stored.is_empty() {
            return None;
        }

        let (red, green, blue) = stored.iter().fold((0u64, 0u64, 0u64), |(r, g, b), s| {
            (r + s.red as u64, g + s.green as u64, b + s.blue as u64)
        });
        let n = stored.len() as u64;

        Some(ColorSample::new(
            (red / n) as u32,
            (green / n) as u32,
            (blue / n) as u32,
        ))
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops edges that arrive within `window` of the last accepted one.
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn accept(&mut self, now: Instant) -> bool {
        let accepted = match self.last {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .is_some_and(|elapsed| elapsed > self.window),
        };
        if accepted {
            self.last = Some(now);
        }
        accepted
    }
}

#[allow(async_fn_in_trait)]
pub trait ColorSource {
    type Error: core::fmt::Debug;

    async fn read(&mut self) -> Result<ColorSample, Self::Error>;
}

/// Settles, reads a burst into `buffer` and returns the smoothed sample.
///
/// Failed reads are logged and skipped. The result is `None` only when
/// the buffer holds nothing at all.
pub async fn sample_burst<S, D, const N: usize>(
    sensor: &mut S,
    delay: &mut D,
    buffer: &mut RingBuffer<N>,
    config: &Config,
) -> Option<ColorSample>
where
    S: ColorSource,
    D: DelayNs,
{
    delay.delay_ms(config.settle.as_millis() as u32).await;

    for idx in 0..config.samples {
        if idx > 0 {
            delay.delay_ms(config.interval.as_millis() as u32).await;
        }
        match sensor.read().await {
            Ok(sample) => buffer.put(sample),
            Err(e) => log::error!("Couldn't read color sample: {:?}", e),
        }
    }

    buffer.average()
}

/// One complete classification cycle.
pub async fn sample_and_classify<S, D, const N: usize>(
    sensor: &mut S,
    delay: &mut D,
    buffer: &mut RingBuffer<N>,
    config: &Config,
) -> Option<ColorClass>
where
    S: ColorSource,
    D: DelayNs,
{
    let average = sample_burst(sensor, delay, buffer, config).await?;
    let class = color::classify(&average);
    log::info!(
        "Average RGB: R:{}, G:{}, B:{} color: {}",
        average.red,
        average.green,
        average.blue,
        class.name()
    );
    Some(class)
}

/// Waits for sensor edges and turns each accepted one into a color event.
///
/// The ring buffer lives here and nowhere else, so it has a single writer.
pub async fn color_loop<S, D, const T: usize, const C: usize>(
    sensor: &mut S,
    delay: &mut D,
    triggers: Receiver<'_, CriticalSectionRawMutex, Instant, T>,
    events: Sender<'_, CriticalSectionRawMutex, ControlMessage, C>,
    taillight: &DisplaySignal,
    config: Config,
) -> !
where
    S: ColorSource,
    D: DelayNs,
{
    let mut buffer = RingBuffer::<RING_CAPACITY>::new();
    let mut debouncer = Debouncer::new(config.debounce);

    log::info!("Starting color sampling");
    loop {
        let edge = triggers.receive().await;
        if !debouncer.accept(edge) {
            log::debug!("Sensor edge at {} ms debounced", edge.as_millis());
            continue;
        }

        match sample_and_classify(sensor, delay, &mut buffer, &config).await {
            Some(class) => {
                taillight.signal(class.to_rgb());
                events.send(ControlMessage::Color(class)).await;
            }
            None => log::warn!("No color sample available"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::select::{select, Either};
    use embassy_sync::channel::Channel;
    use std::collections::VecDeque;

    struct ScriptedSensor {
        readings: VecDeque<Result<ColorSample, ()>>,
    }

    impl ColorSource for ScriptedSensor {
        type Error = ();

        async fn read(&mut self) -> Result<ColorSample, ()> {
            self.readings.pop_front().unwrap_or(Err(()))
        }
    }

    #[derive(Default)]
    struct RecordingDelay {
        waits_ns: Vec<u32>,
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.waits_ns.push(ns);
        }
    }

    #[test]
    fn average_of_three_samples() {
        let mut ring = RingBuffer::<RING_CAPACITY>::new();
        ring.put(ColorSample::new(100, 200, 50));
        ring.put(ColorSample::new(104, 196, 54));
        ring.put(ColorSample::new(96, 204, 46));

        assert_eq!(ring.average(), Some(ColorSample::new(100, 200, 50)));
    }

    #[test]
    fn empty_buffer_has_no_average() {
        let ring = RingBuffer::<RING_CAPACITY>::new();
        assert!(ring.is_empty());
        assert_eq!(ring.average(), None);
    }

    #[test]
    fn partial_buffer_averages_what_it_holds() {
        let mut ring = RingBuffer::<RING_CAPACITY>::new();
        ring.put(ColorSample::new(10, 20, 30));
        ring.put(ColorSample::new(20, 40, 60));

        assert_eq!(ring.len(), 2);
        assert_eq!(ring.average(), Some(ColorSample::new(15, 30, 45)));
    }

    #[test]
    fn oldest_sample_is_overwritten() {
        let mut ring = RingBuffer::<RING_CAPACITY>::new();
        ring.put(ColorSample::new(60000, 60000, 60000));
        for _ in 0..RING_CAPACITY {
            ring.put(ColorSample::new(30, 30, 30));
        }

        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.average(), Some(ColorSample::new(30, 30, 30)));
    }

    #[test]
    fn debouncer_rejects_edges_inside_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(200));

        assert!(debouncer.accept(Instant::from_millis(1000)));
        assert!(!debouncer.accept(Instant::from_millis(1100)));
        assert!(!debouncer.accept(Instant::from_millis(1200)));
        assert!(debouncer.accept(Instant::from_millis(1201)));
        // Rejected edges don't extend the window
        assert!(!debouncer.accept(Instant::from_millis(1300)));
        assert!(debouncer.accept(Instant::from_millis(1402)));
    }

    #[test]
    fn burst_keeps_last_three_samples() {
        let readings = [10, 20, 30, 40, 50]
            .into_iter()
            .map(|v| Ok(ColorSample::new(v, v * 2, v * 3)))
            .collect();
        let mut sensor = ScriptedSensor { readings };
        let mut delay = RecordingDelay::default();
        let mut ring = RingBuffer::<RING_CAPACITY>::new();

        let average = embassy_futures::block_on(sample_burst(
            &mut sensor,
            &mut delay,
            &mut ring,
            &Config::default(),
        ));

        assert_eq!(average, Some(ColorSample::new(40, 80, 120)));
        // settle + four gaps between five samples
        assert_eq!(
            delay.waits_ns,
            [10_000_000, 3_000_000, 3_000_000, 3_000_000, 3_000_000]
        );
    }

    #[test]
    fn failed_reads_are_skipped() {
        let readings = [
            Err(()),
            Ok(ColorSample::new(41120, 52909, 21743)),
            Err(()),
            Err(()),
            Err(()),
        ]
        .into_iter()
        .collect();
        let mut sensor = ScriptedSensor { readings };
        let mut delay = RecordingDelay::default();
        let mut ring = RingBuffer::<RING_CAPACITY>::new();

        let class = embassy_futures::block_on(sample_and_classify(
            &mut sensor,
            &mut delay,
            &mut ring,
            &Config::default(),
        ));

        assert_eq!(class, Some(ColorClass::Yellow));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn burst_without_any_sample_yields_nothing() {
        let mut sensor = ScriptedSensor {
            readings: VecDeque::new(),
        };
        let mut delay = RecordingDelay::default();
        let mut ring = RingBuffer::<RING_CAPACITY>::new();

        let class = embassy_futures::block_on(sample_and_classify(
            &mut sensor,
            &mut delay,
            &mut ring,
            &Config::default(),
        ));

        assert_eq!(class, None);
    }

    #[test]
    fn bouncing_edges_trigger_one_classification() {
        let readings = (0..10)
            .map(|_| Ok(ColorSample::new(12093, 23398, 31486)))
            .collect();
        let mut sensor = ScriptedSensor { readings };
        let mut delay = RecordingDelay::default();
        let triggers: Channel<CriticalSectionRawMutex, Instant, 4> = Channel::new();
        let events: Channel<CriticalSectionRawMutex, ControlMessage, 4> = Channel::new();
        let taillight = DisplaySignal::new();

        triggers.try_send(Instant::from_millis(1_000)).unwrap();
        triggers.try_send(Instant::from_millis(1_050)).unwrap();
        triggers.try_send(Instant::from_millis(1_150)).unwrap();

        let res = embassy_futures::block_on(select(
            color_loop(
                &mut sensor,
                &mut delay,
                triggers.receiver(),
                events.sender(),
                &taillight,
                Config::default(),
            ),
            async {},
        ));

        assert!(matches!(res, Either::Second(())));
        assert_eq!(
            events.try_receive().ok(),
            Some(ControlMessage::Color(ColorClass::Blue))
        );
        assert!(events.is_empty());
        assert_eq!(taillight.try_take(), Some(ColorClass::Blue.to_rgb()));
        // Only one burst consumed samples
        assert_eq!(sensor.readings.len(), 5);
    }
}
