#![no_std]
#![no_main]

use core::convert::Infallible;

use embassy_executor::Spawner;
use embassy_futures::select::{select3, Either3};
use embassy_time::{Delay, Instant};
use esp_backtrace as _;
use esp_hal::{
    gpio::{AnyPin, Input, InputConfig, Pin, Pull},
    i2c,
    ledc::{self, channel::ChannelHW, channel::ChannelIFace, timer::TimerIFace},
    spi,
    time::Rate,
    timer::timg::TimerGroup,
};
use smart_leds::{SmartLedsWrite, RGB8};
use static_cell::StaticCell;
use tcs3472::Tcs3472;
use ws2812_spi::Ws2812;

use racer::color::ColorSample;
use racer::comm::{
    CONTROL_CHANNEL, HEADLIGHT_SIGNAL, INDICATOR_SIGNAL, MOTOR_QUEUES, TAILLIGHT_SIGNAL,
    TRIGGER_CHANNEL,
};
use racer::control::{control_loop, Controller};
use racer::motors::{self, motor_loop, Actuator, MotorOutput};
use racer::sampling::{self, color_loop, ColorSource};

use esp_alloc as _;

const NUM_LEDS: usize = 5;
const HEADLIGHTS: [usize; 2] = [0, 1];
const TAILLIGHTS: [usize; 2] = [2, 3];
const INDICATOR: usize = 4;

static MOTOR_TIMER: StaticCell<ledc::timer::Timer<'static, ledc::LowSpeed>> = StaticCell::new();

struct LedcMotor {
    forward: ledc::channel::Channel<'static, ledc::LowSpeed>,
    backward: ledc::channel::Channel<'static, ledc::LowSpeed>,
}

impl MotorOutput for LedcMotor {
    type Error = Infallible;

    fn set_duty(&mut self, forward: u16, backward: u16) -> Result<(), Infallible> {
        self.forward.set_duty_hw(forward as u32);
        self.backward.set_duty_hw(backward as u32);
        Ok(())
    }
}

struct ColorSensor {
    sensor: Tcs3472<i2c::master::I2c<'static, esp_hal::Async>>,
}

impl ColorSource for ColorSensor {
    type Error = tcs3472::Error<i2c::master::Error>;

    async fn read(&mut self) -> Result<ColorSample, Self::Error> {
        let m = self.sensor.read_all_channels().await?;
        log::debug!("Measurement: {:?}", m);
        Ok(ColorSample::normalized(m.red, m.green, m.blue, m.clear))
    }
}

fn configure_motor_channel(
    mut channel: ledc::channel::Channel<'static, ledc::LowSpeed>,
    timer: &'static ledc::timer::Timer<'static, ledc::LowSpeed>,
) -> ledc::channel::Channel<'static, ledc::LowSpeed> {
    channel
        .configure(ledc::channel::config::Config {
            timer,
            duty_pct: 0,
            pin_config: ledc::channel::config::PinConfig::PushPull,
        })
        .unwrap();
    channel
}

#[embassy_executor::task(pool_size = 2)]
async fn motor_task(index: usize, output: LedcMotor) {
    let mut actuator = Actuator::new(index, output, Delay, motors::Config::default());
    motor_loop(&mut actuator, MOTOR_QUEUES[index].receiver()).await
}

#[embassy_executor::task]
async fn color_task(i2c: i2c::master::I2c<'static, esp_hal::Async>) {
    let mut sensor = Tcs3472::new(i2c);

    log::info!("Starting color sensor task");
    sensor.enable().await.unwrap();
    sensor.enable_rgbc().await.unwrap();
    // Short integration so a five sample burst fits in ~12 ms
    sensor.set_integration_cycles(1).await.unwrap();

    let mut source = ColorSensor { sensor };
    let mut delay = Delay;
    color_loop(
        &mut source,
        &mut delay,
        TRIGGER_CHANNEL.receiver(),
        CONTROL_CHANNEL.sender(),
        &TAILLIGHT_SIGNAL,
        sampling::Config::default(),
    )
    .await
}

// Only timestamps the edge; debouncing and sampling happen in color_task
#[embassy_executor::task]
async fn trigger_task(pin: AnyPin) {
    let mut input = Input::new(pin, InputConfig::default().with_pull(Pull::Up));

    loop {
        input.wait_for_falling_edge().await;
        if TRIGGER_CHANNEL.try_send(Instant::now()).is_err() {
            log::warn!("Trigger queue full, dropping edge");
        }
    }
}

#[embassy_executor::task]
async fn led_task(mut led: Ws2812<spi::master::Spi<'static, esp_hal::Async>>) {
    let mut frame = [RGB8::default(); NUM_LEDS];

    loop {
        if led.write(frame.iter().cloned()).is_err() {
            log::error!("Couldn't update LEDs");
        }

        match select3(
            HEADLIGHT_SIGNAL.wait(),
            TAILLIGHT_SIGNAL.wait(),
            INDICATOR_SIGNAL.wait(),
        )
        .await
        {
            Either3::First(color) => HEADLIGHTS.iter().for_each(|&i| frame[i] = color),
            Either3::Second(color) => TAILLIGHTS.iter().for_each(|&i| frame[i] = color),
            Either3::Third(color) => frame[INDICATOR] = color,
        }
    }
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    esp_println::logger::init_logger_from_env();
    esp_alloc::heap_allocator!(size: 72 * 1024);

    let peripherals = esp_hal::init(esp_hal::Config::default());
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timg0.timer0);

    let mosi = peripherals.GPIO10;
    let scl = peripherals.GPIO8;
    let sda = peripherals.GPIO9;

    let spi = spi::master::Spi::new(
        peripherals.SPI2,
        spi::master::Config::default()
            .with_frequency(Rate::from_khz(3800))
            .with_mode(spi::Mode::_0),
    )
    .unwrap()
    .with_mosi(mosi)
    .into_async();

    let led = Ws2812::new(spi);

    let i2c = i2c::master::I2c::new(
        peripherals.I2C0,
        i2c::master::Config::default().with_frequency(Rate::from_khz(100)),
    )
    .unwrap()
    .with_sda(sda)
    .with_scl(scl)
    .into_async();

    let mut ledc = ledc::Ledc::new(peripherals.LEDC);
    ledc.set_global_slow_clock(ledc::LSGlobalClkSource::APBClk);
    let mut lstimer0 = ledc.timer::<ledc::LowSpeed>(ledc::timer::Number::Timer0);
    lstimer0
        .configure(ledc::timer::config::Config {
            duty: ledc::timer::config::Duty::Duty10Bit,
            clock_source: ledc::timer::LSClockSource::APBClk,
            frequency: Rate::from_khz(15),
        })
        .unwrap();
    let lstimer0 = MOTOR_TIMER.init(lstimer0);

    let motor_a = LedcMotor {
        forward: configure_motor_channel(
            ledc.channel(ledc::channel::Number::Channel0, peripherals.GPIO3),
            lstimer0,
        ),
        backward: configure_motor_channel(
            ledc.channel(ledc::channel::Number::Channel1, peripherals.GPIO2),
            lstimer0,
        ),
    };
    let motor_b = LedcMotor {
        forward: configure_motor_channel(
            ledc.channel(ledc::channel::Number::Channel2, peripherals.GPIO0),
            lstimer0,
        ),
        backward: configure_motor_channel(
            ledc.channel(ledc::channel::Number::Channel3, peripherals.GPIO1),
            lstimer0,
        ),
    };

    let trigger = peripherals.GPIO5.degrade();

    spawner.spawn(led_task(led)).unwrap();
    spawner.spawn(motor_task(0, motor_a)).unwrap();
    spawner.spawn(motor_task(1, motor_b)).unwrap();
    spawner.spawn(color_task(i2c)).unwrap();
    spawner.spawn(trigger_task(trigger)).unwrap();

    // No GATT server runs here yet. A BLE stack hooks in by passing motor
    // characteristic writes to `racer::comm::on_motor_write(data, &CONTROL_CHANNEL)`
    // and headlight writes to `on_headlight_write(data, &HEADLIGHT_SIGNAL)`.
    // Until then only track colors reach the controller.
    let mut controller = Controller::default();
    control_loop(
        &mut controller,
        CONTROL_CHANNEL.receiver(),
        &MOTOR_QUEUES,
        &INDICATOR_SIGNAL,
    )
    .await
}
