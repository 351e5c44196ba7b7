use core::ops::RangeInclusive;

use smart_leds::RGB8;

/// Full scale of a normalized channel.
pub const FULL_SCALE: u32 = 65535;

// Frames with less light than this are too noisy to normalize
const CLEAR_MIN: u32 = 10;

const TOLERANCE_DEFAULT: u32 = 10000;

/// One reading, each channel normalized to `0..=FULL_SCALE` against the
/// clear channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorSample {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl ColorSample {
    pub const fn new(red: u32, green: u32, blue: u32) -> Self {
        Self { red, green, blue }
    }

    /// Scales raw sensor counts to fractions of the clear channel.
    pub fn normalized(red: u16, green: u16, blue: u16, clear: u16) -> Self {
        let clear = clear as u32;
        if clear < CLEAR_MIN {
            log::warn!("Clear too low ({}), skipping normalization", clear);
            return Self::default();
        }

        let scale = |x: u16| -> u32 {
            let scaled = (x as u32 * FULL_SCALE + clear / 2) / clear;
            scaled.min(FULL_SCALE)
        };

        Self {
            red: scale(red),
            green: scale(green),
            blue: scale(blue),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorClass {
    Red,
    Cyan,
    Blue,
    Green,
    Yellow,
    White,
    Unknown,
}

impl ColorClass {
    pub fn name(self) -> &'static str {
        match self {
            ColorClass::Red => "Red",
            ColorClass::Cyan => "Cyan",
            ColorClass::Blue => "Blue",
            ColorClass::Green => "Green",
            ColorClass::Yellow => "Yellow",
            ColorClass::White => "White",
            ColorClass::Unknown => "Unknown",
        }
    }

    pub fn to_rgb(self) -> RGB8 {
        match self {
            ColorClass::Red => RGB8::new(128, 0, 0),
            ColorClass::Cyan => RGB8::new(0, 128, 128),
            ColorClass::Blue => RGB8::new(0, 0, 128),
            ColorClass::Green => RGB8::new(0, 128, 0),
            ColorClass::Yellow => RGB8::new(128, 128, 0),
            ColorClass::White => RGB8::new(128, 128, 128),
            ColorClass::Unknown => RGB8::new(0, 0, 0),
        }
    }
}

/// A calibrated track color: the class it stands for, the expected
/// normalized reading and how far each channel may stray from it.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceColor {
    pub class: ColorClass,
    pub target: ColorSample,
    pub tolerance: ColorSample,
}

impl ReferenceColor {
    // A window whose lower edge would go below zero never matches. The
    // calibration table below was tuned with that behavior.
    fn window(target: u32, tolerance: u32) -> Option<RangeInclusive<u32>> {
        let low = target.checked_sub(tolerance)?;
        Some(low..=target.saturating_add(tolerance))
    }

    fn contains(&self, sample: &ColorSample) -> bool {
        let channels = [
            (self.target.red, self.tolerance.red, sample.red),
            (self.target.green, self.tolerance.green, sample.green),
            (self.target.blue, self.tolerance.blue, sample.blue),
        ];

        channels.iter().all(|&(target, tolerance, value)| {
            Self::window(target, tolerance).is_some_and(|w| w.contains(&value))
        })
    }
}

const fn reference(class: ColorClass, target: [u32; 3], tolerance: [u32; 3]) -> ReferenceColor {
    ReferenceColor {
        class,
        target: ColorSample::new(target[0], target[1], target[2]),
        tolerance: ColorSample::new(tolerance[0], tolerance[1], tolerance[2]),
    }
}

const DEFAULT_TOLERANCE: [u32; 3] = [TOLERANCE_DEFAULT; 3];

/// Match priority is table order: the first window that contains the
/// sample wins, overlapping windows are not scored.
pub static REFERENCE_COLORS: [ReferenceColor; 6] = [
    reference(ColorClass::Yellow, [41120, 52909, 21743], [22000, 19000, 20000]),
    reference(ColorClass::Green, [114, 120, 20], DEFAULT_TOLERANCE),
    reference(ColorClass::Blue, [12093, 23398, 31486], DEFAULT_TOLERANCE),
    reference(ColorClass::Cyan, [80, 107, 63], DEFAULT_TOLERANCE),
    reference(ColorClass::Red, [37250, 17100, 15550], DEFAULT_TOLERANCE),
    reference(ColorClass::White, [65535, 65535, 56712], DEFAULT_TOLERANCE),
];

pub fn classify_with(table: &[ReferenceColor], sample: &ColorSample) -> ColorClass {
    table
        .iter()
        .find(|reference| reference.contains(sample))
        .map_or(ColorClass::Unknown, |reference| reference.class)
}

pub fn classify(sample: &ColorSample) -> ColorClass {
    classify_with(&REFERENCE_COLORS, sample)
}
