#![cfg_attr(not(test), no_std)]

//! Reactive core of a color-track racer: sensor sampling and
//! classification, the game effect state machine, command merging with a
//! watchdog, and soft-start motor actuation.
//!
//! Nothing in here touches hardware. The firmware binary plugs esp-hal
//! peripherals into [`motors::MotorOutput`] and [`sampling::ColorSource`]
//! and runs the loops as embassy tasks.

pub mod color;
pub mod comm;
pub mod control;
pub mod game;
pub mod motors;
pub mod sampling;
