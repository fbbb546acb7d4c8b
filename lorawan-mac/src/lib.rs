#![cfg_attr(not(test), no_std)]
//! Cooperative, interrupt-driven LoRaWAN 1.0.x/1.1 end-device MAC engine.
//!
//! Builds on `lorawan-encoding`'s codecs and `lora-modulation`'s airtime math with everything a
//! running device needs on top: region tables, session/channel bookkeeping, duty-cycle accounting,
//! timers, and the [`mac::Mac`] scheduler that ties them together behind a single `process()` entry
//! point. The host implements [`Radio`], [`platform::Platform`] and a [`lorawan_encoding::sm::SecurityModule`]
//! and drives the scheduler; this crate owns no radio, clock or key material itself.

#[macro_use]
mod fmt;

pub mod config;
pub mod dutycycle;
pub mod event;
pub mod mac;
pub mod ops;
pub mod platform;
pub mod radio;
pub mod region;
pub mod session;
pub mod timer;

pub use config::{Config, ConfigError};
pub use event::{ApiError, Event, EventHandler};
pub use mac::{Mac, Op, State};
pub use platform::Platform;
pub use radio::Radio;
pub use region::Region;
pub use session::{Session, SessionVersion};
