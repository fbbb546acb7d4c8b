#![cfg_attr(not(test), no_std)]
//! Byte-stream, frame and MAC-command codecs for a LoRaWAN 1.0.x/1.1 end-device stack.
//!
//! This crate has no knowledge of radio timing or session bookkeeping -- it only knows how to
//! turn LoRaWAN PHY payloads into bytes and back. The state machine that decides *when* to use
//! these codecs lives in `lorawan-mac`.

pub mod stream;

pub mod keys;

#[cfg(feature = "default-crypto")]
pub mod default_crypto;

pub mod sm;

pub mod frame;

pub mod maccommand;
