//! Upward-facing API: the indications [`Mac::process`](crate::mac::Mac::process) raises through an
//! [`EventHandler`], and the synchronous errors an API call can reject with immediately.
//!
//! Grounded on the original stack's `LDL_MAC_EventCb` callback and its `LDL_MAC_..._E` status
//! codes, split here into two enums because Rust's ownership makes a callback's borrowed payload
//! (e.g. a received frame's FRMPayload slice) awkward to also return from the call that queued it.

/// Something the scheduler wants the application layer to know about, raised from inside
/// [`crate::mac::Mac::process`]. Borrows from the scheduler's internal RX buffer where a frame's
/// payload is involved, so a handler must copy out anything it needs to keep past the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// A requested entropy sample completed.
    Entropy(u32),
    /// A previously duty-cycle- or ADR-blocked channel (or the global aggregate) is usable again.
    ChannelReady,
    /// The in-flight radio operation failed at the driver level (`Radio::transmit`/`receive`
    /// returned an error); the operation has been abandoned.
    OpError,
    /// [`crate::mac::Mac::cancel`] was called while an operation was in flight.
    OpCancelled,
    /// OTAA join succeeded; the session is now usable.
    JoinComplete { join_nonce: u32, net_id: u32, dev_addr: u32 },
    /// The DevNonce advanced (every join attempt, successful or not) -- the value the application
    /// must persist so a reboot never reuses one the network has already seen.
    DevNonceUpdated { next_dev_nonce: u32 },
    /// OTAA join attempts were exhausted without a Join-Accept.
    JoinExhausted,
    /// An unconfirmed uplink finished sending, or a confirmed uplink's ACK was received.
    DataComplete,
    /// A confirmed uplink's ACK was not received within its retry budget.
    DataTimeout,
    /// Application payload arrived on a downlink (RX1 or RX2).
    Rx { port: u8, data: &'a [u8] },
    /// A LinkCheckAns arrived: `margin` in dB above the network's demodulation floor, `gw_count`
    /// gateways that received the uplink it answers.
    LinkStatus { margin: u8, gw_count: u8 },
    /// Session state changed in a way the application should persist (new frame counters, a new
    /// channel list, ADR parameters) -- raised instead of exposing mutable session access, so the
    /// application always persists a known-consistent snapshot.
    SessionUpdated,
    /// A DeviceTimeAns arrived: GPS epoch seconds and 1/256ths-of-a-second fractional part.
    DeviceTime { seconds: u32, fractions: u8 },
}

/// Receives [`Event`]s raised during [`crate::mac::Mac::process`]. Implemented by the application;
/// a test double can simply push every event into a `Vec` for later inspection.
pub trait EventHandler {
    fn handle(&mut self, event: Event);
}

/// Synchronous rejections an API call (join/send/etc.) can return immediately, without waiting for
/// `process()`. Grounded on the original stack's `LDL_STATUS_*` immediate-failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ApiError {
    /// No channel in the current table is usable at the requested (or any) data rate.
    NoChannel,
    /// Payload would exceed the current data rate's maximum MAC payload size.
    Size,
    /// Requested data rate is not valid for the region.
    Rate,
    /// FPort 0 is reserved for MAC-command-only frames.
    Port,
    /// An operation is already in flight; [`crate::mac::Mac::cancel`] it first.
    Busy,
    /// No session exists; call [`crate::mac::Mac::otaa`] or [`crate::mac::Mac::abp`] first.
    NotJoined,
    /// Requested TX power step exceeds what [`crate::config::Config::max_power_deci_dbm`] allows.
    Power,
    /// A higher-priority MAC operation (e.g. an answer the network is waiting on) must go out
    /// first; retry once it has.
    MacPriority,
    /// Already joined; forget the session first if a fresh join is really intended.
    Joined,
    /// DevNonce has wrapped (exhausted the 16-bit on-air space); this identity can never join
    /// this network again.
    DevNonce,
}
