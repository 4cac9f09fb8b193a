//! Time Slotted Channel Hopping (TSCH) MAC for IEEE 802.15.4-2015 networks.
//! Provides slotframe/link scheduling, per-neighbour queues with CSMA backoff,
//! a timer-interrupt driven slot engine, and EB based association / sync.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

#![no_std]

use core::fmt::Debug;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod timer;

pub mod error;

pub mod ie;

pub mod packet;

pub mod tsch;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;

pub mod prelude;

/// Maximum size of a frame handled by the MAC, in bytes
pub const MAX_PACKET_LEN: usize = 127;

/// Receive information object
#[derive(Debug, Clone, PartialEq)]
pub struct RxInfo<Address = ieee802154::mac::Address> {
    /// Source address
    pub source: Address,
    /// Receive RSSI
    pub rssi: i16,
}

/// Pull-mode radio driver contract used by the slot engine.
///
/// The radio must not raise interrupts of its own: the MAC polls it under
/// tightly bounded guard times. `prepare`/`transmit` are split so a frame can
/// be staged early and fired at an exact instant, and `transmit` blocks for
/// the on-air duration of the frame.
pub trait Radio {
    type Error: Debug;

    /// Tune to the given IEEE 802.15.4 channel
    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;

    /// Enable the receiver
    fn on(&mut self) -> Result<(), Self::Error>;

    /// Disable the transceiver
    fn off(&mut self) -> Result<(), Self::Error>;

    /// Stage a frame in the radio transmit buffer
    fn prepare(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Transmit the staged frame, blocking until it is on air.
    /// An error signals the radio rejected or failed the send.
    fn transmit(&mut self, len: usize) -> Result<(), Self::Error>;

    /// Is a frame currently being received?
    fn receiving_packet(&mut self) -> bool;

    /// Is a complete received frame waiting to be read?
    fn pending_packet(&mut self) -> bool;

    /// Read a pending frame, returning length and RSSI
    fn read(&mut self, buf: &mut [u8]) -> Option<(usize, i16)>;

    /// Sample the medium, true if clear
    fn channel_clear(&mut self) -> bool;

    /// Enable or disable hardware address decoding. Disabled while waiting
    /// for enhanced ACKs so the radio passes them up unfiltered.
    fn address_decode(&mut self, enabled: bool);

    /// Hardware timestamp of the last start-of-frame delimiter, if supported
    fn sfd_timestamp(&self) -> Option<u32>;
}

/// Network interface abstraction
pub trait Mac<Address = ieee802154::mac::Address> {
    type Error;

    /// Periodic tick to poll / update layer operation
    fn tick(&mut self) -> Result<(), Self::Error>;

    /// Check if the layer is busy, used for back-pressure
    fn busy(&mut self) -> Result<bool, Self::Error>;

    /// Setup a packet for transmission, buffered by the implementer
    fn transmit(&mut self, dest: Address, data: &[u8], ack: bool) -> Result<(), Self::Error>;

    /// Check for received packets, buffered by the implementer
    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo<Address>)>, Self::Error>;
}

// Wrap log macros to support switching between defmt and standard logging

#[cfg(feature = "defmt")]
mod log {
    pub use defmt::{debug, error, info, trace, warn};

    pub trait FmtError: core::fmt::Debug + defmt::Format {}
    impl<T: core::fmt::Debug + defmt::Format> FmtError for T {}
}
#[cfg(not(feature = "defmt"))]
mod log {
    pub use log::{debug, error, info, trace, warn};

    pub trait FmtError: core::fmt::Debug {}
    impl<T: core::fmt::Debug> FmtError for T {}
}
