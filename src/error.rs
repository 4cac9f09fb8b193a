//! MAC error and transmission status types.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use ieee802154::mac::DecodeError;

/// Per-packet MAC transmission outcome, reported through sent-callbacks
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Queued, not yet attempted
    Deferred,
    /// ACKed, or broadcast transmission complete
    Ok,
    /// No ACK received within the guard time
    NoAck,
    /// CCA found the channel busy
    Collision,
    /// The radio rejected the send
    Err,
    /// No packet or invalid buffer
    ErrFatal,
}

/// Synchronous enqueue / schedule mutation failures
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueError {
    /// Neighbour transmit queue full
    Full,

    /// Packet descriptor pool exhausted
    NoMemory,

    /// Neighbour table full
    NoNeighbor,

    /// Operation refused because the global lock is held
    Locked,

    /// Payload too large for a frame
    PayloadLength,
}

/// Basic MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Packet could not be enqueued
    Queue(QueueError),

    /// Slotframe / link storage exhausted or handle conflict
    Schedule,

    /// Decoding error
    DecodeError(DecodeError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),

    Timeout,

    Busy,
}

impl<E> From<QueueError> for CoreError<E> {
    fn from(e: QueueError) -> Self {
        CoreError::Queue(e)
    }
}
