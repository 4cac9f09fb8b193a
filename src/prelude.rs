//! TSCH crate prelude
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

pub use crate::{Mac, Radio, RxInfo};

pub use crate::error::{CoreError, QueueError, TxStatus};
pub use crate::timer::Timer as MacTimer;

pub use crate::packet::{Packet, BROADCAST_ADDRESS, EB_ADDRESS};

pub use crate::tsch::asn::Asn;
pub use crate::tsch::config::{TschConfig, TschTimings};
pub use crate::tsch::schedule::{
    LinkType, LINK_OPTION_RX, LINK_OPTION_SHARED, LINK_OPTION_TIME_KEEPING, LINK_OPTION_TX,
};
pub use crate::tsch::{TschMac, TschStats};

pub use ieee802154::mac::{Address as MacAddress, AddressMode, ExtendedAddress, PanId, ShortAddress};
