//! Scripted radio mock for MAC tests.
//
// https://github.com/rust-iot/rust-tsch
// Copyright 2022 Ryan Kurte

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::Radio;

struct State {
    channel: Option<u8>,
    on: bool,
    address_decode: bool,
    prepared: Option<Vec<u8>>,
    rx: VecDeque<(Vec<u8>, i16)>,
    receiving: bool,
    channel_clear: bool,
    tx: Vec<(Option<u8>, Vec<u8>)>,
    tx_response: Option<(Vec<u8>, i16)>,
    transmit_result: Result<(), ()>,
    channels: Vec<u8>,
    sfd: Option<u32>,
}

/// Shared-handle mock radio. Clones observe and drive the same state, so a
/// test can script receptions and inspect transmissions while the MAC owns
/// its own handle.
#[derive(Clone)]
pub struct MockRadio(Arc<Mutex<State>>);

impl MockRadio {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(State {
            channel: None,
            on: false,
            address_decode: true,
            prepared: None,
            rx: VecDeque::new(),
            receiving: false,
            channel_clear: true,
            tx: Vec::new(),
            tx_response: None,
            transmit_result: Ok(()),
            channels: Vec::new(),
            sfd: None,
        })))
    }

    /// Queue a frame as pending for the next read
    pub fn set_pending(&self, frame: &[u8], rssi: i16) {
        self.0.lock().unwrap().rx.push_back((frame.to_vec(), rssi));
    }

    /// Queue a frame that becomes pending after the next transmission,
    /// e.g. an ACK
    pub fn respond_with(&self, frame: &[u8], rssi: i16) {
        self.0.lock().unwrap().tx_response = Some((frame.to_vec(), rssi));
    }

    /// Frames transmitted so far, with the channel they left on
    pub fn transmitted(&self) -> Vec<(Option<u8>, Vec<u8>)> {
        self.0.lock().unwrap().tx.clone()
    }

    pub fn clear_transmitted(&self) {
        self.0.lock().unwrap().tx.clear();
    }

    /// Channels selected so far
    pub fn channels(&self) -> Vec<u8> {
        self.0.lock().unwrap().channels.clone()
    }

    pub fn set_transmit_result(&self, r: Result<(), ()>) {
        self.0.lock().unwrap().transmit_result = r;
    }

    pub fn set_channel_clear(&self, clear: bool) {
        self.0.lock().unwrap().channel_clear = clear;
    }

    pub fn set_receiving(&self, receiving: bool) {
        self.0.lock().unwrap().receiving = receiving;
    }

    pub fn set_sfd(&self, sfd: Option<u32>) {
        self.0.lock().unwrap().sfd = sfd;
    }

    pub fn is_on(&self) -> bool {
        self.0.lock().unwrap().on
    }

    pub fn channel(&self) -> Option<u8> {
        self.0.lock().unwrap().channel
    }
}

impl Radio for MockRadio {
    type Error = ();

    fn set_channel(&mut self, channel: u8) -> Result<(), ()> {
        let mut s = self.0.lock().unwrap();
        s.channel = Some(channel);
        s.channels.push(channel);
        Ok(())
    }

    fn on(&mut self) -> Result<(), ()> {
        self.0.lock().unwrap().on = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), ()> {
        self.0.lock().unwrap().on = false;
        Ok(())
    }

    fn prepare(&mut self, data: &[u8]) -> Result<(), ()> {
        self.0.lock().unwrap().prepared = Some(data.to_vec());
        Ok(())
    }

    fn transmit(&mut self, len: usize) -> Result<(), ()> {
        let mut s = self.0.lock().unwrap();
        let frame = match s.prepared.take() {
            Some(f) => f,
            None => return Err(()),
        };
        assert!(len <= frame.len());
        let channel = s.channel;
        s.tx.push((channel, frame[..len].to_vec()));
        if let Some(resp) = s.tx_response.take() {
            s.rx.push_back(resp);
        }
        s.transmit_result
    }

    fn receiving_packet(&mut self) -> bool {
        self.0.lock().unwrap().receiving
    }

    fn pending_packet(&mut self) -> bool {
        !self.0.lock().unwrap().rx.is_empty()
    }

    fn read(&mut self, buf: &mut [u8]) -> Option<(usize, i16)> {
        let (frame, rssi) = self.0.lock().unwrap().rx.pop_front()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Some((len, rssi))
    }

    fn channel_clear(&mut self) -> bool {
        self.0.lock().unwrap().channel_clear
    }

    fn address_decode(&mut self, enabled: bool) {
        self.0.lock().unwrap().address_decode = enabled;
    }

    fn sfd_timestamp(&self) -> Option<u32> {
        self.0.lock().unwrap().sfd
    }
}
