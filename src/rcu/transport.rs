//! Ninth-bit serial transport.
//!
//! The wire protocol tags every byte with a ninth framing bit held at a
//! constant MARK (address/control bytes) or SPACE (data bytes) regardless
//! of the byte's own content. The `serialport` crate only exposes portable
//! `Parity::{None,Odd,Even}`, not raw MARK/SPACE parity, and Odd/Even parity
//! is computed from the byte's bit pattern rather than held constant — so
//! driving `Parity::Odd`/`Parity::Even` per [`FrameByte::Address`]/
//! [`FrameByte::Data`] here does NOT reproduce the real ninth bit; the
//! physical bit this crate puts on the wire still varies with payload
//! content even within a single `Address`-tagged run. This is a known
//! fidelity gap in `SerialTransport`, not a working approximation — see
//! the transport entry in `DESIGN.md`. On the receive side `rcu::session`'s
//! tag-inference heuristic exists to recover from exactly this kind of
//! unreliable ninth-bit read.

use crate::rcu::error::TransportError;
use crate::rcu::frame::FrameByte;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Best-effort tag for a received byte; `None` when the host cannot read
/// the physical ninth bit and the byte must be tagged later by the Session's
/// inference heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Address,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvByte {
    pub byte: u8,
    pub tag: Option<FrameTag>,
}

/// Common interface for anything that can send/receive ninth-bit-tagged
/// bytes. Implemented by [`SerialTransport`] (a real port) and
/// [`LoopbackTransport`] (in-memory, for tests and offline replay).
pub trait TransportPort: Send {
    fn send(&mut self, frame: FrameByte) -> Result<(), TransportError>;
    fn send_many(&mut self, frames: &[FrameByte]) -> Result<(), TransportError>;
    fn recv(&mut self, timeout: Duration) -> Result<Option<RecvByte>, TransportError>;
    fn drain(&mut self) -> Result<(), TransportError>;
}

/// A real OS serial port, opened 8 data bits / 1 stop bit / 19,200 baud by
/// default, with parity switched per emission. See the module doc for the
/// known gap between this parity switching and the real MARK/SPACE ninth
/// bit it stands in for.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    current_parity: Option<Parity>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::Even)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })?;
        Ok(Self {
            port,
            current_parity: Some(Parity::Even),
        })
    }

    fn set_parity_for(&mut self, want: Parity) -> Result<(), TransportError> {
        if self.current_parity != Some(want) {
            self.port.set_parity(want)?;
            self.current_parity = Some(want);
        }
        Ok(())
    }

    /// Stands in for the ninth-bit tag using parity mode rather than a
    /// constant bit value; see the module doc for why this is inexact.
    fn parity_for(frame: FrameByte) -> Parity {
        match frame {
            FrameByte::Address(_) => Parity::Odd,
            FrameByte::Data(_) => Parity::Even,
        }
    }
}

impl TransportPort for SerialTransport {
    fn send(&mut self, frame: FrameByte) -> Result<(), TransportError> {
        self.set_parity_for(Self::parity_for(frame))?;
        self.port.write_all(&[frame.value()])?;
        Ok(())
    }

    fn send_many(&mut self, frames: &[FrameByte]) -> Result<(), TransportError> {
        let mut rest = frames;
        while let Some(&first) = rest.first() {
            match first {
                FrameByte::Address(_) => {
                    self.send(first)?;
                    rest = &rest[1..];
                }
                FrameByte::Data(_) => {
                    let run_len = rest
                        .iter()
                        .take_while(|f| matches!(f, FrameByte::Data(_)))
                        .count();
                    let (run, tail) = rest.split_at(run_len);
                    self.set_parity_for(Parity::Even)?;
                    let bytes: Vec<u8> = run.iter().map(|f| f.value()).collect();
                    self.port.write_all(&bytes)?;
                    rest = tail;
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<RecvByte>, TransportError> {
        self.port.set_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(RecvByte {
                byte: buf[0],
                tag: None,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// An in-memory transport for tests and `diagnostic_capture` replay: bytes
/// fed via [`LoopbackTransport::push_incoming`] are returned by `recv`, and
/// every `send`/`send_many` call records the emitted [`FrameByte`]s for
/// inspection.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    incoming: Arc<Mutex<VecDeque<RecvByte>>>,
    pub emitted: Vec<FrameByte>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_incoming(&mut self, tag: Option<FrameTag>, byte: u8) {
        self.incoming.lock().unwrap().push_back(RecvByte { byte, tag });
    }

    pub fn push_address(&mut self, byte: u8) {
        self.push_incoming(Some(FrameTag::Address), byte);
    }

    pub fn push_data(&mut self, byte: u8) {
        self.push_incoming(Some(FrameTag::Data), byte);
    }

    pub fn push_bytes_untagged(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_incoming(None, b);
        }
    }

    /// A cloneable handle that can keep injecting incoming bytes after this
    /// transport has been moved into the worker thread: the worker owns the
    /// transport outright, so tests that need to feed bytes on a schedule
    /// relative to the worker's own actions — e.g. only after a write has
    /// been enqueued — inject them through this handle instead of
    /// front-loading the queue before `Rcu::open_with_transport`.
    pub fn feeder(&self) -> LoopbackFeeder {
        LoopbackFeeder {
            incoming: Arc::clone(&self.incoming),
        }
    }
}

/// A shared handle for injecting bytes into a [`LoopbackTransport`]'s
/// incoming queue from outside the thread that owns the transport.
#[derive(Debug, Clone)]
pub struct LoopbackFeeder {
    incoming: Arc<Mutex<VecDeque<RecvByte>>>,
}

impl LoopbackFeeder {
    pub fn push_incoming(&self, tag: Option<FrameTag>, byte: u8) {
        self.incoming.lock().unwrap().push_back(RecvByte { byte, tag });
    }

    pub fn push_address(&self, byte: u8) {
        self.push_incoming(Some(FrameTag::Address), byte);
    }

    pub fn push_data(&self, byte: u8) {
        self.push_incoming(Some(FrameTag::Data), byte);
    }
}

impl TransportPort for LoopbackTransport {
    fn send(&mut self, frame: FrameByte) -> Result<(), TransportError> {
        self.emitted.push(frame);
        Ok(())
    }

    fn send_many(&mut self, frames: &[FrameByte]) -> Result<(), TransportError> {
        self.emitted.extend_from_slice(frames);
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<RecvByte>, TransportError> {
        Ok(self.incoming.lock().unwrap().pop_front())
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        self.incoming.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_replays_pushed_bytes_in_order() {
        let mut t = LoopbackTransport::new();
        t.push_address(0x00);
        t.push_address(0x14);
        t.push_data(0xC0);

        assert_eq!(
            t.recv(Duration::ZERO).unwrap(),
            Some(RecvByte { byte: 0x00, tag: Some(FrameTag::Address) })
        );
        assert_eq!(
            t.recv(Duration::ZERO).unwrap(),
            Some(RecvByte { byte: 0x14, tag: Some(FrameTag::Address) })
        );
        assert_eq!(
            t.recv(Duration::ZERO).unwrap(),
            Some(RecvByte { byte: 0xC0, tag: Some(FrameTag::Data) })
        );
        assert_eq!(t.recv(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn loopback_records_emitted_frames() {
        let mut t = LoopbackTransport::new();
        t.send(FrameByte::Data(0x06)).unwrap();
        t.send(FrameByte::Address(0x03)).unwrap();
        assert_eq!(
            t.emitted,
            vec![FrameByte::Data(0x06), FrameByte::Address(0x03)]
        );
    }

    #[test]
    fn drain_discards_pending_input() {
        let mut t = LoopbackTransport::new();
        t.push_data(0x01);
        t.drain().unwrap();
        assert_eq!(t.recv(Duration::ZERO).unwrap(), None);
    }
}
