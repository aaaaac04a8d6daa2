//! Transport traits separating the serial/CAN protocol engines from the
//! physical link. Grounded on `TheerasakPing-bms-monitor/src/can_handler.rs`'s
//! split between a real adapter and a `SimulationHandler` mock.

use std::io;
use std::time::Duration;

use async_trait::async_trait;

/// Half-duplex byte transport to the BMS UART.
///
/// Implementors need not be thread-safe beyond `Send`; the serial engine
/// (`serial::engine`) owns the single instance and never shares it.
#[async_trait]
pub trait BmsTransport: Send {
    /// Writes `data` in full.
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads whatever is available into `buf`, returning the byte count, or
    /// times out after `timeout` with an `io::ErrorKind::TimedOut` error.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// A single CAN frame: an identifier plus up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        CanFrame { id, extended: false, data }
    }
}

/// Outbound-only CAN transport; the gateway never needs to receive frames
/// from the inverter bus.
#[async_trait]
pub trait CanTransport: Send {
    async fn send(&mut self, frame: &CanFrame) -> io::Result<()>;
}

/// In-memory `BmsTransport` double used by the serial engine's own test
/// suite and by integration tests: feeds back pre-scripted response bytes
/// and records every frame written to it.
#[derive(Debug, Default)]
pub struct RecordingBmsTransport {
    pub written: Vec<Vec<u8>>,
    responses: std::collections::VecDeque<Vec<u8>>,
}

impl RecordingBmsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes to hand back on the next `read` call.
    pub fn push_response(&mut self, bytes: Vec<u8>) {
        self.responses.push_back(bytes);
    }
}

#[async_trait]
impl BmsTransport for RecordingBmsTransport {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.written.push(data.to_vec());
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        match self.responses.pop_front() {
            Some(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted response queued")),
        }
    }
}

/// In-memory `CanTransport` double that records every frame sent, used by
/// the publisher's own tests and by end-to-end tests that assert on
/// broadcast cadence.
#[derive(Debug, Default)]
pub struct RecordingCanTransport {
    pub sent: Vec<CanFrame>,
}

impl RecordingCanTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanTransport for RecordingCanTransport {
    async fn send(&mut self, frame: &CanFrame) -> io::Result<()> {
        self.sent.push(frame.clone());
        Ok(())
    }
}

/// Real UART adapter over the `serialport` crate.
///
/// `serialport`'s API is blocking; the serial worker does nothing but
/// block on its request queue then on UART I/O, so performing that I/O
/// directly on the worker's own task rather than through `spawn_blocking`
/// matches the single-dedicated-worker model rather than fighting it.
pub struct SerialPortTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortTransport {
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(SerialPortTransport { port })
    }
}

#[async_trait]
impl BmsTransport for SerialPortTransport {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.port.write_all(data)
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::io::Read;
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(feature = "socketcan")]
pub mod socketcan_transport {
    //! Linux `SocketCAN` adapter, grounded on
    //! `TheerasakPing-bms-monitor/src/can_handler.rs`'s real-adapter branch.
    use super::*;
    use socketcan::{CanFrame as SockFrame, CanSocket, EmbeddedFrame, Socket, StandardId};

    pub struct SocketCanTransport {
        socket: CanSocket,
    }

    impl SocketCanTransport {
        pub fn open(interface: &str) -> io::Result<Self> {
            let socket = CanSocket::open(interface).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(SocketCanTransport { socket })
        }
    }

    #[async_trait]
    impl CanTransport for SocketCanTransport {
        async fn send(&mut self, frame: &CanFrame) -> io::Result<()> {
            let id = StandardId::new(frame.id as u16)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CAN id out of standard range"))?;
            let sock_frame = SockFrame::new(id, &frame.data)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "CAN payload too long"))?;
            self.socket.write_frame(&sock_frame).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }
    }
}
