//! Serial-port transport.
//!
//! Bytes are raw, there is no stderr, and inbound data is delivered by a
//! dedicated reader strand so the reactor's pump never touches the device
//! itself.

use super::{Sink, Transport, TransportError};
use crate::options::{SerialOptions, SerialParity};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Transport over a local serial device.
pub struct SerialTransport {
    options: SerialOptions,
    stdout: Option<Sink>,
    port: Option<Box<dyn SerialPort>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl SerialTransport {
    #[must_use]
    pub fn new(options: SerialOptions) -> Self {
        Self {
            options,
            stdout: None,
            port: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn data_bits(&self) -> DataBits {
        match self.options.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn parity(&self) -> Parity {
        match self.options.parity {
            SerialParity::None => Parity::None,
            SerialParity::Even => Parity::Even,
            SerialParity::Odd => Parity::Odd,
        }
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(self.options.path.clone(), self.options.speed)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(20))
            .open()
            .map_err(TransportError::connect)?;

        let mut reader_port = port.try_clone().map_err(TransportError::connect)?;
        let mut sink = self.stdout.take();
        let stop = Arc::clone(&self.stop);
        let closed = Arc::clone(&self.closed);
        stop.store(false, Ordering::SeqCst);
        closed.store(false, Ordering::SeqCst);

        let reader = std::thread::Builder::new()
            .name("shellpilot-serial-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                while !stop.load(Ordering::SeqCst) {
                    match reader_port.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => {
                            if let Some(sink) = sink.as_mut() {
                                sink(&buf[..n]);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!(error = %e, "serial read failed, closing");
                            closed.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })
            .map_err(TransportError::connect)?;

        debug!(path = %self.options.path, speed = self.options.speed, "serial port open");
        self.port = Some(port);
        self.reader = Some(reader);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.port = None;
        Ok(())
    }

    fn active(&self) -> bool {
        self.port.is_some() && !self.closed.load(Ordering::SeqCst)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(data).map_err(TransportError::Io)?;
        let _ = port.flush();
        Ok(())
    }

    fn register_stdout(&mut self, sink: Sink) {
        self.stdout = Some(sink);
    }

    fn register_stderr(&mut self, _sink: Sink) {
        // Serial carries a single stream.
    }

    fn pump(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        // The reader strand delivers bytes; the pump only has to yield.
        std::thread::sleep(max_wait.min(Duration::from_millis(5)));
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
