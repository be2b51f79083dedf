//! # Serial Link
//!
//! Framed request/response exchanges over the shared half-duplex channel.
//!
//! The channel carries exactly one exchange at a time and nothing on the
//! wire ties a response to its request. A leftover line from an earlier
//! exchange would be read as the answer to the current one, so every
//! [`SerialLink::request`] drains the input before it writes.
//!
//! Timeouts and malformed lines are returned as errors for the calling
//! stage to count as a failed sample; they never terminate the process.

use crate::cancel::CancelToken;
use crate::protocol::{AdcSnapshot, SerialCommand, SerialResponse, unexpected};
use crate::types::{Channel, QcError};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default per-request response deadline.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Back-off when the transport has nothing to read.
const IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Longest partial line kept while waiting for a newline.
pub const MAX_LINE_BYTES: usize = 4096;

/// Delay between the two power-down writes, and before the final drain.
const POWER_DOWN_GAP: Duration = Duration::from_millis(100);

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

/// Byte-level access to an already-open channel.
///
/// Implemented by the serial-port adapter in the binary and by
/// [`crate::sim::SimulatedTester`].
pub trait Transport {
    /// Write all bytes.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Push written bytes onto the wire.
    fn flush(&mut self) -> io::Result<()>;

    /// Read whatever is available into `buf`.
    ///
    /// May block for a short, transport-defined poll interval. `Ok(0)` or an
    /// error of kind `TimedOut`/`WouldBlock` means nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Throw away everything received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

// =============================================================================
// SERIAL LINK
// =============================================================================

/// Line-oriented request/response layer on top of a [`Transport`].
///
/// Owning the link (or holding `&mut` to it) is the single-owner lock on
/// the physical channel.
#[derive(Debug)]
pub struct SerialLink<T: Transport> {
    transport: T,
    /// Bytes received but not yet assembled into a full line.
    pending: Vec<u8>,
    cancel: CancelToken,
    response_timeout: Duration,
    /// Last command written, for timeout diagnostics.
    last_command: String,
}

impl<T: Transport> SerialLink<T> {
    /// Wrap an open transport.
    pub fn new(transport: T, cancel: CancelToken) -> Self {
        Self {
            transport,
            pending: Vec::with_capacity(128),
            cancel,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            last_command: String::new(),
        }
    }

    /// Override the default per-request deadline.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Access the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Discard buffered unread bytes, both in the link and in the transport.
    pub fn drain(&mut self) -> Result<(), QcError> {
        if !self.pending.is_empty() {
            trace!(bytes = self.pending.len(), "discarding partial line");
        }
        self.pending.clear();
        self.transport.discard_input()?;
        Ok(())
    }

    /// Write one framed command and flush.
    ///
    /// Does not observe cancellation, so power-down writes always go out.
    pub fn send(&mut self, command: &SerialCommand) -> Result<(), QcError> {
        let line = command.to_line();
        debug!(command = %command, "-->");
        self.transport.write_all(line.as_bytes())?;
        self.transport.flush()?;
        self.last_command = command.to_string();
        Ok(())
    }

    /// Block until one full, non-empty line arrives or `timeout` elapses.
    pub fn receive_line(&mut self, timeout: Duration) -> Result<String, QcError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];

        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                debug!(line = %line, "<--");
                return Ok(line);
            }

            self.cancel.check()?;
            if Instant::now() >= deadline {
                return Err(QcError::ProtocolTimeout {
                    command: self.last_command.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            match self.transport.read_available(&mut chunk) {
                Ok(0) => std::thread::sleep(IDLE_BACKOFF),
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if self.pending.len() > MAX_LINE_BYTES
                        && !self.pending.contains(&b'\n')
                    {
                        let dropped = self.pending.len();
                        self.pending.clear();
                        return Err(QcError::ProtocolParse(format!(
                            "no line ending within {dropped} bytes"
                        )));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    std::thread::sleep(IDLE_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive and parse one line.
    pub fn receive(&mut self, timeout: Duration) -> Result<SerialResponse, QcError> {
        let line = self.receive_line(timeout)?;
        SerialResponse::parse(&line)
    }

    /// Drain, send, then receive one parsed response.
    pub fn request(
        &mut self,
        command: &SerialCommand,
        timeout: Duration,
    ) -> Result<SerialResponse, QcError> {
        self.drain()?;
        self.send(command)?;
        self.receive(timeout)
    }

    /// [`Self::request`] with the link's default deadline.
    pub fn request_default(&mut self, command: &SerialCommand) -> Result<SerialResponse, QcError> {
        let timeout = self.response_timeout;
        self.request(command, timeout)
    }

    /// Pop one line (without `\r\n`) from the pending buffer.
    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let text = String::from_utf8_lossy(&raw[..end]);
        Some(text.trim_end_matches('\r').trim().to_string())
    }

    // =========================================================================
    // TYPED EXCHANGES
    // =========================================================================

    /// `CHECK_SPI_ADC` → `DATA:`.
    pub fn read_adc(&mut self) -> Result<AdcSnapshot, QcError> {
        match self.request_default(&SerialCommand::CheckSpiAdc)? {
            SerialResponse::Data(snapshot) => Ok(snapshot),
            other => Err(unexpected("DATA", &other)),
        }
    }

    /// `SET_VCAN_VOLTAGE` → `VCAN_DATA:` (fast SPI readback of both channels).
    pub fn set_vcan_voltage(&mut self, code: u8) -> Result<(f64, f64), QcError> {
        match self.request_default(&SerialCommand::SetVcanVoltage(code))? {
            SerialResponse::VcanData { a, b } => Ok((a, b)),
            other => Err(unexpected("VCAN_DATA", &other)),
        }
    }

    /// `READ_I2C_VOLTAGE_<ch>` → `I2C_VOLTAGE_<ch>:` (precise path).
    pub fn read_i2c_voltage(&mut self, channel: Channel) -> Result<f64, QcError> {
        match self.request_default(&SerialCommand::ReadI2cVoltage(channel))? {
            SerialResponse::I2cVoltage { channel: ch, volts } if ch == channel => Ok(volts),
            other => Err(unexpected("I2C_VOLTAGE", &other)),
        }
    }

    /// `READ_MASTER_SPI` → `(voltage, current)` of channel A.
    pub fn read_master_spi(&mut self) -> Result<(f64, f64), QcError> {
        match self.request_default(&SerialCommand::ReadMasterSpi)? {
            SerialResponse::MasterSpi { voltage, current } => Ok((voltage, current)),
            other => Err(unexpected("MASTER_SPI", &other)),
        }
    }

    /// `SET_I2C_CURRENT` and require the acknowledgement.
    pub fn set_current_dac(&mut self, dac: u16) -> Result<(), QcError> {
        match self.request_default(&SerialCommand::SetI2cCurrent(dac))? {
            SerialResponse::AckCurrentSet => Ok(()),
            other => Err(unexpected("ACK_CURRENT_SET", &other)),
        }
    }

    /// `GET_TEST_INFO` → `(master_id, psu_voltage)`.
    pub fn test_info(&mut self) -> Result<(String, f64), QcError> {
        match self.request_default(&SerialCommand::GetTestInfo)? {
            SerialResponse::TestInfo {
                master_id,
                psu_voltage,
            } => Ok((master_id, psu_voltage)),
            other => Err(unexpected("TEST_INFO", &other)),
        }
    }

    /// Voltage and current of both channels: A from `MASTER_SPI`, B from `DATA`.
    pub fn read_all_channels(&mut self) -> Result<ChannelReadings, QcError> {
        let (v_a, i_a) = self.read_master_spi()?;
        let snapshot = self.read_adc()?;
        Ok(ChannelReadings {
            v_a,
            i_a,
            v_b: snapshot.vcan_v,
            i_b: snapshot.vcan_i,
        })
    }

    /// Command voltage and current to zero, ignoring cancellation.
    ///
    /// Fire-and-forget: responses are not awaited, only drained afterwards.
    /// Both zeroing writes are always attempted; the first failure is
    /// returned after the second write has been tried.
    pub fn power_down(&mut self) -> Result<(), QcError> {
        if let Err(e) = self.drain() {
            warn!(error = %e, "drain before power-down failed");
        }
        let voltage = self.send(&SerialCommand::SetVcanVoltage(0));
        if let Err(e) = &voltage {
            warn!(error = %e, "zero-voltage write failed");
        }
        std::thread::sleep(POWER_DOWN_GAP);
        let current = self.send(&SerialCommand::SetI2cCurrent(0));
        if let Err(e) = &current {
            warn!(error = %e, "zero-current write failed");
        }
        std::thread::sleep(POWER_DOWN_GAP);
        if let Err(e) = self.drain() {
            warn!(error = %e, "drain after power-down failed");
        }
        voltage.and(current)
    }
}

/// Voltage and current of both channels at one instant.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ChannelReadings {
    pub v_a: f64,
    pub i_a: f64,
    pub v_b: f64,
    pub i_b: f64,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Transport that replays canned input and records output.
    #[derive(Default)]
    struct Scripted {
        input: VecDeque<u8>,
        written: Vec<u8>,
        discards: usize,
        /// Lines that become readable on the next write.
        replies: VecDeque<&'static str>,
    }

    impl Transport for Scripted {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(bytes);
            if let Some(reply) = self.replies.pop_front() {
                self.input.extend(reply.as_bytes());
            }
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.input.len()).min(7);
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.discards += 1;
            self.input.clear();
            Ok(())
        }
    }

    /// Transport whose input purge always fails.
    #[derive(Default)]
    struct PurgeFails {
        written: Vec<u8>,
        write_attempts: usize,
        fail_writes: bool,
    }

    impl Transport for PurgeFails {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.write_attempts += 1;
            if self.fail_writes {
                return Err(io::Error::other("write failed"));
            }
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read_available(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn discard_input(&mut self) -> io::Result<()> {
            Err(io::Error::other("purge failed"))
        }
    }

    /// Transport that streams bytes without ever ending a line.
    struct Babbler;

    impl Transport for Babbler {
        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(b'x');
            Ok(buf.len())
        }

        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn link(script: Scripted) -> SerialLink<Scripted> {
        SerialLink::new(script, CancelToken::new())
            .with_response_timeout(Duration::from_millis(50))
    }

    #[test]
    fn request_drains_stale_bytes_before_sending() {
        let mut script = Scripted::default();
        script.input.extend(b"VCAN_DATA:9.9,9.9\n");
        script.replies.push_back("VCAN_DATA:2.0,2.01\n");
        let mut link = link(script);

        let (a, b) = link.set_vcan_voltage(0x1F).expect("exchange");
        assert_eq!((a, b), (2.0, 2.01));
        assert_eq!(link.transport_mut().discards, 1);
        assert_eq!(link.transport_mut().written, b"SET_VCAN_VOLTAGE 31\n");
    }

    #[test]
    fn receive_assembles_fragmented_lines_and_skips_blank_ones() {
        let mut script = Scripted::default();
        script.input.extend(b"\r\n\nI2C_VOLTAGE_A:1.250\r\n");
        let mut link = link(script);
        let response = link.receive(Duration::from_millis(50)).expect("line");
        assert_eq!(
            response,
            SerialResponse::I2cVoltage {
                channel: Channel::A,
                volts: 1.25
            }
        );
    }

    #[test]
    fn silence_is_a_timeout() {
        let mut link = link(Scripted::default());
        let err = link
            .request(&SerialCommand::ReadTemp, Duration::from_millis(20))
            .expect_err("no reply");
        match err {
            QcError::ProtocolTimeout { command, .. } => assert_eq!(command, "READ_TEMP"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn wrong_tag_is_a_parse_error() {
        let mut script = Scripted::default();
        script.replies.push_back("hello\n");
        let mut link = link(script);
        assert!(matches!(link.read_adc(), Err(QcError::ProtocolParse(_))));
    }

    #[test]
    fn cancelled_receive_is_interrupted() {
        let mut link = link(Scripted::default());
        link.cancel_token().cancel();
        assert!(matches!(
            link.receive(Duration::from_secs(5)),
            Err(QcError::Interrupted)
        ));
    }

    #[test]
    fn power_down_ignores_cancellation() {
        let mut link = link(Scripted::default());
        link.cancel_token().cancel();
        link.power_down().expect("power down");
        assert_eq!(
            link.transport_mut().written,
            b"SET_VCAN_VOLTAGE 0\nSET_I2C_CURRENT 0\n"
        );
    }

    #[test]
    fn power_down_survives_failed_purge() {
        let mut link = SerialLink::new(PurgeFails::default(), CancelToken::new());
        link.power_down().expect("writes succeed");
        assert_eq!(
            link.transport_mut().written,
            b"SET_VCAN_VOLTAGE 0\nSET_I2C_CURRENT 0\n"
        );
    }

    #[test]
    fn power_down_reports_write_failure_after_trying_both() {
        let transport = PurgeFails {
            fail_writes: true,
            ..PurgeFails::default()
        };
        let mut link = SerialLink::new(transport, CancelToken::new());
        assert!(matches!(link.power_down(), Err(QcError::Io(_))));
        assert_eq!(link.transport_mut().write_attempts, 2);
    }

    #[test]
    fn endless_line_is_a_parse_error() {
        let mut link = SerialLink::new(Babbler, CancelToken::new());
        let err = link.receive_line(Duration::from_secs(5)).expect_err("no newline");
        assert!(matches!(err, QcError::ProtocolParse(_)), "{err:?}");
        assert!(link.pending.is_empty());
    }
}
