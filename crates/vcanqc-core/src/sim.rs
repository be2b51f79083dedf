//! # Simulated Tester
//!
//! In-process model of the embedded tester and the board under test.
//!
//! It speaks the full command vocabulary over [`Transport`], answers from a
//! [`VoltageCodeTable`], and lets a test script the faults the bench sees in
//! practice: offset readings, stale lines, silent commands, a CAN run that
//! never finishes, a failing slave sensor, and a rail that drifts during a soak.
//!
//! Every parsed command is logged, so tests can assert on the exact wire
//! conversation, and the energized state (non-zero voltage code, current DAC
//! or running firmware burnout) can be inspected at any point.

use crate::link::Transport;
use crate::protocol::{ACK_CURRENT_SET, SerialCommand};
use crate::stages::Operator;
use crate::tolerance::{Revision, VoltageCodeTable};
use crate::types::{Channel, QcError, SwitchState};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// DAC full-scale count shared with the current stage.
const DAC_FULL_SCALE: f64 = 4095.0;

/// Number of progress lines emitted per CAN or burnout run.
const PROGRESS_STEPS: u32 = 4;

// =============================================================================
// BEHAVIOURS
// =============================================================================

/// How the device answers `RUN_CAN_TEST`.
#[derive(Debug, Clone, PartialEq)]
pub enum CanBehavior {
    Pass,
    Fail(String),
    /// Progress lines only, never a final line.
    Silent,
}

/// How the device answers `RUN_BURNOUT_TEST` with a non-zero duration.
#[derive(Debug, Clone, PartialEq)]
pub enum BurnoutBehavior {
    Complete,
    Fail(String),
}

// =============================================================================
// SWITCHES
// =============================================================================

/// Shared handle to the simulated DIL switch bank.
///
/// Cloned into an [`Operator`] so stages can flip the switches the way a
/// person at the bench would.
#[derive(Debug, Clone, Default)]
pub struct SimSwitches {
    on: Arc<AtomicBool>,
}

impl SimSwitches {
    #[must_use]
    pub fn state(&self) -> SwitchState {
        if self.on.load(Ordering::SeqCst) {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }

    pub fn set(&self, state: SwitchState) {
        self.on.store(state.is_on(), Ordering::SeqCst);
    }
}

impl Operator for SimSwitches {
    fn set_switches(&mut self, state: SwitchState) -> Result<(), QcError> {
        self.set(state);
        Ok(())
    }
}

// =============================================================================
// SIMULATED TESTER
// =============================================================================

/// A tester plus board that lives in memory.
#[derive(Debug)]
pub struct SimulatedTester {
    table: VoltageCodeTable,
    switches: SimSwitches,

    // Drive state
    vcan_code: u8,
    dac: u16,
    burnout_running: bool,

    // Wire state
    outbox: VecDeque<u8>,
    log: Vec<SerialCommand>,
    silent: BTreeSet<String>,

    // Board model
    cic_voltage: f64,
    cic_current: f64,
    rail_voltage: [f64; 2],
    rail_script: VecDeque<f64>,
    idle_current: f64,
    r_ref_ohms: f64,
    v_ref_dac_volts: f64,
    current_gain: [f64; 2],
    spi_offset: [f64; 2],
    i2c_offset: [f64; 2],
    code_faults: BTreeMap<(u8, Channel), f64>,
    master_temp: f64,
    slave_temp: f64,
    master_id: String,
    psu_voltage: f64,
    can: CanBehavior,
    burnout: BurnoutBehavior,
}

impl Default for SimulatedTester {
    fn default() -> Self {
        Self::new(VoltageCodeTable::from_revision(Revision::Top4v7))
    }
}

impl SimulatedTester {
    /// A healthy board answering from `table`.
    #[must_use]
    pub fn new(table: VoltageCodeTable) -> Self {
        Self {
            table,
            switches: SimSwitches::default(),
            vcan_code: 0,
            dac: 0,
            burnout_running: false,
            outbox: VecDeque::new(),
            log: Vec::new(),
            silent: BTreeSet::new(),
            cic_voltage: 3.3,
            cic_current: 0.120,
            rail_voltage: [3.3, 3.3],
            rail_script: VecDeque::new(),
            idle_current: 0.010,
            r_ref_ohms: 10.0,
            v_ref_dac_volts: 3.3,
            current_gain: [1.0, 1.0],
            spi_offset: [0.0, 0.0],
            i2c_offset: [0.0, 0.0],
            code_faults: BTreeMap::new(),
            master_temp: 24.50,
            slave_temp: 25.12,
            master_id: "QC-Station-01".to_string(),
            psu_voltage: 3.3,
            can: CanBehavior::Pass,
            burnout: BurnoutBehavior::Complete,
        }
    }

    // =========================================================================
    // FAULT INJECTION / SETUP
    // =========================================================================

    /// Handle to the switch bank, usable as an [`Operator`].
    #[must_use]
    pub fn switches(&self) -> SimSwitches {
        self.switches.clone()
    }

    /// Constant error added to the fast SPI reading of one channel.
    #[must_use]
    pub fn with_spi_offset(mut self, channel: Channel, delta: f64) -> Self {
        self.spi_offset[idx(channel)] = delta;
        self
    }

    /// Constant error added to the precise I2C reading of one channel.
    #[must_use]
    pub fn with_i2c_offset(mut self, channel: Channel, delta: f64) -> Self {
        self.i2c_offset[idx(channel)] = delta;
        self
    }

    /// Error added on both paths of one channel, only while `code` is driven.
    #[must_use]
    pub fn with_code_fault(mut self, code: u8, channel: Channel, delta: f64) -> Self {
        self.code_faults.insert((code, channel), delta);
        self
    }

    /// Rail voltage reported by `MASTER_SPI` (A) and `DATA` (B).
    #[must_use]
    pub fn with_rail_voltage(mut self, channel: Channel, volts: f64) -> Self {
        self.rail_voltage[idx(channel)] = volts;
        self
    }

    /// Channel A rail readings for successive `READ_MASTER_SPI` requests.
    ///
    /// The last value sticks once the script runs out.
    #[must_use]
    pub fn with_rail_script(mut self, volts: impl IntoIterator<Item = f64>) -> Self {
        self.rail_script.extend(volts);
        self
    }

    /// Multiplier on the commanded current of one channel.
    #[must_use]
    pub fn with_current_gain(mut self, channel: Channel, gain: f64) -> Self {
        self.current_gain[idx(channel)] = gain;
        self
    }

    /// Current drawn with the DAC at zero.
    #[must_use]
    pub fn with_idle_current(mut self, amps: f64) -> Self {
        self.idle_current = amps;
        self
    }

    /// Reference resistor and DAC reference of the current sink.
    #[must_use]
    pub fn with_current_sink(mut self, r_ref_ohms: f64, v_ref_dac_volts: f64) -> Self {
        self.r_ref_ohms = r_ref_ohms;
        self.v_ref_dac_volts = v_ref_dac_volts;
        self
    }

    #[must_use]
    pub fn with_cic(mut self, volts: f64, amps: f64) -> Self {
        self.cic_voltage = volts;
        self.cic_current = amps;
        self
    }

    #[must_use]
    pub fn with_temperatures(mut self, master: f64, slave: f64) -> Self {
        self.master_temp = master;
        self.slave_temp = slave;
        self
    }

    #[must_use]
    pub fn with_test_info(mut self, master_id: impl Into<String>, psu_voltage: f64) -> Self {
        self.master_id = master_id.into();
        self.psu_voltage = psu_voltage;
        self
    }

    #[must_use]
    pub fn with_can(mut self, behavior: CanBehavior) -> Self {
        self.can = behavior;
        self
    }

    #[must_use]
    pub fn with_burnout(mut self, behavior: BurnoutBehavior) -> Self {
        self.burnout = behavior;
        self
    }

    /// Never answer commands whose name (first word) is `name`.
    #[must_use]
    pub fn with_silent(mut self, name: &str) -> Self {
        self.silent.insert(name.to_string());
        self
    }

    /// Put a line on the wire right now, as if left over from earlier traffic.
    pub fn inject_line(&mut self, line: &str) {
        self.push_line(line);
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> &[SerialCommand] {
        &self.log
    }

    /// True while voltage, current or a firmware burnout is active.
    #[must_use]
    pub fn is_energized(&self) -> bool {
        self.vcan_code != 0 || self.dac != 0 || self.burnout_running
    }

    #[must_use]
    pub fn vcan_code(&self) -> u8 {
        self.vcan_code
    }

    #[must_use]
    pub fn current_dac(&self) -> u16 {
        self.dac
    }

    // =========================================================================
    // DEVICE MODEL
    // =========================================================================

    fn push_line(&mut self, line: &str) {
        self.outbox.extend(line.as_bytes());
        self.outbox.extend(b"\r\n");
    }

    fn vcan_level(&self, channel: Channel) -> f64 {
        let base = self.table.voltage_for_code(self.vcan_code, self.switches.state());
        let fault = self
            .code_faults
            .get(&(self.vcan_code, channel))
            .copied()
            .unwrap_or(0.0);
        base + fault
    }

    fn channel_current(&self, channel: Channel) -> f64 {
        if self.dac == 0 {
            return self.idle_current;
        }
        let commanded = f64::from(self.dac) * self.v_ref_dac_volts / (self.r_ref_ohms * DAC_FULL_SCALE);
        commanded * self.current_gain[idx(channel)]
    }

    fn handle(&mut self, line: &str) {
        let command = match line.parse::<SerialCommand>() {
            Ok(command) => command,
            Err(_) => {
                self.push_line("ERR:UNKNOWN_COMMAND");
                return;
            }
        };
        self.log.push(command.clone());

        let name = line.split_whitespace().next().unwrap_or_default();
        let silent = self.silent.contains(name);

        // State changes apply even when the reply is suppressed.
        match &command {
            SerialCommand::SetVcanVoltage(code) => self.vcan_code = *code,
            SerialCommand::SetI2cCurrent(dac) => self.dac = *dac,
            SerialCommand::RunBurnoutTest(p) => self.burnout_running = p.duration_s != 0,
            SerialCommand::ReadMasterSpi => {
                if let Some(v) = self.rail_script.pop_front() {
                    self.rail_voltage[0] = v;
                }
            }
            _ => {}
        }
        if silent {
            return;
        }

        match command {
            SerialCommand::SetVcanVoltage(_) => {
                let a = self.vcan_level(Channel::A) + self.spi_offset[0];
                let b = self.vcan_level(Channel::B) + self.spi_offset[1];
                self.push_line(&format!("VCAN_DATA:{:.4},{:.4}", a, b));
            }
            SerialCommand::SetI2cCurrent(_) => self.push_line(ACK_CURRENT_SET),
            SerialCommand::ReadI2cVoltage(ch) => {
                let v = self.vcan_level(ch) + self.i2c_offset[idx(ch)];
                self.push_line(&format!("I2C_VOLTAGE_{}:{:.4}", ch.letter(), v));
            }
            SerialCommand::CheckSpiAdc => {
                let line = format!(
                    "DATA:{:.4},{:.4},{:.4},{:.4}",
                    self.cic_voltage,
                    self.cic_current,
                    self.rail_voltage[1],
                    self.channel_current(Channel::B)
                );
                self.push_line(&line);
            }
            SerialCommand::ReadMasterSpi => {
                let line = format!(
                    "MASTER_SPI:{:.4},{:.4},{:.4}",
                    self.rail_voltage[0],
                    self.channel_current(Channel::A),
                    self.cic_voltage
                );
                self.push_line(&line);
            }
            SerialCommand::RunCanTest(n) => {
                for step in 1..=PROGRESS_STEPS {
                    self.push_line(&format!(
                        "CAN_TEST_PROGRESS:{}/{}",
                        u64::from(n) * u64::from(step) / u64::from(PROGRESS_STEPS),
                        n
                    ));
                }
                match self.can.clone() {
                    CanBehavior::Pass => self.push_line(&format!("CAN_TEST_FINAL:PASS:{}/{} frames", n, n)),
                    CanBehavior::Fail(detail) => {
                        self.push_line(&format!("CAN_TEST_FINAL:FAIL:{}", detail));
                    }
                    CanBehavior::Silent => {}
                }
            }
            SerialCommand::RunBurnoutTest(p) => {
                if p.duration_s == 0 {
                    return;
                }
                for step in 1..=PROGRESS_STEPS {
                    let elapsed =
                        u128::from(p.duration_s) * u128::from(step) / u128::from(PROGRESS_STEPS);
                    let line = format!(
                        "BURNOUT_PROGRESS:{}/{}s VA={:.3} IA={:.3}",
                        elapsed,
                        p.duration_s,
                        self.rail_voltage[0],
                        self.channel_current(Channel::A)
                    );
                    self.push_line(&line);
                }
                match self.burnout.clone() {
                    BurnoutBehavior::Complete => self.push_line("BURNOUT_FINAL:COMPLETE"),
                    BurnoutBehavior::Fail(reason) => {
                        self.push_line(&format!("BURNOUT_FINAL:FAIL:{}", reason));
                    }
                }
                self.burnout_running = false;
            }
            SerialCommand::ReadTemp => {
                let line = format!(
                    "TEMPERATURES:Master={:.2},Slave={:.2}",
                    self.master_temp, self.slave_temp
                );
                self.push_line(&line);
            }
            SerialCommand::GetTestInfo => {
                let line = format!("TEST_INFO:{}:{}", self.master_id, self.psu_voltage);
                self.push_line(&line);
            }
        }
    }
}

fn idx(channel: Channel) -> usize {
    match channel {
        Channel::A => 0,
        Channel::B => 1,
    }
}

impl Transport for SimulatedTester {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        for line in text.split('\n') {
            let line = line.trim();
            if !line.is_empty() {
                self.handle(line);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.outbox.clear();
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::link::SerialLink;
    use crate::protocol::SerialResponse;
    use std::time::Duration;

    fn link(sim: SimulatedTester) -> SerialLink<SimulatedTester> {
        SerialLink::new(sim, CancelToken::new()).with_response_timeout(Duration::from_millis(100))
    }

    #[test]
    fn answers_from_table_and_switches() {
        let sim = SimulatedTester::default();
        let switches = sim.switches();
        let mut link = link(sim);

        assert_eq!(link.set_vcan_voltage(0x1f).expect("set"), (1.25, 1.25));
        switches.set(SwitchState::On);
        assert_eq!(link.set_vcan_voltage(0x1f).expect("set"), (2.0, 2.0));
        assert_eq!(link.read_i2c_voltage(Channel::B).expect("i2c"), 2.0);
    }

    #[test]
    fn current_follows_dac() {
        let mut link = link(SimulatedTester::default());
        link.set_current_dac(1241).expect("ack");
        let (_, i_a) = link.read_master_spi().expect("spi");
        assert!((i_a - 0.1).abs() < 1e-3);
        assert!(link.transport_mut().is_energized());
    }

    #[test]
    fn can_progress_handles_huge_message_counts() {
        let mut link = link(SimulatedTester::default());
        link.send(&SerialCommand::RunCanTest(u32::MAX)).expect("send");
        let timeout = Duration::from_millis(100);
        assert_eq!(
            link.receive_line(timeout).expect("first"),
            "CAN_TEST_PROGRESS:1073741823/4294967295"
        );
        for _ in 0..3 {
            link.receive_line(timeout).expect("progress");
        }
        assert_eq!(
            link.receive_line(timeout).expect("final"),
            "CAN_TEST_FINAL:PASS:4294967295/4294967295 frames"
        );
    }

    #[test]
    fn stale_line_is_drained() {
        let mut sim = SimulatedTester::default();
        sim.inject_line("VCAN_DATA:9.0,9.0");
        let mut link = link(sim);
        assert_eq!(link.set_vcan_voltage(0).expect("set"), (0.0, 0.0));
    }

    #[test]
    fn silent_command_times_out() {
        let mut link = link(SimulatedTester::default().with_silent("READ_TEMP"));
        assert!(matches!(
            link.request_default(&SerialCommand::ReadTemp),
            Err(QcError::ProtocolTimeout { .. })
        ));
        assert_eq!(link.transport_mut().commands(), &[SerialCommand::ReadTemp]);
    }

    #[test]
    fn rail_script_is_consumed_per_master_read() {
        let mut link = link(SimulatedTester::default().with_rail_script([3.2, 4.0]));
        assert_eq!(link.read_master_spi().expect("a").0, 3.2);
        assert_eq!(link.read_master_spi().expect("a").0, 4.0);
        assert_eq!(link.read_master_spi().expect("a").0, 4.0);
    }

    #[test]
    fn can_run_reports_progress_then_final() {
        let mut link = link(SimulatedTester::default());
        let first = link
            .request_default(&SerialCommand::RunCanTest(8))
            .expect("progress");
        assert_eq!(first, SerialResponse::CanProgress("2/8".into()));
        let mut last = first;
        while let Ok(r) = link.receive(Duration::from_millis(20)) {
            last = r;
        }
        assert!(matches!(last, SerialResponse::CanFinal { passed: true, .. }));
    }
}
