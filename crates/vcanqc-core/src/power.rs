//! # Power Guard
//!
//! Scoped "hardware energized" state.
//!
//! A stage that drives voltage or current acquires a [`PowerGuard`] before
//! its first energizing command. The guard derefs to the link, so the stage
//! talks to the tester through it. Whether the stage returns normally,
//! bails out with `?`, is interrupted, or unwinds, the guard's drop commands
//! voltage and current back to zero. [`PowerGuard::release`] does the same
//! eagerly and reports the outcome.

use crate::link::{SerialLink, Transport};
use crate::protocol::SerialCommand;
use crate::types::{QcError, StageId};
use std::ops::{Deref, DerefMut};
use tracing::{error, info, warn};

/// Exclusive, energized access to the link for the duration of a stage.
pub struct PowerGuard<'a, T: Transport> {
    link: &'a mut SerialLink<T>,
    stage: StageId,
    /// Sent before the power-down pair, e.g. the firmware burnout stop.
    pre_shutdown: Option<SerialCommand>,
    released: bool,
}

impl<'a, T: Transport> PowerGuard<'a, T> {
    /// Take the link for an energizing stage.
    pub fn energize(link: &'a mut SerialLink<T>, stage: StageId) -> Self {
        info!(stage = %stage, "energizing");
        Self {
            link,
            stage,
            pre_shutdown: None,
            released: false,
        }
    }

    /// Register a command to send ahead of the power-down pair.
    pub fn before_shutdown(&mut self, command: SerialCommand) {
        self.pre_shutdown = Some(command);
    }

    /// Drop a previously registered pre-shutdown command.
    pub fn clear_before_shutdown(&mut self) {
        self.pre_shutdown = None;
    }

    /// Power down now and report whether the commands went out.
    pub fn release(mut self) -> Result<(), QcError> {
        self.released = true;
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), QcError> {
        if let Some(command) = self.pre_shutdown.take() {
            if let Err(e) = self.link.send(&command) {
                warn!(stage = %self.stage, error = %e, "pre-shutdown command failed");
            }
        }
        info!(stage = %self.stage, "powering down");
        self.link.power_down()
    }
}

impl<T: Transport> Deref for PowerGuard<'_, T> {
    type Target = SerialLink<T>;

    fn deref(&self) -> &Self::Target {
        &*self.link
    }
}

impl<T: Transport> DerefMut for PowerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.link
    }
}

impl<T: Transport> Drop for PowerGuard<'_, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.shutdown() {
            error!(stage = %self.stage, error = %e, "POWER-DOWN FAILED, board may still be energized");
        }
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
    use crate::sim::SimulatedTester;

    fn sim_link() -> SerialLink<SimulatedTester> {
        SerialLink::new(SimulatedTester::default(), CancelToken::new())
    }

    #[test]
    fn drop_powers_down() {
        let mut link = sim_link();
        {
            let mut guard = PowerGuard::energize(&mut link, StageId::Current);
            guard.set_vcan_voltage(0xff).expect("set");
            assert!(guard.transport_mut().is_energized());
        }
        assert!(!link.transport_mut().is_energized());
    }

    #[test]
    fn early_return_powers_down() {
        fn stage(link: &mut SerialLink<SimulatedTester>) -> Result<(), QcError> {
            let mut guard = PowerGuard::energize(link, StageId::Burnout);
            guard.set_vcan_voltage(0xff)?;
            guard.set_current_dac(4095)?;
            Err(QcError::SafetyViolation("test".into()))
        }
        let mut link = sim_link();
        assert!(stage(&mut link).is_err());
        assert!(!link.transport_mut().is_energized());
    }

    #[test]
    fn release_sends_pre_shutdown_first() {
        let mut link = sim_link();
        let mut guard = PowerGuard::energize(&mut link, StageId::Can);
        guard.before_shutdown(SerialCommand::ReadTemp);
        guard.release().expect("release");
        let log = link.transport_mut().commands().to_vec();
        assert_eq!(
            log,
            vec![
                SerialCommand::ReadTemp,
                SerialCommand::SetVcanVoltage(0),
                SerialCommand::SetI2cCurrent(0),
            ]
        );
    }
}
