//! # Operator Prompts
//!
//! Line-based questions at the bench terminal. The same prompter answers
//! the identity questions before a run and acts as the [`Operator`] that
//! flips the DIL switches during the voltage sweep.

use std::io::{self, BufRead, Stdout, Write};
use vcanqc_core::{CancelToken, Operator, QcError, SwitchState};

/// Questions on `output`, answers from `input`.
pub struct Prompter<R, W> {
    input: R,
    output: W,
    cancel: CancelToken,
}

/// The prompter wired to the process terminal.
pub type StdioPrompter = Prompter<io::StdinLock<'static>, Stdout>;

impl StdioPrompter {
    pub fn stdio(cancel: CancelToken) -> Self {
        Prompter::new(io::stdin().lock(), io::stdout(), cancel)
    }
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W, cancel: CancelToken) -> Self {
        Self {
            input,
            output,
            cancel,
        }
    }

    /// Print a line for the operator.
    pub fn say(&mut self, text: &str) -> Result<(), QcError> {
        writeln!(self.output, "{}", text)?;
        Ok(())
    }

    /// Ask and return the trimmed answer.
    ///
    /// End of input and a cancellation that arrived while waiting are both
    /// reported as [`QcError::Interrupted`].
    pub fn ask(&mut self, question: &str) -> Result<String, QcError> {
        write!(self.output, "{}: ", question)?;
        self.output.flush()?;
        let mut line = String::new();
        let n = self.input.read_line(&mut line)?;
        self.cancel.check()?;
        if n == 0 {
            return Err(QcError::Interrupted);
        }
        Ok(line.trim().to_string())
    }

    /// Ask, falling back to `default` on an empty answer.
    pub fn ask_with_default(&mut self, question: &str, default: &str) -> Result<String, QcError> {
        let answer = if default.is_empty() {
            self.ask(question)?
        } else {
            self.ask(&format!("{} [{}]", question, default))?
        };
        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer
        })
    }

    /// Yes/no question; anything but `y`/`yes` is no.
    pub fn confirm(&mut self, question: &str) -> Result<bool, QcError> {
        let answer = self.ask(&format!("{} [y/N]", question))?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    /// Ask until `check` accepts the answer, showing each rejection.
    pub fn ask_until<F>(&mut self, question: &str, mut check: F) -> Result<String, QcError>
    where
        F: FnMut(&str) -> Result<(), QcError>,
    {
        loop {
            let answer = self.ask(question)?;
            match check(&answer) {
                Ok(()) => return Ok(answer),
                Err(e) => self.say(&format!("  {}", e))?,
            }
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }
}

impl<R: BufRead, W: Write> Operator for Prompter<R, W> {
    fn set_switches(&mut self, state: SwitchState) -> Result<(), QcError> {
        self.say("")?;
        self.say(&format!("Set ALL DIL switches to {}.", state))?;
        self.ask("Press Enter when done")?;
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
    use std::io::Cursor;

    fn prompter(input: &str) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(
            Cursor::new(input.as_bytes().to_vec()),
            Vec::new(),
            CancelToken::new(),
        )
    }

    #[test]
    fn default_used_on_empty_answer() {
        let mut p = prompter("\nbob\n");
        assert_eq!(p.ask_with_default("Operator", "alice").unwrap(), "alice");
        assert_eq!(p.ask_with_default("Operator", "alice").unwrap(), "bob");
    }

    #[test]
    fn end_of_input_is_an_interruption() {
        let mut p = prompter("");
        assert!(matches!(p.ask("Serial"), Err(QcError::Interrupted)));
    }

    #[test]
    fn cancel_while_waiting_is_an_interruption() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut p = Prompter::new(Cursor::new(b"y\n".to_vec()), Vec::new(), cancel);
        assert!(matches!(p.confirm("Go?"), Err(QcError::Interrupted)));
    }

    #[test]
    fn ask_until_repeats_rejected_answers() {
        let mut p = prompter("12a\n1234\n");
        let answer = p
            .ask_until("Serial", |s| {
                if s.chars().all(|c| c.is_ascii_digit()) {
                    Ok(())
                } else {
                    Err(QcError::Configuration("digits only".to_string()))
                }
            })
            .unwrap();
        assert_eq!(answer, "1234");
        let (_, out) = p.into_parts();
        assert!(String::from_utf8(out).unwrap().contains("digits only"));
    }

    #[test]
    fn switch_prompt_names_the_position() {
        let mut p = prompter("\n");
        p.set_switches(SwitchState::On).unwrap();
        let (_, out) = p.into_parts();
        assert!(String::from_utf8(out).unwrap().contains("switches to ON"));
    }

    #[test]
    fn confirm_accepts_only_yes() {
        let mut p = prompter("YES\nn\nsure\n");
        assert!(p.confirm("Go?").unwrap());
        assert!(!p.confirm("Go?").unwrap());
        assert!(!p.confirm("Go?").unwrap());
    }
}
