use crate::errors::MigrationResult;
use std::io::{self, BufRead, Write};

/// Asks the operator to approve an irreversible step.
pub trait Confirm: Send + Sync {
    /// Show `prompt` and return whether the operator answered affirmatively.
    fn confirm(&self, prompt: &str) -> MigrationResult<bool>;
}

/// Reads the answer from stdin. Only an exact `yes` counts.
#[derive(Debug, Default)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> MigrationResult<bool> {
        let mut stdout = io::stdout().lock();
        write!(stdout, "{prompt} (yes/no): ")?;
        stdout.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(is_affirmative(&answer))
    }
}

/// Always gives the same answer; used by `--yes`, the self-test and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirm(pub bool);

impl Confirm for FixedConfirm {
    fn confirm(&self, _prompt: &str) -> MigrationResult<bool> {
        Ok(self.0)
    }
}

fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}
