use std::io::{self, BufRead, Write};

use tracing::debug;

/// Asks the operator before shared on-disk state changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prompter {
    interactive: bool,
}

impl Prompter {
    pub fn new(interactive: bool) -> Self {
        Prompter { interactive }
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// Always yes unless interactive.
    pub fn confirm(&self, question: &str) -> bool {
        if !self.interactive {
            return true;
        }
        let stdin = io::stdin();
        self.confirm_with(question, &mut stdin.lock(), &mut io::stderr())
    }

    pub fn confirm_with<R: BufRead, W: Write>(
        &self,
        question: &str,
        input: &mut R,
        output: &mut W,
    ) -> bool {
        if !self.interactive {
            return true;
        }
        if write!(output, "{question} [y/N] ").and_then(|_| output.flush()).is_err() {
            return false;
        }
        let mut answer = String::new();
        match input.read_line(&mut answer) {
            Ok(_) => {
                let yes = answer.trim_start().starts_with(['y', 'Y']);
                debug!("Answered {:?} to \"{question}\"", answer.trim());
                yes
            }
            Err(_) => false,
        }
    }
}
