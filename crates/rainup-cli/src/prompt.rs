use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use rainup_installer::{ConflictOutcome, ConflictRequest};

pub fn parse_answer(input: &str) -> Option<ConflictOutcome> {
    match input.trim().to_ascii_lowercase().as_str() {
        "o" | "overwrite" => Some(ConflictOutcome::Overwrite),
        "k" | "keep" => Some(ConflictOutcome::KeepLocal),
        "c" | "cancel" => Some(ConflictOutcome::Cancel),
        _ => None,
    }
}

/// Asks until a valid answer arrives. End of input cancels the run.
pub fn ask_conflict(
    request: &ConflictRequest,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<ConflictOutcome> {
    writeln!(
        output,
        "{} was modified since it was installed.",
        request.path()
    )
    .context("failed to write conflict prompt")?;

    loop {
        write!(output, "[o]verwrite / [k]eep / [c]ancel: ")
            .and_then(|()| output.flush())
            .context("failed to write conflict prompt")?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .context("failed to read conflict answer")?;
        if read == 0 {
            writeln!(output).context("failed to write conflict prompt")?;
            return Ok(ConflictOutcome::Cancel);
        }
        if let Some(outcome) = parse_answer(&line) {
            return Ok(outcome);
        }
        writeln!(output, "please answer o, k or c").context("failed to write conflict prompt")?;
    }
}
