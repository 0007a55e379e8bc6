use std::io::Write;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;

use crate::Cli;

pub fn write_completions_script<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "rainup", &mut generated);

    writer
        .write_all(&generated)
        .with_context(|| format!("failed writing {shell} completion script"))?;
    writer
        .flush()
        .with_context(|| "failed flushing completion script")
}
