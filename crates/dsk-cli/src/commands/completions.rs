use super::{CmdResult, EXIT_SUCCESS};
use clap::CommandFactory;
use clap_complete::Shell;

#[allow(clippy::unnecessary_wraps)]
pub fn run<C: CommandFactory>(shell: Shell) -> CmdResult {
    clap_complete::generate(shell, &mut C::command(), "dsk", &mut std::io::stdout());
    Ok(EXIT_SUCCESS)
}
