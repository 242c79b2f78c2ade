use std::process::ExitCode;

fn main() -> ExitCode {
    askops_cli::run()
}
