use std::process::ExitCode;

fn main() -> ExitCode {
    eipua_gateway::runtime::run_from_args()
}
