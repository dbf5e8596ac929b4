pub mod list_stages;
pub mod run;
pub mod status;

use std::process::ExitCode;

/// Maps a pipeline exit code onto the process exit code.
pub fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
