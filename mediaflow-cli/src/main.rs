mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use logging::LogFormat;

#[derive(Debug, Parser)]
#[command(
    name = "mediaflow",
    version,
    about = "Resumable orchestrator for media-processing stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Orchestrator config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run (or resume) a job's pipeline
    Run {
        /// Job id under the jobs root
        #[arg(long)]
        job: String,
        /// Run only these stages
        #[arg(long, num_args = 1..)]
        stages: Vec<String>,
        /// Ignore the stored manifest and start over
        #[arg(long)]
        no_resume: bool,
    },
    /// Print the stage catalog
    ListStages,
    /// Print the stored manifest of a job
    Status {
        /// Job id under the jobs root
        #[arg(long)]
        job: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version land here too and are not failures.
            let code = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };

    logging::init(&cli.log_level, cli.log_format);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run {
            job,
            stages,
            no_resume,
        } => commands::run::execute(config, &job, stages, no_resume).await,
        Commands::ListStages => commands::list_stages::execute(),
        Commands::Status { job } => commands::status::execute(config, &job),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "mediaflow", "run", "--job", "j1", "--stages", "asr", "mux", "--no-resume",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                job,
                stages,
                no_resume,
            } => {
                assert_eq!(job, "j1");
                assert_eq!(stages, vec!["asr", "mux"]);
                assert!(no_resume);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mediaflow", "list-stages", "--log-format", "json", "--config", "c.json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
    }

    #[test]
    fn test_run_requires_job() {
        let err = Cli::try_parse_from(["mediaflow", "run"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(err.use_stderr());
    }

    #[test]
    fn test_help_is_not_an_error_exit() {
        let err = Cli::try_parse_from(["mediaflow", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }
}
