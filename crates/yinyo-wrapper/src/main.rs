//! yinyo-wrapper - in-container pipeline for a single run
//!
//! Dispatched by the orchestrator as the container entrypoint. Used
//! internally by the system, never invoked by people.

mod client;
mod wrapper;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use wrapper::WrapperSettings;

/// In-container wrapper for the Yinyo run orchestrator.
#[derive(Debug, Parser)]
#[command(name = "yinyo-wrapper")]
#[command(about = "Manages the building and running of a scraper")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the building and running of a scraper inside a container
    Wrapper {
        /// Run id
        run_id: String,

        /// Run token
        run_token: String,

        /// Build toolchain app path
        #[arg(long, default_value = "/app")]
        app: PathBuf,

        /// Build toolchain import path
        #[arg(long, default_value = "/tmp/app")]
        import: PathBuf,

        /// Build toolchain cache path
        #[arg(long, default_value = "/tmp/cache")]
        cache: PathBuf,

        /// Relative path to the output file
        #[arg(long, default_value = "")]
        output: String,

        /// CSV-encoded environment variables (e.g. FOO=bar,BAZ=qux)
        #[arg(long, default_value = "")]
        env: String,

        /// Seconds before the cluster kills the run; enforced by the
        /// cluster backend, carried here for completeness
        #[arg(long, default_value_t = 0)]
        max_run_time: i64,

        /// Memory quota in bytes; enforced by the cluster backend
        #[arg(long, default_value_t = 0)]
        memory: i64,

        /// Orchestrator base URL
        #[arg(
            long,
            env = "YINYO_INTERNAL_SERVER_URL",
            default_value = "http://yinyo-server.yinyo:8080"
        )]
        server: String,
    },
}

fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Wrapper {
            run_id,
            run_token,
            app,
            import,
            cache,
            output,
            env,
            max_run_time: _,
            memory: _,
            server,
        } => {
            let settings = WrapperSettings {
                server_url: server,
                run_id,
                token: run_token,
                app_path: app,
                import_path: import,
                cache_path: cache,
                output,
                env,
            };
            runtime.block_on(wrapper::run(&settings))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_dispatched_command_line() {
        let cli = Cli::try_parse_from([
            "yinyo-wrapper",
            "wrapper",
            "run-abc",
            "supersecret",
            "--output",
            "out.csv",
            "--env",
            "A=1",
            "--max-run-time",
            "3600",
            "--memory",
            "1073741824",
        ])
        .unwrap();
        let Command::Wrapper {
            run_id,
            run_token,
            app,
            import,
            cache,
            output,
            env,
            max_run_time,
            memory,
            ..
        } = cli.command;
        assert_eq!(run_id, "run-abc");
        assert_eq!(run_token, "supersecret");
        assert_eq!(app, PathBuf::from("/app"));
        assert_eq!(import, PathBuf::from("/tmp/app"));
        assert_eq!(cache, PathBuf::from("/tmp/cache"));
        assert_eq!(output, "out.csv");
        assert_eq!(env, "A=1");
        assert_eq!(max_run_time, 3600);
        assert_eq!(memory, 1_073_741_824);
    }

    #[test]
    fn output_and_env_default_to_empty() {
        let cli = Cli::try_parse_from(["yinyo-wrapper", "wrapper", "run-abc", "token"]).unwrap();
        let Command::Wrapper { output, env, .. } = cli.command;
        assert_eq!(output, "");
        assert_eq!(env, "");
    }
}
