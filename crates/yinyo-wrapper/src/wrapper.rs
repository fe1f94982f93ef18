//! The build/run pipeline executed inside the scraper container.
//!
//! The wrapper pulls the run's source and cache from the API, runs the
//! build and execute commands as child processes while streaming their
//! output line-by-line as log events, uploads the cache and output, and
//! reports exit data. The terminal `last` event is posted on every exit
//! path, including internal failures, which surface as `interr` log
//! events rather than wrapper exit codes.

use crate::client::RunClient;
use chrono::Utc;
use nix::sys::resource::{getrusage, Usage as ResourceUsage, UsageWho};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use sysinfo::Networks;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};
use yinyo_core::{envstring, Event, ExitDataStage, Stage, Stream, Usage};

/// The build toolchain is pointed at a fixed entrypoint so its result
/// does not depend on whatever Procfile the scraper shipped.
const PROCFILE_CONTENTS: &str = "scraper: /bin/start.sh";

const DEFAULT_BUILD_COMMAND: &str = "/bin/herokuish buildpack build";
const DEFAULT_RUN_COMMAND: &str = "/bin/herokuish procfile start scraper";

/// Everything the wrapper needs, from its command line and environment.
#[derive(Debug, Clone)]
pub struct WrapperSettings {
    pub server_url: String,
    pub run_id: String,
    pub token: String,
    pub app_path: PathBuf,
    pub import_path: PathBuf,
    pub cache_path: PathBuf,
    /// Output file path relative to the app directory; empty for none.
    pub output: String,
    /// CSV-encoded user environment.
    pub env: String,
}

fn build_command() -> String {
    std::env::var("YINYO_INTERNAL_BUILD_COMMAND")
        .unwrap_or_else(|_| DEFAULT_BUILD_COMMAND.to_string())
}

fn run_command() -> String {
    std::env::var("YINYO_INTERNAL_RUN_COMMAND").unwrap_or_else(|_| DEFAULT_RUN_COMMAND.to_string())
}

/// An internal failure, remembered together with the stage it happened in
/// so it can be reported on the right stream.
#[derive(Debug)]
struct PipelineError {
    stage: Stage,
    source: eyre::Report,
}

impl PipelineError {
    fn during<E: Into<eyre::Report>>(stage: Stage) -> impl Fn(E) -> Self {
        move |err| Self {
            stage,
            source: err.into(),
        }
    }
}

/// Run the whole pipeline. The `last` event is posted whether or not the
/// pipeline succeeded.
pub async fn run(settings: &WrapperSettings) -> eyre::Result<()> {
    let client = RunClient::new(&settings.server_url, &settings.run_id, &settings.token);

    if let Err(err) = run_pipeline(&client, settings).await {
        warn!(stage = err.stage.as_str(), error = %err.source, "wrapper pipeline failed");
        let event = Event::log(
            Utc::now(),
            err.stage,
            Stream::Interr,
            err.source.to_string(),
        );
        if let Err(post_err) = client.create_event(&event).await {
            warn!(error = %post_err, "failed to report internal error");
        }
    }

    client.create_event(&Event::last(Utc::now())).await?;
    Ok(())
}

async fn run_pipeline(
    client: &RunClient,
    settings: &WrapperSettings,
) -> Result<(), PipelineError> {
    client
        .create_event(&Event::start(Utc::now(), Stage::Build))
        .await
        .map_err(PipelineError::during(Stage::Build))?;

    tokio::fs::create_dir_all(&settings.import_path)
        .await
        .map_err(PipelineError::during(Stage::Build))?;
    tokio::fs::create_dir_all(&settings.cache_path)
        .await
        .map_err(PipelineError::during(Stage::Build))?;

    client
        .get_app_to_directory(&settings.import_path)
        .await
        .map_err(PipelineError::during(Stage::Build))?;
    tokio::fs::write(settings.import_path.join("Procfile"), PROCFILE_CONTENTS)
        .await
        .map_err(PipelineError::during(Stage::Build))?;
    client
        .get_cache_to_directory(&settings.cache_path)
        .await
        .map_err(PipelineError::during(Stage::Build))?;

    let mut env: Vec<(String, String)> = vec![
        (
            "APP_PATH".to_string(),
            settings.app_path.display().to_string(),
        ),
        (
            "CACHE_PATH".to_string(),
            settings.cache_path.display().to_string(),
        ),
        (
            "IMPORT_PATH".to_string(),
            settings.import_path.display().to_string(),
        ),
    ];
    env.extend(
        envstring::decode(&settings.env).map_err(PipelineError::during(Stage::Build))?,
    );

    let build_exit = run_external_command(client, Stage::Build, &build_command(), &env)
        .await
        .map_err(PipelineError::during(Stage::Build))?;
    info!(exit_code = build_exit.exit_code, "build finished");

    client
        .create_event(&Event::finish(Utc::now(), Stage::Build, build_exit))
        .await
        .map_err(PipelineError::during(Stage::Build))?;

    // The cache goes up even after a failed build, so the next attempt
    // still starts warm.
    client
        .put_cache_from_directory(&settings.cache_path)
        .await
        .map_err(PipelineError::during(Stage::Build))?;

    if build_exit.exit_code != 0 {
        return Ok(());
    }

    client
        .create_event(&Event::start(Utc::now(), Stage::Run))
        .await
        .map_err(PipelineError::during(Stage::Run))?;

    let run_exit = run_external_command(client, Stage::Run, &run_command(), &env)
        .await
        .map_err(PipelineError::during(Stage::Run))?;
    info!(exit_code = run_exit.exit_code, "run finished");

    client
        .create_event(&Event::finish(Utc::now(), Stage::Run, run_exit))
        .await
        .map_err(PipelineError::during(Stage::Run))?;

    if !settings.output.is_empty() {
        let output_path = settings.app_path.join(&settings.output);
        if output_path.exists() {
            client
                .put_output_from_file(&output_path)
                .await
                .map_err(PipelineError::during(Stage::Run))?;
        }
    }

    Ok(())
}

fn network_totals(networks: &Networks) -> (u64, u64) {
    networks
        .iter()
        .fold((0, 0), |(received, transmitted), (_name, data)| {
            (
                received + data.total_received(),
                transmitted + data.total_transmitted(),
            )
        })
}

fn cpu_seconds(usage: &ResourceUsage) -> f64 {
    let user = usage.user_time();
    let system = usage.system_time();
    user.tv_sec() as f64
        + user.tv_usec() as f64 / 1e6
        + system.tv_sec() as f64
        + system.tv_usec() as f64 / 1e6
}

/// Run a single stage command, streaming each output line as a log event
/// and measuring what the child used.
async fn run_external_command(
    client: &RunClient,
    stage: Stage,
    command_string: &str,
    env: &[(String, String)],
) -> eyre::Result<ExitDataStage> {
    let parts = shlex::split(command_string)
        .ok_or_else(|| eyre::eyre!("could not parse command: {command_string}"))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| eyre::eyre!("empty command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env.iter().map(|(name, value)| (name.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Counters are captured around the child so the deltas are as close
    // to the child's own usage as the host exposes.
    let mut networks = Networks::new_with_refreshed_list();
    let (received_start, transmitted_start) = network_totals(&networks);
    let rusage_start = getrusage(UsageWho::RUSAGE_CHILDREN)?;
    let started = Instant::now();

    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre::eyre!("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| eyre::eyre!("child stderr was not captured"))?;

    let stdout_task = tokio::spawn(stream_logs(client.clone(), stage, Stream::Stdout, stdout));
    let stderr_task = tokio::spawn(stream_logs(client.clone(), stage, Stream::Stderr, stderr));
    stdout_task.await??;
    stderr_task.await??;

    let status = child.wait().await?;

    let rusage_end = getrusage(UsageWho::RUSAGE_CHILDREN)?;
    networks.refresh(true);
    let (received_end, transmitted_end) = network_totals(&networks);

    Ok(ExitDataStage {
        exit_code: status.code().unwrap_or(-1),
        usage: Usage {
            wall_time: started.elapsed().as_secs_f64(),
            cpu_time: cpu_seconds(&rusage_end) - cpu_seconds(&rusage_start),
            max_rss: rusage_end.max_rss(),
            network_in: received_end.saturating_sub(received_start),
            network_out: transmitted_end.saturating_sub(transmitted_start),
        },
    })
}

async fn stream_logs<R: AsyncRead + Unpin>(
    client: RunClient,
    stage: Stage,
    stream: Stream,
    reader: R,
) -> eyre::Result<()> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        client
            .create_event(&Event::log(Utc::now(), stage, stream, line))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procfile_pins_the_scraper_entrypoint() {
        assert_eq!(PROCFILE_CONTENTS, "scraper: /bin/start.sh");
    }

    #[test]
    fn default_commands_use_the_buildpack_toolchain() {
        assert_eq!(DEFAULT_BUILD_COMMAND, "/bin/herokuish buildpack build");
        assert_eq!(
            DEFAULT_RUN_COMMAND,
            "/bin/herokuish procfile start scraper"
        );
    }

    #[test]
    fn commands_split_with_shell_quoting() {
        assert_eq!(
            shlex::split("/bin/herokuish buildpack build").unwrap(),
            vec!["/bin/herokuish", "buildpack", "build"]
        );
        assert_eq!(
            shlex::split(r#"/bin/sh -c "echo 'hello world'""#).unwrap(),
            vec!["/bin/sh", "-c", "echo 'hello world'"]
        );
    }

    #[test]
    fn cpu_seconds_combines_user_and_system_time() {
        let usage = getrusage(UsageWho::RUSAGE_SELF).unwrap();
        assert!(cpu_seconds(&usage) >= 0.0);
    }

    #[test]
    fn network_totals_sum_all_interfaces() {
        let networks = Networks::new_with_refreshed_list();
        // Totals are monotonic counters; the sum must not panic and the
        // same snapshot must be stable.
        assert_eq!(network_totals(&networks), network_totals(&networks));
    }
}
