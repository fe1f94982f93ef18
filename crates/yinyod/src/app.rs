//! Command layer binding the four adapters together.
//!
//! `App` owns no per-run state of its own: everything lives in the blob
//! store, key-value store, event stream and dispatcher, so any number of
//! daemon instances can serve any request.

use crate::authz::{AuthzClient, AuthzError};
use crate::blobstore::{BlobStore, BlobStoreError, ByteStream};
use crate::dispatcher::{DispatcherError, JobDispatcher};
use crate::keyvaluestore::{KeyValueStore, KeyValueStoreError};
use crate::stream::{EventStream, StreamError};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};
use yinyo_core::{
    archive, envstring, ApiUsage, CreateRunResponse, Event, EventData, ExitData, ExitDataStage,
    StartRunOptions,
};

const FILENAME_APP: &str = "app.tgz";
const FILENAME_CACHE: &str = "cache.tgz";
const FILENAME_OUTPUT: &str = "output";

/// Path of the wrapper binary inside the runner image.
const RUN_BINARY: &str = "/bin/yinyo-wrapper";

/// Token alphabet without easily confused characters.
const TOKEN_CHARS: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not found")]
    NotFound,
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("archive has incorrect format: {0}")]
    ArchiveFormat(String),
    #[error("app needs to be uploaded before starting a run")]
    AppNotAvailable,
    #[error("run has already been started")]
    AlreadyStarted,
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

impl From<BlobStoreError> for CommandError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound => Self::NotFound,
            BlobStoreError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<KeyValueStoreError> for CommandError {
    fn from(err: KeyValueStoreError) -> Self {
        match err {
            KeyValueStoreError::KeyNotExist => Self::NotFound,
            KeyValueStoreError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<StreamError> for CommandError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Deleted => Self::NotFound,
            StreamError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<DispatcherError> for CommandError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::AlreadyExists => Self::AlreadyStarted,
            DispatcherError::NotFound => Self::NotFound,
            DispatcherError::Backend(message) => Self::Internal(message),
        }
    }
}

impl From<AuthzError> for CommandError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::NotAllowed(message) => Self::NotAllowed(message),
            AuthzError::Backend(message) => Self::Internal(message),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9-]` with `-` so the prefix is a
/// valid cluster resource name. An empty prefix becomes `run`.
pub fn sanitize_name_prefix(name_prefix: &str) -> String {
    if name_prefix.is_empty() {
        return "run".to_string();
    }
    name_prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| {
            let index = rng.gen_range(0..TOKEN_CHARS.len());
            TOKEN_CHARS[index] as char
        })
        .collect()
}

fn blob_path(run_id: &str, name: &str) -> String {
    format!("{run_id}/{name}")
}

// KV key layout under the run's namespace.
fn created_key(run_id: &str) -> String {
    format!("{run_id}/created")
}

fn token_key(run_id: &str) -> String {
    format!("{run_id}/token")
}

fn callback_key(run_id: &str) -> String {
    format!("{run_id}/url")
}

fn exit_data_stage_key(run_id: &str, stage: &str) -> String {
    format!("{run_id}/exit_data/{stage}")
}

fn exit_data_finished_key(run_id: &str) -> String {
    format!("{run_id}/exit_data/finished")
}

fn exit_data_api_key(run_id: &str, counter: &str) -> String {
    format!("{run_id}/exit_data/api/{counter}")
}

/// The orchestrator's command layer.
#[derive(Clone)]
pub struct App {
    pub blob_store: Arc<dyn BlobStore>,
    pub key_value_store: Arc<dyn KeyValueStore>,
    pub stream: Arc<dyn EventStream>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub authz: AuthzClient,
    pub http: reqwest::Client,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        key_value_store: Arc<dyn KeyValueStore>,
        stream: Arc<dyn EventStream>,
        dispatcher: Arc<dyn JobDispatcher>,
        authz: AuthzClient,
    ) -> Self {
        Self {
            blob_store,
            key_value_store,
            stream,
            dispatcher,
            authz,
            http: reqwest::Client::new(),
        }
    }

    /// Allocate a run id and token. The dispatcher makes the id unique by
    /// creating the token secret with a generated name.
    pub async fn create_run(
        &self,
        name_prefix: &str,
        api_key: Option<&str>,
    ) -> Result<CreateRunResponse> {
        self.authz.check_create(api_key).await?;

        let prefix = sanitize_name_prefix(name_prefix);
        let token = generate_token();
        let run_id = self.dispatcher.create_job_and_token(&prefix, &token).await?;

        self.key_value_store
            .set(&token_key(&run_id), &token)
            .await?;
        self.key_value_store
            .set(&created_key(&run_id), "true")
            .await?;

        Ok(CreateRunResponse {
            run_name: run_id,
            run_token: token,
        })
    }

    /// Whether allocation for this run ever completed. This flag is the
    /// source of truth for existence checks.
    pub async fn is_run_created(&self, run_id: &str) -> Result<bool> {
        match self.key_value_store.get(&created_key(run_id)).await {
            Ok(value) => Ok(value == "true"),
            Err(KeyValueStoreError::KeyNotExist) => Ok(false),
            Err(other) => Err(other.into()),
        }
    }

    /// The run token, read from the key-value store and falling back to
    /// the dispatcher's secret if the cached copy is gone.
    pub async fn get_token_cached(&self, run_id: &str) -> Result<String> {
        match self.key_value_store.get(&token_key(run_id)).await {
            Ok(token) => Ok(token),
            Err(KeyValueStoreError::KeyNotExist) => {
                let token = self.dispatcher.get_token(run_id).await?;
                self.key_value_store.set(&token_key(run_id), &token).await?;
                Ok(token)
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn get_app(&self, run_id: &str) -> Result<ByteStream> {
        Ok(self.blob_store.get(&blob_path(run_id, FILENAME_APP)).await?)
    }

    /// Store the scraper source archive, rejecting anything that is not a
    /// well-formed tar.gz of directories, files and symlinks.
    pub async fn put_app(&self, run_id: &str, data: Bytes) -> Result<()> {
        archive::validate(&data).map_err(|e| CommandError::ArchiveFormat(e.to_string()))?;
        Ok(self
            .blob_store
            .put(&blob_path(run_id, FILENAME_APP), data)
            .await?)
    }

    pub async fn get_cache(&self, run_id: &str) -> Result<ByteStream> {
        Ok(self
            .blob_store
            .get(&blob_path(run_id, FILENAME_CACHE))
            .await?)
    }

    pub async fn put_cache(&self, run_id: &str, data: Bytes) -> Result<()> {
        Ok(self
            .blob_store
            .put(&blob_path(run_id, FILENAME_CACHE), data)
            .await?)
    }

    pub async fn get_output(&self, run_id: &str) -> Result<ByteStream> {
        Ok(self
            .blob_store
            .get(&blob_path(run_id, FILENAME_OUTPUT))
            .await?)
    }

    pub async fn put_output(&self, run_id: &str, data: Bytes) -> Result<()> {
        Ok(self
            .blob_store
            .put(&blob_path(run_id, FILENAME_OUTPUT), data)
            .await?)
    }

    /// Dispatch the container job for a run. Quotas must already be
    /// clamped by the caller.
    pub async fn start_run(
        &self,
        run_id: &str,
        runner_image: &str,
        options: &StartRunOptions,
    ) -> Result<()> {
        if let Some(callback) = options.callback.as_deref() {
            if !callback.is_empty() {
                self.key_value_store
                    .set(&callback_key(run_id), callback)
                    .await?;
            }
        }

        self.authz.check_start(run_id).await?;

        // The app archive must exist before anything is dispatched.
        match self.blob_store.get(&blob_path(run_id, FILENAME_APP)).await {
            Ok(_) => {}
            Err(BlobStoreError::NotFound) => return Err(CommandError::AppNotAvailable),
            Err(other) => return Err(other.into()),
        }

        let token = self.get_token_cached(run_id).await?;

        let env: BTreeMap<String, String> = options
            .env
            .iter()
            .map(|variable| (variable.name.clone(), variable.value.clone()))
            .collect();
        let env_string = envstring::encode(&env);

        let mut command = vec![
            RUN_BINARY.to_string(),
            "wrapper".to_string(),
            run_id.to_string(),
            token,
        ];
        if !options.output.is_empty() {
            command.push("--output".to_string());
            command.push(options.output.clone());
        }
        if !env_string.is_empty() {
            command.push("--env".to_string());
            command.push(env_string);
        }
        command.push("--max-run-time".to_string());
        command.push(options.max_run_time.to_string());
        command.push("--memory".to_string());
        command.push(options.memory.to_string());

        self.dispatcher
            .start_job(
                run_id,
                runner_image,
                &command,
                options.max_run_time,
                options.memory,
            )
            .await?;
        Ok(())
    }

    /// Append an event to the run's stream, fan it out to the callback if
    /// one is registered, and fold finish/last events into the exit data.
    ///
    /// The stream write takes precedence: a callback failure is reported
    /// to the caller but never rolls the append back.
    pub async fn create_event(&self, run_id: &str, event: Event) -> Result<Event> {
        let stamped = self.stream.add(run_id, event).await?;

        let mut first_error: Option<CommandError> = None;

        if let Err(err) = self.post_callback_event(run_id, &stamped).await {
            warn!(run_id, error = %err, "callback delivery failed");
            first_error.get_or_insert(err);
        }

        if let Err(err) = self.record_exit_data_from_event(run_id, &stamped).await {
            error!(run_id, error = %err, "failed to record exit data");
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(stamped),
        }
    }

    async fn post_callback_event(&self, run_id: &str, event: &Event) -> Result<()> {
        let url = match self.key_value_store.get(&callback_key(run_id)).await {
            Ok(url) => url,
            Err(KeyValueStoreError::KeyNotExist) => return Ok(()),
            Err(other) => return Err(other.into()),
        };
        if url.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|e| CommandError::Internal(format!("callback POST failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CommandError::Internal(format!(
                "callback POST returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn record_exit_data_from_event(&self, run_id: &str, event: &Event) -> Result<()> {
        match &event.data {
            EventData::Finish(finish) => {
                let json = serde_json::to_string(&finish.exit_data)
                    .map_err(|e| CommandError::Internal(e.to_string()))?;
                self.key_value_store
                    .set(&exit_data_stage_key(run_id, finish.stage.as_str()), &json)
                    .await?;
            }
            EventData::Last(_) => {
                self.key_value_store
                    .set(&exit_data_finished_key(run_id), "true")
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Block until the next event after `last_id` is available.
    pub async fn get_event(&self, run_id: &str, last_id: &str) -> Result<Event> {
        Ok(self.stream.get(run_id, last_id).await?)
    }

    /// Assemble the run's exit data from its key-value entries. Stages
    /// that have not finished are absent; counters default to zero.
    pub async fn get_exit_data(&self, run_id: &str) -> Result<ExitData> {
        let build = self.get_stage_exit_data(run_id, "build").await?;
        let run = self.get_stage_exit_data(run_id, "run").await?;

        let finished = match self
            .key_value_store
            .get(&exit_data_finished_key(run_id))
            .await
        {
            Ok(value) => value == "true",
            Err(KeyValueStoreError::KeyNotExist) => false,
            Err(other) => return Err(other.into()),
        };

        let api = ApiUsage {
            network_in: self.get_api_counter(run_id, "network_in").await?,
            network_out: self.get_api_counter(run_id, "network_out").await?,
        };

        Ok(ExitData {
            build,
            run,
            api,
            finished,
        })
    }

    async fn get_stage_exit_data(
        &self,
        run_id: &str,
        stage: &str,
    ) -> Result<Option<ExitDataStage>> {
        match self
            .key_value_store
            .get(&exit_data_stage_key(run_id, stage))
            .await
        {
            Ok(json) => {
                let stage: ExitDataStage = serde_json::from_str(&json)
                    .map_err(|e| CommandError::Internal(format!("stored exit data: {e}")))?;
                Ok(Some(stage))
            }
            Err(KeyValueStoreError::KeyNotExist) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    async fn get_api_counter(&self, run_id: &str, counter: &str) -> Result<u64> {
        match self
            .key_value_store
            .get(&exit_data_api_key(run_id, counter))
            .await
        {
            Ok(value) => value
                .parse()
                .map_err(|e| CommandError::Internal(format!("stored counter: {e}"))),
            Err(KeyValueStoreError::KeyNotExist) => Ok(0),
            Err(other) => Err(other.into()),
        }
    }

    /// Atomically add externally transferred byte counts to the run's API
    /// usage counters.
    pub async fn record_api_network_usage(
        &self,
        run_id: &str,
        network_in: u64,
        network_out: u64,
    ) -> Result<()> {
        self.key_value_store
            .increment(&exit_data_api_key(run_id, "network_in"), network_in as i64)
            .await?;
        self.key_value_store
            .increment(&exit_data_api_key(run_id, "network_out"), network_out as i64)
            .await?;
        Ok(())
    }

    /// Tear a run down: dispatcher first so nothing new is written, then
    /// best-effort removal of blobs, the event stream and metadata. Later
    /// failures are reported but never undo earlier steps.
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut first_error: Option<CommandError> = None;
        let mut record = |result: std::result::Result<(), CommandError>| {
            if let Err(err) = result {
                error!(run_id, error = %err, "cleanup step failed");
                first_error.get_or_insert(err);
            }
        };

        record(
            self.dispatcher
                .delete_job_and_token(run_id)
                .await
                .map_err(CommandError::from),
        );
        for filename in [FILENAME_APP, FILENAME_CACHE, FILENAME_OUTPUT] {
            record(
                self.blob_store
                    .delete(&blob_path(run_id, filename))
                    .await
                    .map_err(CommandError::from),
            );
        }
        record(
            self.stream
                .delete(run_id)
                .await
                .map_err(CommandError::from),
        );
        record(
            self.key_value_store
                .delete_prefix(&format!("{run_id}/"))
                .await
                .map_err(CommandError::from),
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
