//! Job dispatcher adapter: container jobs plus the per-run token secret.
//!
//! The cluster backend is Kubernetes. Creating a run creates a Secret with
//! a generated name; the generated name doubles as the run id, which makes
//! run ids unique without any coordination on our side. Starting a run
//! creates a Job that mounts the token back in through a secret key
//! reference.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::ResourceExt;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("job already exists")]
    AlreadyExists,
    #[error("job or token not found")]
    NotFound,
    #[error("dispatcher error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DispatcherError>;

fn from_kube(err: kube::Error) -> DispatcherError {
    match &err {
        kube::Error::Api(response) if response.code == 409 => DispatcherError::AlreadyExists,
        kube::Error::Api(response) if response.code == 404 => DispatcherError::NotFound,
        _ => DispatcherError::Backend(err.to_string()),
    }
}

/// Capability interface over the cluster backend.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Reserve a job identity and store the run token atomically. Returns
    /// the allocated run id.
    async fn create_job_and_token(&self, name_prefix: &str, token: &str) -> Result<String>;

    /// Create the container job for a run. Fails with `AlreadyExists` if
    /// the run was started before.
    async fn start_job(
        &self,
        run_id: &str,
        image: &str,
        command: &[String],
        max_run_time: i64,
        memory: i64,
    ) -> Result<()>;

    /// Remove the job and its token. Missing resources are not an error.
    async fn delete_job_and_token(&self, run_id: &str) -> Result<()>;

    /// Read back the stored run token.
    async fn get_token(&self, run_id: &str) -> Result<String>;
}

const TOKEN_SECRET_KEY: &str = "run_token";

/// Kubernetes-backed dispatcher.
#[derive(Clone)]
pub struct KubernetesDispatcher {
    client: kube::Client,
    namespace: String,
}

impl std::fmt::Debug for KubernetesDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesDispatcher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubernetesDispatcher {
    /// Connect using the in-cluster service account (or local kubeconfig
    /// outside the cluster).
    pub async fn new(namespace: &str) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| DispatcherError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
        })
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl JobDispatcher for KubernetesDispatcher {
    async fn create_job_and_token(&self, name_prefix: &str, token: &str) -> Result<String> {
        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "generateName": format!("{name_prefix}-") },
            "stringData": { TOKEN_SECRET_KEY: token },
        }))
        .map_err(|e| DispatcherError::Backend(e.to_string()))?;

        let created = self
            .secrets()
            .create(&PostParams::default(), &secret)
            .await
            .map_err(from_kube)?;
        Ok(created.name_any())
    }

    async fn start_job(
        &self,
        run_id: &str,
        image: &str,
        command: &[String],
        max_run_time: i64,
        memory: i64,
    ) -> Result<()> {
        let job: Job = serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": run_id },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": max_run_time,
                "template": {
                    "spec": {
                        "automountServiceAccountToken": false,
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": run_id,
                            "image": image,
                            "command": command,
                            "env": [{
                                "name": "YINYO_INTERNAL_RUN_TOKEN",
                                "valueFrom": {
                                    "secretKeyRef": {
                                        "name": run_id,
                                        "key": TOKEN_SECRET_KEY,
                                    }
                                }
                            }],
                            "resources": {
                                "limits": { "memory": memory.to_string() }
                            }
                        }]
                    }
                }
            }
        }))
        .map_err(|e| DispatcherError::Backend(e.to_string()))?;

        self.jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(from_kube)?;
        Ok(())
    }

    async fn delete_job_and_token(&self, run_id: &str) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..DeleteParams::default()
        };
        match self.jobs().delete(run_id, &params).await.map_err(from_kube) {
            Ok(_) | Err(DispatcherError::NotFound) => {}
            Err(other) => return Err(other),
        }
        match self
            .secrets()
            .delete(run_id, &params)
            .await
            .map_err(from_kube)
        {
            Ok(_) | Err(DispatcherError::NotFound) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn get_token(&self, run_id: &str) -> Result<String> {
        let secret = self.secrets().get(run_id).await.map_err(from_kube)?;
        let data = secret.data.unwrap_or_default();
        let bytes = data
            .get(TOKEN_SECRET_KEY)
            .ok_or(DispatcherError::NotFound)?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| DispatcherError::Backend(format!("token is not utf-8: {e}")))
    }
}

/// A job the fake dispatcher has been asked to start, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedJob {
    pub run_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub max_run_time: i64,
    pub memory: i64,
}

#[derive(Debug, Default)]
struct FakeDispatcherState {
    tokens: HashMap<String, String>,
    started: Vec<StartedJob>,
}

/// In-process dispatcher used by tests and local runs. Allocates ids the
/// same way the cluster does: prefix plus a random suffix.
#[derive(Debug, Default)]
pub struct FakeDispatcher {
    state: Mutex<FakeDispatcherState>,
}

/// Suffix alphabet matching what the cluster uses for generated names.
const NAME_SUFFIX_CHARS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LENGTH: usize = 5;

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs started so far, in order.
    pub async fn started_jobs(&self) -> Vec<StartedJob> {
        self.state.lock().await.started.clone()
    }

    fn random_suffix() -> String {
        let mut rng = rand::thread_rng();
        (0..NAME_SUFFIX_LENGTH)
            .map(|_| {
                let index = rng.gen_range(0..NAME_SUFFIX_CHARS.len());
                NAME_SUFFIX_CHARS[index] as char
            })
            .collect()
    }
}

#[async_trait]
impl JobDispatcher for FakeDispatcher {
    async fn create_job_and_token(&self, name_prefix: &str, token: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        loop {
            let run_id = format!("{name_prefix}-{}", Self::random_suffix());
            if state.tokens.contains_key(&run_id) {
                continue;
            }
            state.tokens.insert(run_id.clone(), token.to_string());
            return Ok(run_id);
        }
    }

    async fn start_job(
        &self,
        run_id: &str,
        image: &str,
        command: &[String],
        max_run_time: i64,
        memory: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started.iter().any(|job| job.run_id == run_id) {
            return Err(DispatcherError::AlreadyExists);
        }
        state.started.push(StartedJob {
            run_id: run_id.to_string(),
            image: image.to_string(),
            command: command.to_vec(),
            max_run_time,
            memory,
        });
        Ok(())
    }

    async fn delete_job_and_token(&self, run_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tokens.remove(run_id);
        state.started.retain(|job| job.run_id != run_id);
        Ok(())
    }

    async fn get_token(&self, run_id: &str) -> Result<String> {
        self.state
            .lock()
            .await
            .tokens
            .get(run_id)
            .cloned()
            .ok_or(DispatcherError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_allocates_prefixed_unique_ids() {
        let dispatcher = FakeDispatcher::new();
        let a = dispatcher
            .create_job_and_token("scraper", "token-a")
            .await
            .unwrap();
        let b = dispatcher
            .create_job_and_token("scraper", "token-b")
            .await
            .unwrap();
        assert!(a.starts_with("scraper-"));
        assert!(b.starts_with("scraper-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn token_round_trips_through_the_secret() {
        let dispatcher = FakeDispatcher::new();
        let run_id = dispatcher
            .create_job_and_token("run", "supersecret")
            .await
            .unwrap();
        assert_eq!(dispatcher.get_token(&run_id).await.unwrap(), "supersecret");
    }

    #[tokio::test]
    async fn starting_twice_is_already_exists() {
        let dispatcher = FakeDispatcher::new();
        let run_id = dispatcher.create_job_and_token("run", "t").await.unwrap();
        let command = vec!["/bin/yinyo-wrapper".to_string()];
        dispatcher
            .start_job(&run_id, "image:v1", &command, 3600, 1024)
            .await
            .unwrap();
        assert!(matches!(
            dispatcher
                .start_job(&run_id, "image:v1", &command, 3600, 1024)
                .await,
            Err(DispatcherError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_clears_state() {
        let dispatcher = FakeDispatcher::new();
        let run_id = dispatcher.create_job_and_token("run", "t").await.unwrap();
        dispatcher.delete_job_and_token(&run_id).await.unwrap();
        dispatcher.delete_job_and_token(&run_id).await.unwrap();
        assert!(matches!(
            dispatcher.get_token(&run_id).await,
            Err(DispatcherError::NotFound)
        ));
    }
}
