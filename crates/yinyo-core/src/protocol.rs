//! Request and response bodies for the orchestrator HTTP API.

use serde::{Deserialize, Serialize};

/// Response to creating a run: the identity and secret the client needs
/// for every later request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_name: String,
    pub run_token: String,
}

/// A single environment variable passed to the scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Body of `POST /runs/{id}/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRunOptions {
    /// Path of the output file, relative to the scraper directory.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    /// URL every event is additionally POSTed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Seconds before the cluster kills the run. 0 means the server default.
    #[serde(default)]
    pub max_run_time: i64,
    /// Memory quota in bytes. 0 means the server default.
    #[serde(default)]
    pub memory: i64,
}

/// Default and maximum for a server-clamped quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAndMax {
    pub default: i64,
    pub max: i64,
}

/// Response of the anonymous greeting endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub message: String,
    pub max_run_time: DefaultAndMax,
    pub memory: DefaultAndMax,
    pub version: String,
    pub runner_image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_options_defaults_from_minimal_body() {
        let options: StartRunOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.output, "");
        assert!(options.env.is_empty());
        assert!(options.callback.is_none());
        assert_eq!(options.max_run_time, 0);
        assert_eq!(options.memory, 0);
    }

    #[test]
    fn start_options_parses_full_body() {
        let json = r#"{
            "output": "out.csv",
            "env": [{"name": "A", "value": "1"}],
            "callback": "http://cb/x",
            "max_run_time": 120,
            "memory": 268435456
        }"#;
        let options: StartRunOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.output, "out.csv");
        assert_eq!(
            options.env,
            vec![EnvVariable {
                name: "A".to_string(),
                value: "1".to_string()
            }]
        );
        assert_eq!(options.callback.as_deref(), Some("http://cb/x"));
        assert_eq!(options.max_run_time, 120);
        assert_eq!(options.memory, 268_435_456);
    }

    #[test]
    fn hello_serializes_quota_pairs() {
        let hello = Hello {
            message: "Hello from Yinyo!".to_string(),
            max_run_time: DefaultAndMax {
                default: 3600,
                max: 86400,
            },
            memory: DefaultAndMax {
                default: 1_073_741_824,
                max: 1_610_612_736,
            },
            version: "development".to_string(),
            runner_image: "openaustralia/yinyo-scraper:v1".to_string(),
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["max_run_time"]["max"], 86400);
        assert_eq!(json["memory"]["default"], 1_073_741_824_i64);
    }
}
