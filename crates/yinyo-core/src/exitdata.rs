//! Exit codes and resource accounting for a run.

use serde::{Deserialize, Serialize};

/// Resource usage of a single stage.
///
/// Times are seconds, `max_rss` is kilobytes, network counters are bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub wall_time: f64,
    pub cpu_time: f64,
    pub max_rss: i64,
    pub network_in: u64,
    pub network_out: u64,
}

/// Exit code and usage for one stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExitDataStage {
    pub exit_code: i32,
    pub usage: Usage,
}

/// Bytes crossing the public network boundary of the API for a run.
///
/// Only externally originated requests are counted; wrapper traffic inside
/// the cluster is excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiUsage {
    pub network_in: u64,
    pub network_out: u64,
}

/// Aggregated exit status and resource accounting for a run.
///
/// `build` and `run` are absent until the corresponding stage has finished;
/// `finished` flips to true once the run's terminal event has been recorded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExitData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ExitDataStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<ExitDataStage>,
    #[serde(default)]
    pub api: ApiUsage,
    pub finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_omitted_until_present() {
        let exit_data = ExitData::default();
        let json = serde_json::to_string(&exit_data).unwrap();
        assert_eq!(
            json,
            r#"{"api":{"network_in":0,"network_out":0},"finished":false}"#
        );
    }

    #[test]
    fn full_exit_data_round_trips() {
        let exit_data = ExitData {
            build: Some(ExitDataStage {
                exit_code: 0,
                usage: Usage {
                    wall_time: 1.5,
                    cpu_time: 0.25,
                    max_rss: 1024,
                    network_in: 10,
                    network_out: 20,
                },
            }),
            run: Some(ExitDataStage {
                exit_code: 137,
                usage: Usage::default(),
            }),
            api: ApiUsage {
                network_in: 100,
                network_out: 200,
            },
            finished: true,
        };
        let json = serde_json::to_string(&exit_data).unwrap();
        let parsed: ExitData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, exit_data);
        assert_eq!(parsed.run.unwrap().exit_code, 137);
    }

    #[test]
    fn stage_json_matches_wire_shape() {
        let stage = ExitDataStage {
            exit_code: 15,
            usage: Usage::default(),
        };
        let json = serde_json::to_string(&stage).unwrap();
        assert_eq!(
            json,
            r#"{"exit_code":15,"usage":{"wall_time":0.0,"cpu_time":0.0,"max_rss":0,"network_in":0,"network_out":0}}"#
        );
    }
}
