//! Event envelope and payload types for the per-run event stream.
//!
//! Events travel as newline-delimited JSON with a `type` tag and a
//! per-variant `data` object:
//!
//! ```json
//! {"id":"12","time":"2000-01-02T03:45:00Z","type":"log","data":{"stage":"build","stream":"stdout","text":"Hello"}}
//! ```
//!
//! The `id` is assigned by the event stream backend when the event is
//! appended; events built by clients carry an empty id, which is omitted
//! from the wire form.

use crate::exitdata::ExitDataStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The stage of a run an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Run => "run",
        }
    }
}

/// Which output stream a log line came from.
///
/// `Interr` carries internal wrapper errors, so failures before the scraper
/// process starts still surface to the user as log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
    Interr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Interr => "interr",
        }
    }
}

/// Payload of a `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageData {
    pub stage: Stage,
}

/// Payload of a `finish` event: the stage that ended and its exit data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishData {
    pub stage: Stage,
    pub exit_data: ExitDataStage,
}

/// Payload of a `log` event: one line of output from a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogData {
    pub stage: Stage,
    pub stream: Stream,
    pub text: String,
}

/// Empty payload for `first` and `last` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyData {}

/// The closed set of event payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventData {
    /// A stage has started.
    Start(StageData),
    /// A stage has finished, with its exit code and resource usage.
    Finish(FinishData),
    /// A line of output from a stage.
    Log(LogData),
    /// The first event the orchestrator recorded for this run.
    First(EmptyData),
    /// Sentinel: no further events will be produced for this run.
    Last(EmptyData),
}

/// An event in a run's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stream-assigned id, strictly increasing within a run. Empty until
    /// the event has been appended.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn start(time: DateTime<Utc>, stage: Stage) -> Self {
        Self {
            id: String::new(),
            time,
            data: EventData::Start(StageData { stage }),
        }
    }

    pub fn finish(time: DateTime<Utc>, stage: Stage, exit_data: ExitDataStage) -> Self {
        Self {
            id: String::new(),
            time,
            data: EventData::Finish(FinishData { stage, exit_data }),
        }
    }

    pub fn log(time: DateTime<Utc>, stage: Stage, stream: Stream, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            time,
            data: EventData::Log(LogData {
                stage,
                stream,
                text: text.into(),
            }),
        }
    }

    pub fn first(time: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            time,
            data: EventData::First(EmptyData {}),
        }
    }

    pub fn last(time: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            time,
            data: EventData::Last(EmptyData {}),
        }
    }

    /// Whether this is the terminal event of a run's stream.
    pub fn is_last(&self) -> bool {
        matches!(self.data, EventData::Last(_))
    }

    /// The same event with the stream-assigned id filled in.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exitdata::Usage;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 2, 3, 45, 0).unwrap()
    }

    fn assert_round_trip(event: &Event, json: &str) {
        let serialized = serde_json::to_string(event).unwrap();
        assert_eq!(serialized, json);
        let parsed: Event = serde_json::from_str(&serialized).unwrap();
        assert_eq!(&parsed, event);
    }

    #[test]
    fn start_event_wire_format() {
        assert_round_trip(
            &Event::start(fixed_time(), Stage::Build),
            r#"{"time":"2000-01-02T03:45:00Z","type":"start","data":{"stage":"build"}}"#,
        );
    }

    #[test]
    fn finish_event_wire_format() {
        let exit_data = ExitDataStage {
            exit_code: 0,
            usage: Usage::default(),
        };
        assert_round_trip(
            &Event::finish(fixed_time(), Stage::Run, exit_data),
            r#"{"time":"2000-01-02T03:45:00Z","type":"finish","data":{"stage":"run","exit_data":{"exit_code":0,"usage":{"wall_time":0.0,"cpu_time":0.0,"max_rss":0,"network_in":0,"network_out":0}}}}"#,
        );
    }

    #[test]
    fn log_event_wire_format() {
        assert_round_trip(
            &Event::log(fixed_time(), Stage::Build, Stream::Stdout, "Hello"),
            r#"{"time":"2000-01-02T03:45:00Z","type":"log","data":{"stage":"build","stream":"stdout","text":"Hello"}}"#,
        );
    }

    #[test]
    fn last_event_wire_format() {
        assert_round_trip(
            &Event::last(fixed_time()),
            r#"{"time":"2000-01-02T03:45:00Z","type":"last","data":{}}"#,
        );
    }

    #[test]
    fn assigned_id_is_serialized() {
        let event = Event::first(fixed_time()).with_id("42");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.starts_with(r#"{"id":"42","#));
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "42");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"time":"2000-01-02T03:45:00Z","type":"bogus","data":{}}"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }

    #[test]
    fn is_last_only_for_last_events() {
        assert!(Event::last(fixed_time()).is_last());
        assert!(!Event::first(fixed_time()).is_last());
        assert!(!Event::start(fixed_time(), Stage::Build).is_last());
    }
}
