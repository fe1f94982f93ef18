pub mod archive;
pub mod envstring;
pub mod event;
pub mod exitdata;
pub mod protocol;

pub use archive::ArchiveError;
pub use event::{EmptyData, Event, EventData, FinishData, LogData, Stage, StageData, Stream};
pub use exitdata::{ApiUsage, ExitData, ExitDataStage, Usage};
pub use protocol::{CreateRunResponse, DefaultAndMax, EnvVariable, Hello, StartRunOptions};
