//! Domain model (ids, owners, tasks, scan configuration, profiles, results, queries).

pub mod engine;
pub mod errors;
pub mod ids;
pub mod owner;
pub mod profile;
pub mod query;
pub mod result;
pub mod scan_config;
pub mod state;
pub mod task;

pub use self::engine::{DatabaseInfo, EngineVersion};
pub use self::errors::{ErrorKind, VigilError};
pub use self::ids::{ParseTaskIdError, TaskId};
pub use self::owner::Owner;
pub use self::profile::{ConfigProfile, validate_profile_name};
pub use self::query::{ListQuery, Page, SortField, SortOrder, TaskSummary};
pub use self::result::{ScanResult, VulnerabilitySummary};
pub use self::scan_config::{ScanConfig, ScanRequest};
pub use self::state::{ParseStatusError, TaskStatus};
pub use self::task::ScanTask;
