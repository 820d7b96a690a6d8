pub mod clock;
pub mod dedup;
pub mod fetcher;
pub mod filters;
pub mod materializer;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod source_manager;
pub mod sources;
pub mod traits;
pub mod types;
pub mod utils;

pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use fetcher::Fetcher;
pub use filters::FilterRegistry;
pub use pipeline::FilterChain;
pub use policy::SchedulePolicy;
pub use scheduler::Scheduler;
pub use source_manager::{EntryScope, SourceManager};
pub use sources::AdapterRegistry;
