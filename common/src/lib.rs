pub mod clock;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod intent;
pub mod learner;
pub mod store;
pub mod topics;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use compiler::TriggerSpec;
pub use config::{
    BuildingConfig, ControlConfig, DefaultSchedules, RoomConfig, ScheduleEntry, TargetBand,
    TimeOfDay, LEARNED_OVERSHOOT_MAX,
};
pub use engine::DecisionOutcome;
pub use error::ControlError;
pub use intent::{Effect, Intent, IntentProcessor};
pub use store::{RoomState, RoomStore, RoomView, StatePatch};
pub use types::{
    Decision, EntityKind, ForcedCommand, HeatingState, PollRequest, Sample, SampleKind,
    ScheduleEventKind,
};
