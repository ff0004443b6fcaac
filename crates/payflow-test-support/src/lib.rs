//! Shared test doubles and utilities for Payflow.

mod authorizer;
mod clock;
mod fast_tier;
mod publisher;

pub use authorizer::{ScriptedAuthorizer, Step, StaticGateway};
pub use clock::{FixedClock, ManualClock, fixed_now};
pub use fast_tier::FailingFastTier;
pub use publisher::{Published, RecordingPublisher};
