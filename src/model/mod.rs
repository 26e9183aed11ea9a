//! Core scheduling records.
//!
//! These types cross the boundary between the scheduler and whatever
//! executes its decisions: the observatory state it reasons about, the
//! targets it issues, and the observations reported back.

mod observation;
mod state;
mod target;

use serde::{Deserialize, Serialize};

pub use observation::Observation;
pub use state::ObservatoryState;
pub use target::{Contribution, DeepDrillingVisit, Target};

/// A daytime filter exchange requested by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSwap {
    pub unmount: String,
    pub mount: String,
}
