//! The lead pipeline engine.
//!
//! A run is an ordered list of agent steps. The planner creates it, the
//! executor advances it one step per call, the reconciler keeps it in line
//! with live agent enablement, and the delivery recorder closes SENDER
//! steps once their async email job reports back.

pub mod delivery;
pub mod dispatch;
pub mod executor;
pub mod lease;
pub mod outcome;
pub mod planner;
pub mod positions;
pub mod reconciler;
pub mod resolver;
pub mod resume;
pub mod rollup;
pub mod send_only;
pub mod settings;
