//! Strongly-typed identifiers.
//!
//! Every entity is keyed by a UUID v7 (time-sortable) wrapped in its own
//! newtype so a `StepId` can never be passed where a `RunId` is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::str::FromStr;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(
    /// Identifier of a lead (the work item a pipeline run advances).
    LeadId
);
define_id!(
    /// Identifier of a campaign owning leads and agent configuration.
    CampaignId
);
define_id!(
    /// Identifier of the user owning a campaign.
    UserId
);
define_id!(
    /// Identifier of a pipeline run.
    RunId
);
define_id!(
    /// Identifier of one step within a run.
    StepId
);
define_id!(
    /// Identifier of a step's output record.
    OutputId
);
define_id!(
    /// Identifier of a per-campaign agent configuration row.
    AgentConfigId
);
