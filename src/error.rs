use crate::model::{Kind, Usr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recoverable problems found while turning events into entities.
///
/// None of these abort indexing. They are logged, recorded on the partial index
/// and surfaced through unit statistics so tooling can degrade gracefully.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("symbol {usr} already seen as {existing}, ignoring {incoming} observation")]
    KindConflict {
        usr: Usr,
        existing: Kind,
        incoming: Kind,
    },
    #[error("malformed event on line {line}: {source}")]
    MalformedEvent {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A kind conflict kept on the partial index after the event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindConflict {
    pub usr: Usr,
    pub existing: Kind,
    pub incoming: Kind,
}

impl From<KindConflict> for IndexError {
    fn from(conflict: KindConflict) -> Self {
        IndexError::KindConflict {
            usr: conflict.usr,
            existing: conflict.existing,
            incoming: conflict.incoming,
        }
    }
}
