//! Status codes.
//!
//! The integer codes are shared between both sides of a migration and
//! are what gets stored and sent over the wire:
//!
//! | Status   | Entity | Tracker | Batch | Export |
//! |----------|--------|---------|-------|--------|
//! | created  | 0      | 0       | 0     |        |
//! | started  | 1      | 1       | 1     | 0      |
//! | finished | 2      | 2       | 2     | 1      |
//! | timeout  |        |         | 3     |        |
//! | failed   | -1     | -1      | -1    | -1     |
//! | skipped  |        | -2      | -2    |        |
//! | canceled | -2     |         |       |        |

use serde::{Deserialize, Serialize};

use crate::error::FerryResult;
use crate::state::{StateMachine, Transition};
use crate::status_codes;

use Transition::{Changed, Unchanged};

/// Status of an entity being migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum EntityStatus {
    Created,
    Started,
    Finished,
    Failed,
    Canceled,
}

/// Events of [`EntityStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    Start,
    Finish,
    FailOp,
    Cancel,
}

/// Status of one relation of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum TrackerStatus {
    Created,
    Started,
    Finished,
    Failed,
    Skipped,
}

/// Events of [`TrackerStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Start,
    Finish,
    FailOp,
    Skip,
}

/// Status of one batch of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum BatchStatus {
    Created,
    Started,
    Finished,
    Timeout,
    Failed,
    Skipped,
}

/// Events of [`BatchStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Start,
    Retry,
    CleanupStale,
    Finish,
    FailOp,
    Skip,
}

/// Status of a relation export (or one of its batches) on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum ExportStatusCode {
    Started,
    Finished,
    Failed,
}

/// Events of [`ExportStatusCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportEvent {
    Start,
    Finish,
    FailOp,
}

status_codes!(EntityStatus, "entity", {
    Created => 0,
    Started => 1,
    Finished => 2,
    Failed => -1,
    Canceled => -2,
});

status_codes!(TrackerStatus, "tracker", {
    Created => 0,
    Started => 1,
    Finished => 2,
    Failed => -1,
    Skipped => -2,
});

status_codes!(BatchStatus, "batch", {
    Created => 0,
    Started => 1,
    Finished => 2,
    Timeout => 3,
    Failed => -1,
    Skipped => -2,
});

status_codes!(ExportStatusCode, "export", {
    Started => 0,
    Finished => 1,
    Failed => -1,
});

impl StateMachine for EntityStatus {
    type Event = EntityEvent;

    const MACHINE: &'static str = "entity";
    const STATES: &'static [Self] = &[
        Self::Created,
        Self::Started,
        Self::Finished,
        Self::Failed,
        Self::Canceled,
    ];

    fn transition(self, event: EntityEvent) -> FerryResult<Transition<Self>> {
        use EntityStatus::*;

        let target = match event {
            EntityEvent::Start => Started,
            EntityEvent::Finish => Finished,
            EntityEvent::FailOp => Failed,
            EntityEvent::Cancel => Canceled,
        };

        match (self, event) {
            (Created, EntityEvent::Start) => Ok(Changed(Started)),
            (Started, EntityEvent::Finish) => Ok(Changed(Finished)),
            (Created | Started, EntityEvent::FailOp | EntityEvent::Cancel) => Ok(Changed(target)),
            (
                Finished | Failed | Canceled,
                EntityEvent::Finish | EntityEvent::FailOp | EntityEvent::Cancel,
            ) => Ok(Unchanged),
            _ => Err(self.invalid(event)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    fn event_name(event: EntityEvent) -> &'static str {
        match event {
            EntityEvent::Start => "start",
            EntityEvent::Finish => "finish",
            EntityEvent::FailOp => "fail",
            EntityEvent::Cancel => "cancel",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

impl StateMachine for TrackerStatus {
    type Event = TrackerEvent;

    const MACHINE: &'static str = "tracker";
    const STATES: &'static [Self] = &[
        Self::Created,
        Self::Started,
        Self::Finished,
        Self::Failed,
        Self::Skipped,
    ];

    fn transition(self, event: TrackerEvent) -> FerryResult<Transition<Self>> {
        use TrackerStatus::*;

        match (self, event) {
            (Created, TrackerEvent::Start) => Ok(Changed(Started)),
            (Started, TrackerEvent::Finish) => Ok(Changed(Finished)),
            (Created | Started, TrackerEvent::FailOp) => Ok(Changed(Failed)),
            (Created | Started, TrackerEvent::Skip) => Ok(Changed(Skipped)),

            // Re-affirming a terminal state is a no-op.
            (
                Finished | Failed | Skipped,
                TrackerEvent::Finish | TrackerEvent::FailOp | TrackerEvent::Skip,
            ) => Ok(Unchanged),

            _ => Err(self.invalid(event)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    fn event_name(event: TrackerEvent) -> &'static str {
        match event {
            TrackerEvent::Start => "start",
            TrackerEvent::Finish => "finish",
            TrackerEvent::FailOp => "fail",
            TrackerEvent::Skip => "skip",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Skipped)
    }
}

impl StateMachine for BatchStatus {
    type Event = BatchEvent;

    const MACHINE: &'static str = "batch";
    const STATES: &'static [Self] = &[
        Self::Created,
        Self::Started,
        Self::Finished,
        Self::Timeout,
        Self::Failed,
        Self::Skipped,
    ];

    fn transition(self, event: BatchEvent) -> FerryResult<Transition<Self>> {
        use BatchStatus::*;

        match (self, event) {
            (_, BatchEvent::Start) => Ok(Changed(Started)),

            (Started, BatchEvent::Retry) => Ok(Changed(Created)),

            (Created | Started, BatchEvent::CleanupStale) => Ok(Changed(Timeout)),
            (Timeout | Finished | Failed | Skipped, BatchEvent::CleanupStale) => Ok(Unchanged),

            (Started, BatchEvent::Finish) => Ok(Changed(Finished)),

            // A timed out batch still has to be resolved to failed or skipped.
            (Created | Started | Timeout, BatchEvent::FailOp) => Ok(Changed(Failed)),
            (Created | Started | Timeout, BatchEvent::Skip) => Ok(Changed(Skipped)),

            (
                Finished | Failed | Skipped,
                BatchEvent::Finish | BatchEvent::FailOp | BatchEvent::Skip,
            ) => Ok(Unchanged),

            _ => Err(self.invalid(event)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    fn event_name(event: BatchEvent) -> &'static str {
        match event {
            BatchEvent::Start => "start",
            BatchEvent::Retry => "retry",
            BatchEvent::CleanupStale => "cleanup_stale",
            BatchEvent::Finish => "finish",
            BatchEvent::FailOp => "fail",
            BatchEvent::Skip => "skip",
        }
    }

    /// `Timeout` is not terminal: the batch must first be resolved.
    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Skipped)
    }
}

impl StateMachine for ExportStatusCode {
    type Event = ExportEvent;

    const MACHINE: &'static str = "export";
    const STATES: &'static [Self] = &[Self::Started, Self::Finished, Self::Failed];

    fn transition(self, event: ExportEvent) -> FerryResult<Transition<Self>> {
        use ExportStatusCode::*;

        Ok(match (self, event) {
            // Restarting refreshes the export.
            (_, ExportEvent::Start) => Changed(Started),

            (Finished, ExportEvent::Finish) => Unchanged,
            (_, ExportEvent::Finish) => Changed(Finished),

            (Failed, ExportEvent::FailOp) => Unchanged,
            (_, ExportEvent::FailOp) => Changed(Failed),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    fn event_name(event: ExportEvent) -> &'static str {
        match event {
            ExportEvent::Start => "start",
            ExportEvent::Finish => "finish",
            ExportEvent::FailOp => "fail",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}
