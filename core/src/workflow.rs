//! The analysis workflow as an explicit transition table.
//!
//! Each worker implements exactly one row: `trigger × from-state → steps ×
//! to-state`. Keeping the rows in one table makes the choreography reviewable
//! in one place and makes its known gap testable: no row has a compensation
//! step, so an emission that fails after the trigger was already acknowledged
//! is never repaired.
//!
//! ```text
//! Idle    ──RequestAnalysis──────► emit Started, work, emit Completed ──► Completed
//! Idle    ──ImageUploaded────────► emit Started                       ──► Started
//! Started ──RecognitionCompleted─► emit Completed                     ──► Completed
//! ```

use crate::contracts::{
    AnalysisCompleted, AnalysisStarted, CorrelationId, ImageUploaded, ObjectKey,
    RecognitionCompleted, RequestAnalysis,
};
use crate::error::MessagingError;
use crate::topology::{AckMode, exchanges};

/// Where a workflow instance stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    /// Nothing has happened yet
    Idle,
    /// `AnalysisStarted` was emitted
    Started,
    /// `AnalysisCompleted` was emitted
    Completed,
}

/// Inbound message that advances the workflow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Command from the graph gateway
    RequestAnalysis,
    /// Event from the ingestion service
    ImageUploaded,
    /// Event from the recognition service
    RecognitionCompleted,
}

impl Trigger {
    /// Contract name of the triggering message.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RequestAnalysis => "RequestAnalysis",
            Self::ImageUploaded => "ImageUploaded",
            Self::RecognitionCompleted => "RecognitionCompleted",
        }
    }
}

/// Event emitted by the orchestrator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Emission {
    /// Broadcast `AnalysisStarted`
    AnalysisStarted,
    /// Broadcast `AnalysisCompleted { success: true }`
    AnalysisCompleted,
}

impl Emission {
    /// Fanout exchange the emission is published on.
    #[must_use]
    pub const fn exchange(self) -> &'static str {
        match self {
            Self::AnalysisStarted => exchanges::ANALYSIS_STARTED,
            Self::AnalysisCompleted => exchanges::ANALYSIS_COMPLETED,
        }
    }

    /// Build the event for `input`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Decode`] when `AnalysisStarted` is requested
    /// for an input without an object key.
    pub fn build(self, input: &WorkflowInput) -> Result<Outbound, MessagingError> {
        match self {
            Self::AnalysisStarted => {
                let object_key = input.object_key.clone().ok_or_else(|| {
                    MessagingError::Decode("AnalysisStarted requires an objectKey".to_string())
                })?;
                Ok(Outbound::Started(AnalysisStarted {
                    correlation_id: input.correlation_id.clone(),
                    object_key,
                }))
            }
            Self::AnalysisCompleted => Ok(Outbound::Completed(AnalysisCompleted {
                correlation_id: input.correlation_id.clone(),
                object_key: input.object_key.clone(),
                success: true,
            })),
        }
    }
}

/// A built event, ready to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// `AnalysisStarted`
    Started(AnalysisStarted),
    /// `AnalysisCompleted`
    Completed(AnalysisCompleted),
}

/// One step of a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Publish an event
    Emit(Emission),
    /// Perform (or simulate) the analysis work
    PerformWork,
}

/// One row of the workflow table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Inbound message
    pub trigger: Trigger,
    /// State the trigger applies to
    pub from: WorkflowState,
    /// Steps executed in order
    pub steps: &'static [Step],
    /// State after every step succeeded
    pub to: WorkflowState,
    /// How the trigger is acknowledged
    pub ack_mode: AckMode,
    /// Event emitted if a step fails after the trigger was acknowledged
    pub compensation: Option<Emission>,
}

impl Transition {
    /// Emissions in publication order.
    pub fn emissions(&self) -> impl Iterator<Item = Emission> + '_ {
        self.steps.iter().filter_map(|step| match step {
            Step::Emit(emission) => Some(*emission),
            Step::PerformWork => None,
        })
    }

    /// Emissions whose failure is neither retried nor compensated.
    ///
    /// With auto-acknowledge the trigger is gone before any step runs, so a
    /// failed emission stalls the workflow silently. With manual
    /// acknowledgement the trigger stays unsettled and is redelivered.
    #[must_use]
    pub fn unprotected_emissions(&self) -> Vec<Emission> {
        if self.ack_mode == AckMode::Auto && self.compensation.is_none() {
            self.emissions().collect()
        } else {
            Vec::new()
        }
    }
}

/// The full workflow table.
pub const TRANSITIONS: [Transition; 3] = [
    Transition {
        trigger: Trigger::RequestAnalysis,
        from: WorkflowState::Idle,
        steps: &[
            Step::Emit(Emission::AnalysisStarted),
            Step::PerformWork,
            Step::Emit(Emission::AnalysisCompleted),
        ],
        to: WorkflowState::Completed,
        // Acked on receipt: a crash or failed publish between receipt and
        // the completed event loses the command and stalls the workflow.
        ack_mode: AckMode::Auto,
        compensation: None,
    },
    Transition {
        trigger: Trigger::ImageUploaded,
        from: WorkflowState::Idle,
        steps: &[Step::Emit(Emission::AnalysisStarted)],
        to: WorkflowState::Started,
        ack_mode: AckMode::Manual,
        compensation: None,
    },
    Transition {
        trigger: Trigger::RecognitionCompleted,
        from: WorkflowState::Started,
        steps: &[Step::Emit(Emission::AnalysisCompleted)],
        to: WorkflowState::Completed,
        ack_mode: AckMode::Manual,
        compensation: None,
    },
];

/// Row for `trigger`.
#[must_use]
pub fn transition(trigger: Trigger) -> &'static Transition {
    match trigger {
        Trigger::RequestAnalysis => &TRANSITIONS[0],
        Trigger::ImageUploaded => &TRANSITIONS[1],
        Trigger::RecognitionCompleted => &TRANSITIONS[2],
    }
}

/// Identifiers carried from a trigger to the events it causes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkflowInput {
    /// Workflow instance, when the trigger carried one
    pub correlation_id: Option<CorrelationId>,
    /// Image, when the trigger carried one
    pub object_key: Option<ObjectKey>,
}

impl From<RequestAnalysis> for WorkflowInput {
    fn from(command: RequestAnalysis) -> Self {
        Self {
            correlation_id: Some(command.correlation_id),
            object_key: Some(command.object_key),
        }
    }
}

impl From<ImageUploaded> for WorkflowInput {
    fn from(event: ImageUploaded) -> Self {
        Self {
            correlation_id: None,
            object_key: Some(event.object_key),
        }
    }
}

impl From<RecognitionCompleted> for WorkflowInput {
    fn from(event: RecognitionCompleted) -> Self {
        Self {
            correlation_id: event.correlation_id,
            object_key: event.object_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_trigger() {
        for trigger in [
            Trigger::RequestAnalysis,
            Trigger::ImageUploaded,
            Trigger::RecognitionCompleted,
        ] {
            assert_eq!(transition(trigger).trigger, trigger);
        }
    }

    #[test]
    fn request_emits_started_then_completed() {
        let row = transition(Trigger::RequestAnalysis);
        let emissions: Vec<_> = row.emissions().collect();
        assert_eq!(
            emissions,
            vec![Emission::AnalysisStarted, Emission::AnalysisCompleted]
        );
        assert_eq!(row.steps[1], Step::PerformWork);
        assert_eq!(row.to, WorkflowState::Completed);
    }

    #[test]
    fn no_row_has_compensation() {
        assert!(TRANSITIONS.iter().all(|row| row.compensation.is_none()));
    }

    #[test]
    fn only_auto_acked_root_has_unprotected_emissions() {
        assert_eq!(
            transition(Trigger::RequestAnalysis).unprotected_emissions(),
            vec![Emission::AnalysisStarted, Emission::AnalysisCompleted]
        );
        assert!(
            transition(Trigger::ImageUploaded)
                .unprotected_emissions()
                .is_empty()
        );
        assert!(
            transition(Trigger::RecognitionCompleted)
                .unprotected_emissions()
                .is_empty()
        );
    }

    #[test]
    fn started_from_upload_has_no_correlation() {
        let input = WorkflowInput::from(ImageUploaded {
            object_key: ObjectKey::new("img2.jpg"),
        });

        let built = Emission::AnalysisStarted.build(&input).unwrap();
        assert_eq!(
            built,
            Outbound::Started(AnalysisStarted {
                correlation_id: None,
                object_key: ObjectKey::new("img2.jpg"),
            })
        );
    }

    #[test]
    fn started_requires_object_key() {
        let input = WorkflowInput::default();
        assert!(matches!(
            Emission::AnalysisStarted.build(&input),
            Err(MessagingError::Decode(_))
        ));
    }

    #[test]
    fn completed_is_always_successful() {
        let input = WorkflowInput {
            correlation_id: Some(CorrelationId::new("abc")),
            object_key: None,
        };
        let Outbound::Completed(completed) = Emission::AnalysisCompleted.build(&input).unwrap()
        else {
            panic!("expected AnalysisCompleted");
        };
        assert!(completed.success);
        assert_eq!(completed.correlation_id, Some(CorrelationId::new("abc")));
    }
}
