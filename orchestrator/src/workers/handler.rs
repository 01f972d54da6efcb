//! Decode-then-advance handler shared by every worker.

use crate::choreographer::Choreographer;
use analysis_orchestrator_core::codec;
use analysis_orchestrator_core::workflow::{Trigger, WorkflowInput};
use analysis_orchestrator_core::{
    BrokerFuture, HandlerOutcome, MessageContract, MessageHandler, MessagingError, ShutdownSignal,
};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Decodes a `T` and runs its workflow row.
///
/// Undecodable and `null` bodies, and inputs the row cannot build an event
/// from, are logged and reported as [`HandlerOutcome::RejectDrop`] with
/// nothing published. Transport failures are returned as errors so the
/// delivery stays unsettled.
pub struct WorkflowHandler<T> {
    trigger: Trigger,
    choreographer: Arc<Choreographer>,
    _contract: PhantomData<fn() -> T>,
}

impl<T> WorkflowHandler<T> {
    /// Handler advancing `trigger`'s row.
    #[must_use]
    pub fn new(trigger: Trigger, choreographer: Arc<Choreographer>) -> Self {
        Self {
            trigger,
            choreographer,
            _contract: PhantomData,
        }
    }
}

impl<T> MessageHandler for WorkflowHandler<T>
where
    T: DeserializeOwned + MessageContract + Into<WorkflowInput> + Send,
{
    fn handle<'a>(
        &'a self,
        body: &'a [u8],
        shutdown: &'a ShutdownSignal,
    ) -> BrokerFuture<'a, HandlerOutcome> {
        Box::pin(async move {
            let input: WorkflowInput = match codec::decode::<T>(body) {
                Ok(message) => message.into(),
                Err(error) => {
                    tracing::warn!(
                        contract = T::NAME,
                        error = %error,
                        bytes = body.len(),
                        "Dropping undecodable message"
                    );
                    return Ok(HandlerOutcome::RejectDrop);
                }
            };

            tracing::info!(
                contract = T::NAME,
                correlation_id = ?input.correlation_id,
                object_key = ?input.object_key,
                "Message received"
            );

            match self.choreographer.advance(self.trigger, &input, shutdown).await {
                Ok(_) => Ok(HandlerOutcome::Ack),
                Err(MessagingError::Decode(reason)) => {
                    tracing::warn!(
                        contract = T::NAME,
                        trigger = self.trigger.name(),
                        reason = %reason,
                        "Dropping message the workflow cannot advance"
                    );
                    Ok(HandlerOutcome::RejectDrop)
                }
                Err(error) => Err(error),
            }
        })
    }
}
