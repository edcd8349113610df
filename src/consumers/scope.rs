use crate::transport::SettlementHandle;
use crate::transport::IncomingMessage;

/// Guarantees a delivery gets a disposition, whatever happens to the code processing it.
///
/// If the scope is dropped while the delivery is still unsettled it is rejected in a background
/// task:
/// - without requeue if processing panicked, a poison message would otherwise loop forever;
/// - with requeue otherwise (the processing future was dropped before completion).
pub(crate) struct ProcessScope {
    settlement: SettlementHandle,
}

impl ProcessScope {
    pub(crate) fn new(message: &IncomingMessage) -> Self {
        Self {
            settlement: message.settlement_handle(),
        }
    }
}

impl Drop for ProcessScope {
    fn drop(&mut self) {
        if self.settlement.is_processed() {
            return;
        }
        let requeue = !std::thread::panicking();
        let settlement = self.settlement.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = settlement.reject(requeue).await {
                        tracing::warn!(error = %e, requeue, "Failed to reject an unsettled delivery");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime available to reject an unsettled delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Acker, ConsumerTag};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait::async_trait]
    impl Acker for Recorder {
        async fn ack(&self) -> Result<(), anyhow::Error> {
            self.0.lock().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
            self.0
                .lock()
                .push(if requeue { "requeue" } else { "discard" });
            Ok(())
        }
    }

    fn message(recorder: &Recorder) -> IncomingMessage {
        IncomingMessage::new(1, ConsumerTag::generate(), vec![], recorder.clone())
    }

    #[tokio::test]
    async fn settled_deliveries_are_left_alone() {
        let recorder = Recorder::default();
        let message = message(&recorder);

        {
            let _scope = ProcessScope::new(&message);
            message.ack().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*recorder.0.lock(), vec!["ack"]);
    }

    #[tokio::test]
    async fn abandoned_deliveries_are_requeued() {
        let recorder = Recorder::default();
        let message = message(&recorder);

        drop(ProcessScope::new(&message));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*recorder.0.lock(), vec!["requeue"]);
        assert!(message.is_processed());
    }

    #[tokio::test]
    async fn deliveries_whose_processing_panicked_are_discarded() {
        let recorder = Recorder::default();
        let message = message(&recorder);

        let task = tokio::spawn(async move {
            let _scope = ProcessScope::new(&message);
            panic!("handler blew up");
        });
        assert!(task.await.unwrap_err().is_panic());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*recorder.0.lock(), vec!["discard"]);
    }
}
