//! Progress pump.
//!
//! One consumer task per `start`/`resume` invocation translates streaming
//! [`CompletionStatus`] updates into `callProgress` / `callChat` monitor
//! events. Close is idempotent: it drops the sender, which ends the channel,
//! then joins the consumer so no event is emitted after close returns.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weft_contract::{CallFrame, Event, EventType, Monitor, ProgressSender};

pub(crate) struct ProgressPump {
    tx: Option<ProgressSender>,
    consumer: Option<JoinHandle<()>>,
}

impl ProgressPump {
    pub(crate) fn start(frame: CallFrame, monitor: Arc<dyn Monitor>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<weft_contract::CompletionStatus>();
        let consumer = tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                if let Some(partial) = status.partial_response {
                    monitor.event(
                        Event::new(EventType::CallProgress, Some(frame.clone()))
                            .with_completion_id(status.completion_id)
                            .with_content(partial),
                    );
                } else {
                    monitor.event(
                        Event::new(EventType::CallChat, Some(frame.clone()))
                            .with_completion_id(status.completion_id)
                            .with_chat_exchange(status.request, status.response)
                            .with_usage(status.usage)
                            .with_cached(status.cached),
                    );
                }
            }
        });
        Self {
            tx: Some(tx),
            consumer: Some(consumer),
        }
    }

    /// A sender for the engine. After close this returns a disconnected
    /// sender whose sends are dropped.
    pub(crate) fn sender(&self) -> ProgressSender {
        match &self.tx {
            Some(tx) => tx.clone(),
            None => mpsc::unbounded_channel().0,
        }
    }

    /// Close the channel and join the consumer. Safe to call repeatedly.
    pub(crate) async fn close(&mut self) {
        self.tx.take();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
    }
}
