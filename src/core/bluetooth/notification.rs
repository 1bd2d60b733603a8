//! Notification handling for the scanners
//! Forwards values pushed by an info characteristic into the session queue.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::session::{LinkOutcome, LinkStage};
use crate::core::bluetooth::session_manager::SessionMessage;
use crate::core::bluetooth::transport::{ProbeLink, ServiceGroup, ValueStream};

/// Pumps one notification stream until it ends, errors, or is cancelled.
pub struct NotificationHandler {
    serial: String,
    attempt: u64,
    group: ServiceGroup,
    link: Arc<dyn ProbeLink>,
    queue: mpsc::UnboundedSender<SessionMessage>,
}

impl NotificationHandler {
    pub fn new(
        serial: String,
        attempt: u64,
        group: ServiceGroup,
        link: Arc<dyn ProbeLink>,
        queue: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        Self { serial, attempt, group, link, queue }
    }

    pub fn spawn(self, stream: ValueStream, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.process_notifications(stream, cancel).await;
        })
    }

    fn forward(&self, outcome: LinkOutcome) -> bool {
        self.queue
            .send(SessionMessage::Link {
                serial: self.serial.clone(),
                attempt: self.attempt,
                outcome,
            })
            .is_ok()
    }

    async fn process_notifications(self, mut stream: ValueStream, cancel: CancellationToken) {
        info!("Listening for {} notifications from {}...", self.group, self.serial);

        let failure = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{} notifications from {} cancelled", self.group, self.serial);
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        debug!("Received {} data from {}: {:?}", self.group, self.serial, value);
                        if !self.forward(LinkOutcome::Value(self.group, value)) {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in {} notification stream: {}", self.group, e);
                        break e.to_string();
                    }
                    None => break "notification stream ended".to_string(),
                }
            }
        };

        info!("{} notification stream of {} stopped: {}", self.group, self.serial, failure);
        // Only a dropped device ends the session; anything else is a transport error.
        if self.link.is_connected().await {
            self.forward(LinkOutcome::Failed(LinkStage::Notify(self.group), failure));
        } else {
            self.forward(LinkOutcome::Lost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures_util::stream;

    use crate::core::bluetooth::testing::FakeLink;

    fn values(items: Vec<anyhow::Result<Vec<u8>>>) -> ValueStream {
        stream::iter(items).boxed()
    }

    fn outcomes(rx: &mut mpsc::UnboundedReceiver<SessionMessage>) -> Vec<LinkOutcome> {
        let mut out = Vec::new();
        while let Ok(SessionMessage::Link { outcome, attempt, .. }) = rx.try_recv() {
            assert_eq!(attempt, 3);
            out.push(outcome);
        }
        out
    }

    fn handler(
        group: ServiceGroup,
        link: Arc<FakeLink>,
    ) -> (NotificationHandler, mpsc::UnboundedReceiver<SessionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NotificationHandler::new("S1".into(), 3, group, link, tx), rx)
    }

    #[tokio::test]
    async fn forwards_values_then_reports_loss_of_the_device() {
        let link = Arc::new(FakeLink::named("probe"));
        link.drop_link();
        let (handler, mut rx) = handler(ServiceGroup::Power, link);
        handler
            .spawn(values(vec![Ok(vec![1]), Ok(vec![0])]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcomes(&mut rx),
            vec![
                LinkOutcome::Value(ServiceGroup::Power, vec![1]),
                LinkOutcome::Value(ServiceGroup::Power, vec![0]),
                LinkOutcome::Lost,
            ]
        );
    }

    #[tokio::test]
    async fn stream_errors_on_a_live_link_are_transport_errors() {
        let (handler, mut rx) = handler(ServiceGroup::Wifi, Arc::new(FakeLink::named("probe")));
        handler
            .spawn(values(vec![Err(anyhow!("CCCD write failed"))]), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcomes(&mut rx),
            vec![LinkOutcome::Failed(
                LinkStage::Notify(ServiceGroup::Wifi),
                "CCCD write failed".into()
            )]
        );
    }

    #[tokio::test]
    async fn ended_stream_on_a_live_link_is_not_a_loss() {
        let (handler, mut rx) = handler(ServiceGroup::Power, Arc::new(FakeLink::named("probe")));
        handler.spawn(values(vec![]), CancellationToken::new()).await.unwrap();

        assert!(matches!(
            outcomes(&mut rx).as_slice(),
            [LinkOutcome::Failed(LinkStage::Notify(ServiceGroup::Power), _)]
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_silently() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (handler, mut rx) = handler(ServiceGroup::Wifi, Arc::new(FakeLink::named("probe")));
        handler.spawn(stream::pending().boxed(), cancel).await.unwrap();
        assert!(outcomes(&mut rx).is_empty());
    }
}
