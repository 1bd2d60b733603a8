//! Link operation execution
//! Runs the operations issued by the session state machine on their link,
//! each in its own task and bounded by the operation timeout, and posts the
//! outcome back into the session queue.

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::session::{LinkOp, LinkOutcome, LinkStage, PendingOp};
use crate::core::bluetooth::session_manager::SessionMessage;

/// Connection manager for the scanners
#[derive(Clone)]
pub struct ConnectionManager {
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Spawns the operation. Nothing is posted once the token of its round
    /// fires, and notification forwarders started by it stop with the round.
    pub fn execute(&self, pending: PendingOp, queue: mpsc::UnboundedSender<SessionMessage>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let serial = pending.serial.clone();
            let attempt = pending.attempt;
            let cancel = pending.cancel.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Operation on {} cancelled", serial);
                    return;
                }
                outcome = manager.run(pending, &queue) => outcome,
            };
            if queue
                .send(SessionMessage::Link { serial, attempt, outcome })
                .is_err()
            {
                debug!("Session queue closed, dropping link outcome");
            }
        });
    }

    async fn run(
        &self,
        pending: PendingOp,
        queue: &mpsc::UnboundedSender<SessionMessage>,
    ) -> LinkOutcome {
        let PendingOp { serial, attempt, link, op, cancel } = pending;
        debug!("Running {:?} on {} ({})", op, serial, link.id());

        let result = match op {
            LinkOp::Connect => self
                .bounded(LinkStage::Connect, link.connect())
                .await
                .map(|()| {
                    info!("Connected to scanner {}", serial);
                    LinkOutcome::Connected
                }),
            LinkOp::DiscoverServices(groups) => self
                .bounded(LinkStage::ServiceDiscovery, link.discover_services(&groups))
                .await
                .map(LinkOutcome::ServicesDiscovered),
            LinkOp::DiscoverCharacteristics(group) => self
                .bounded(
                    LinkStage::CharacteristicDiscovery(group),
                    link.discover_characteristics(group),
                )
                .await
                .map(|properties| LinkOutcome::CharacteristicsDiscovered(group, properties)),
            LinkOp::Subscribe(group) => self
                .bounded(LinkStage::Subscribe(group), link.subscribe(group))
                .await
                .map(|stream| {
                    NotificationHandler::new(
                        serial.clone(),
                        attempt,
                        group,
                        link.clone(),
                        queue.clone(),
                    )
                    .spawn(stream, cancel);
                    LinkOutcome::Subscribed(group)
                }),
            LinkOp::Read(group) => self
                .bounded(LinkStage::Read(group), link.read(group))
                .await
                .map(|value| LinkOutcome::Value(group, value)),
            LinkOp::Write(group, data) => self
                .bounded(LinkStage::Write(group), link.write(group, &data))
                .await
                .map(|()| LinkOutcome::Written(group)),
        };
        result.unwrap_or_else(|failure| failure)
    }

    async fn bounded<T>(
        &self,
        stage: LinkStage,
        operation: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, LinkOutcome> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed: {}", stage, e);
                Err(LinkOutcome::Failed(stage, e.to_string()))
            }
            Err(_) => {
                warn!("{} timed out after {:?}", stage, self.timeout);
                Err(LinkOutcome::Failed(
                    stage,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use crate::core::bluetooth::testing::FakeLink;
    use crate::core::bluetooth::transport::{InfoProperties, ServiceGroup};

    async fn outcome_of(link: Arc<FakeLink>, op: LinkOp, timeout: Duration) -> LinkOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingOp {
            serial: "S1".into(),
            attempt: 1,
            link,
            op,
            cancel: CancellationToken::new(),
        };
        ConnectionManager::new(timeout).execute(pending, tx);
        match rx.recv().await {
            Some(SessionMessage::Link { outcome, .. }) => outcome,
            _ => panic!("expected a link outcome"),
        }
    }

    #[tokio::test]
    async fn reports_success() {
        let link = Arc::new(FakeLink::scanner("probe"));
        let outcome = outcome_of(link.clone(), LinkOp::Connect, Duration::from_secs(1)).await;
        assert_eq!(outcome, LinkOutcome::Connected);

        let outcome = outcome_of(
            link.clone(),
            LinkOp::DiscoverCharacteristics(ServiceGroup::Power),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(
            outcome,
            LinkOutcome::CharacteristicsDiscovered(
                ServiceGroup::Power,
                InfoProperties { notify: true, read: true }
            )
        );
    }

    #[tokio::test]
    async fn reports_failures_with_their_stage() {
        let link = Arc::new(FakeLink::named("probe").failing_connect());
        let outcome = outcome_of(link, LinkOp::Connect, Duration::from_secs(1)).await;
        assert_eq!(
            outcome,
            LinkOutcome::Failed(LinkStage::Connect, "connection refused".into())
        );

        let link = Arc::new(FakeLink::named("probe"));
        let outcome = outcome_of(link, LinkOp::Read(ServiceGroup::Wifi), Duration::from_secs(1)).await;
        assert!(matches!(outcome, LinkOutcome::Failed(LinkStage::Read(ServiceGroup::Wifi), _)));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_time_out() {
        let gate = Arc::new(Notify::new());
        let link = Arc::new(FakeLink::named("probe").with_connect_gate(gate));
        let outcome = outcome_of(link, LinkOp::Connect, Duration::from_secs(10)).await;
        assert!(matches!(outcome, LinkOutcome::Failed(LinkStage::Connect, _)));
    }

    #[tokio::test]
    async fn cancelled_operations_post_nothing() {
        let gate = Arc::new(Notify::new());
        let link = Arc::new(FakeLink::named("probe").with_connect_gate(gate));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = PendingOp {
            serial: "S1".into(),
            attempt: 1,
            link,
            op: LinkOp::Connect,
            cancel: cancel.clone(),
        };
        ConnectionManager::new(Duration::from_secs(60)).execute(pending, tx);
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriptions_stop_with_their_round() {
        let link = Arc::new(FakeLink::scanner("probe"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = PendingOp {
            serial: "S1".into(),
            attempt: 1,
            link: link.clone(),
            op: LinkOp::Subscribe(ServiceGroup::Power),
            cancel: cancel.clone(),
        };
        ConnectionManager::new(Duration::from_secs(1)).execute(pending, tx);
        assert!(matches!(
            rx.recv().await,
            Some(SessionMessage::Link { outcome: LinkOutcome::Subscribed(ServiceGroup::Power), .. })
        ));

        cancel.cancel();
        link.notify(ServiceGroup::Power, &[1]);
        assert!(rx.recv().await.is_none());
    }
}
