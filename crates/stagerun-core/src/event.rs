use crate::types::PlanEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all plan events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PlanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PlanEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PlanEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanId, Status};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(PlanEvent::StatusChanged {
            plan_id: PlanId::from("p1"),
            from: Status::Initializing,
            to: Status::Up,
        });

        match rx.recv().await.unwrap() {
            PlanEvent::StatusChanged { to, .. } => assert_eq!(to, Status::Up),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(PlanEvent::StatusChanged {
            plan_id: PlanId::from("p1"),
            from: Status::Up,
            to: Status::Down,
        });
    }
}
