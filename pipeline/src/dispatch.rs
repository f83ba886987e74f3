use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::metrics::{DELIVERY_BACKPRESSURE_TOTAL, EVENTS_CREATED_TOTAL};
use crate::model::{Event, EventDelivery, NewEvent, Rule, TelemetryRow};
use crate::store::TelemetryStore;

/// Records triggered-rule events and hands them to the asynchronous delivery
/// collaborator via a bounded queue.
///
/// The dispatcher is constructed once by the composition root and injected;
/// its queue is opened at startup and closed at shutdown. Calling
/// [`dispatch`](ActionDispatcher::dispatch) twice creates two events:
/// at-most-once-per-true-evaluation is the processor's responsibility.
#[derive(Clone)]
pub struct ActionDispatcher {
    store: Arc<dyn TelemetryStore>,
    delivery_tx: mpsc::Sender<EventDelivery>,
}

impl ActionDispatcher {
    pub fn new(store: Arc<dyn TelemetryStore>, delivery_tx: mpsc::Sender<EventDelivery>) -> Self {
        Self { store, delivery_tx }
    }

    /// Creates exactly one event for the rule and triggering row, resolving
    /// the device through the row's device-metric when possible, then
    /// enqueues the outbound delivery payload.
    ///
    /// The event is persisted before the enqueue: losing the hand-off (queue
    /// closed at shutdown) loses a notification, never the fact.
    pub async fn dispatch(&self, rule: &Rule, row: &TelemetryRow) -> Result<Event> {
        let device_id = self
            .store
            .device_metric_by_id(row.device_metric_id)
            .await?
            .map(|dm| dm.device_id);

        let event = self
            .store
            .insert_event(NewEvent {
                rule_id: rule.id,
                telemetry_id: Some(row.id),
                device_id,
                ts: Utc::now(),
            })
            .await?;
        EVENTS_CREATED_TOTAL.inc();

        let delivery = EventDelivery {
            event_id: event.id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            trigger_telemetry_id: event.telemetry_id,
            trigger_device_id: event.device_id,
            timestamp: event.ts,
        };

        match self.delivery_tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                DELIVERY_BACKPRESSURE_TOTAL.inc();
                debug!("Delivery queue full, using blocking send");
                if self.delivery_tx.send(delivery).await.is_err() {
                    warn!(
                        event_id = event.id,
                        "Delivery queue closed; event recorded but not handed off"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    event_id = event.id,
                    "Delivery queue closed; event recorded but not handed off"
                );
            }
        }

        Ok(event)
    }
}

/// Drains the delivery queue. This is the doorstep of the external retrying
/// delivery mechanism: everything past the log line is out of scope here.
pub async fn run_delivery(mut rx: mpsc::Receiver<EventDelivery>) {
    info!("Starting event delivery hand-off worker");

    while let Some(delivery) = rx.recv().await {
        info!(
            event_id = delivery.event_id,
            rule_id = delivery.rule_id,
            rule_name = %delivery.rule_name,
            trigger_telemetry_id = ?delivery.trigger_telemetry_id,
            trigger_device_id = ?delivery.trigger_device_id,
            "Event handed off for delivery"
        );
    }

    info!("Delivery queue closed, hand-off worker stopped");
}
