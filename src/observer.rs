use service::{SignalingHandler, SipEvent};

use tokio::sync::mpsc::UnboundedSender;

/// Fans signaling events out to the bus and the log.
///
/// Runs synchronously inside transitions, so it only enqueues; consumers
/// (bell button feedback, the relay actuator, the UI) hang off the bus
/// receiver.
#[derive(Clone)]
pub struct Observer {
    events: UnboundedSender<SipEvent>,
}

impl Observer {
    pub fn new(events: UnboundedSender<SipEvent>) -> Self {
        Self { events }
    }
}

impl SignalingHandler for Observer {
    fn on_event(&self, event: SipEvent) {
        match &event {
            SipEvent::CallStart => log::info!("call started"),
            SipEvent::CallEnd => log::info!("call ended"),
            SipEvent::CallCancelled { reason } => {
                log::info!("call cancelled: reason={reason:?}")
            }
            SipEvent::ButtonPress {
                signal,
                duration_ms,
            } => log::info!("button press: signal={signal} duration={duration_ms}ms"),
        }

        // The bus consumer may be gone during shutdown; events are then only
        // logged.
        let _ = self.events.send(event);
    }
}
