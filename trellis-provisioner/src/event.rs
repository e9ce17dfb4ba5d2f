//! Event bus adapter - normalizes raw stack traffic into one ordered stream
//!
//! The bearer pushes [`StackEvent`]s and timer tasks push [`TimerKind`]s into
//! the same queue; the single consumer sees both in arrival order, so
//! timer-driven and stack-driven transitions are totally ordered.

use tokio::sync::mpsc;
use tracing::debug;

use trellis_proto::{
    Bearer, ConfigStatus, DeviceUuid, KeyIndex, ProvisioningFailure, UnicastAddress,
};

use crate::ddb::DdbEntry;

/// Raw traffic as the bearer reports it, before normalization
#[derive(Debug, Clone)]
pub enum StackEvent {
    SystemBooted { version: String },
    UnprovisionedBeacon { uuid: DeviceUuid, bearer: Bearer, rssi: i8 },
    ProvisioningLinkOpened { uuid: DeviceUuid },
    DeviceProvisioned { uuid: DeviceUuid, address: UnicastAddress, elements: u8 },
    ProvisioningFailed { uuid: DeviceUuid, reason: u8 },
    DdbEntryReported { uuid: DeviceUuid, address: UnicastAddress, elements: u8, netkey_index: KeyIndex },
    DdbListFinished { count: u16 },
    ConfigResponse { handle: u32, status: u8, payload: Vec<u8> },
    NodeResetAcknowledged,
    /// Link housekeeping the orchestrator does not care about
    ConnectionParamsChanged { interval_ms: u16, latency: u16 },
    GattMtuExchanged { mtu: u16 },
}

/// Single-shot timers, delivered through the event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Bounded scan window for the inventory scan
    ScanWindow,
    /// How long a provision operation keeps scanning for its target
    TargetWait,
    /// Settle delay between node-reset ack and the hardware reset
    ResetSettle,
    /// Per-request response timeout, keyed by the request handle it was armed for
    StepTimeout { handle: u32 },
}

#[derive(Debug, Clone)]
enum BusItem {
    Stack(StackEvent),
    Timer(TimerKind),
}

/// Normalized event stream consumed by the orchestrator
#[derive(Debug, Clone)]
pub enum Event {
    StackBooted { version: String },
    ScanReport { uuid: DeviceUuid, bearer: Bearer, rssi: i8 },
    LinkOpened { uuid: DeviceUuid },
    ProvisioningComplete { uuid: DeviceUuid, address: UnicastAddress, elements: u8 },
    ProvisioningFailed { uuid: DeviceUuid, reason: ProvisioningFailure },
    DdbEntry(DdbEntry),
    DdbListComplete { count: u16 },
    StepResponse { handle: u32, status: ConfigStatus, payload: Vec<u8> },
    NodeResetAcknowledged,
    TimerElapsed(TimerKind),
}

/// Producer half - cloned into the bearer and every timer task
#[derive(Clone)]
pub struct BusSender {
    tx: mpsc::UnboundedSender<BusItem>,
}

impl BusSender {
    pub fn stack(&self, event: StackEvent) {
        // A dropped receiver means the run loop is gone; nothing left to notify.
        let _ = self.tx.send(BusItem::Stack(event));
    }

    pub fn timer(&self, kind: TimerKind) {
        let _ = self.tx.send(BusItem::Timer(kind));
    }
}

/// Consumer half - owned by the run loop
pub struct EventBus {
    rx: mpsc::UnboundedReceiver<BusItem>,
}

impl EventBus {
    pub fn channel() -> (BusSender, EventBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BusSender { tx }, EventBus { rx })
    }

    /// Non-blocking poll; None when the queue is currently empty
    pub fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => {
                    if let Some(event) = translate(item) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Await the next normalized event; None when every sender is gone
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let item = self.rx.recv().await?;
            if let Some(event) = translate(item) {
                return Some(event);
            }
        }
    }
}

/// Unrecognized stack traffic is dropped here, silently apart from a debug
/// line, so new stack event kinds never break the orchestrator.
fn translate(item: BusItem) -> Option<Event> {
    let event = match item {
        BusItem::Timer(kind) => Event::TimerElapsed(kind),
        BusItem::Stack(stack) => match stack {
            StackEvent::SystemBooted { version } => Event::StackBooted { version },
            StackEvent::UnprovisionedBeacon { uuid, bearer, rssi } => {
                Event::ScanReport { uuid, bearer, rssi }
            }
            StackEvent::ProvisioningLinkOpened { uuid } => Event::LinkOpened { uuid },
            StackEvent::DeviceProvisioned { uuid, address, elements } => {
                Event::ProvisioningComplete { uuid, address, elements }
            }
            StackEvent::ProvisioningFailed { uuid, reason } => Event::ProvisioningFailed {
                uuid,
                reason: ProvisioningFailure::from_code(reason),
            },
            StackEvent::DdbEntryReported { uuid, address, elements, netkey_index } => {
                Event::DdbEntry(DdbEntry { uuid, address, elements, netkey_index })
            }
            StackEvent::DdbListFinished { count } => Event::DdbListComplete { count },
            StackEvent::ConfigResponse { handle, status, payload } => Event::StepResponse {
                handle,
                status: ConfigStatus::from_code(status),
                payload,
            },
            StackEvent::NodeResetAcknowledged => Event::NodeResetAcknowledged,
            other => {
                debug!(?other, "dropping stack event with no orchestrator mapping");
                return None;
            }
        },
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_event_is_non_blocking() {
        let (_tx, mut bus) = EventBus::channel();
        assert!(bus.next_event().is_none());
    }

    #[test]
    fn unknown_traffic_is_dropped() {
        let (tx, mut bus) = EventBus::channel();
        tx.stack(StackEvent::GattMtuExchanged { mtu: 247 });
        tx.stack(StackEvent::ConnectionParamsChanged { interval_ms: 30, latency: 0 });
        tx.stack(StackEvent::NodeResetAcknowledged);

        // Both housekeeping events vanish; the recognized one survives.
        assert!(matches!(bus.next_event(), Some(Event::NodeResetAcknowledged)));
        assert!(bus.next_event().is_none());
    }

    #[test]
    fn timers_share_the_queue_in_arrival_order() {
        let (tx, mut bus) = EventBus::channel();
        tx.stack(StackEvent::SystemBooted { version: "1.0".into() });
        tx.timer(TimerKind::ScanWindow);
        tx.stack(StackEvent::UnprovisionedBeacon {
            uuid: DeviceUuid::from_bytes([1; 16]),
            bearer: Bearer::Adv,
            rssi: -40,
        });

        assert!(matches!(bus.next_event(), Some(Event::StackBooted { .. })));
        assert!(matches!(bus.next_event(), Some(Event::TimerElapsed(TimerKind::ScanWindow))));
        assert!(matches!(bus.next_event(), Some(Event::ScanReport { .. })));
    }
}
