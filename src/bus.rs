use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MAX_CAN_BUSES: usize = 2;
pub const MAX_ACCEPTANCE_FILTERS: usize = 16;
pub const MAX_TX_QUEUE_SIZE: usize = 32;
pub const CAN_FRAME_SIZE: usize = 8;

/// Highest arbitration id representable in a standard 11-bit frame.
const MAX_STANDARD_ID: u32 = 0x7FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanMessageFormat {
    Standard,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanMessage {
    pub id: u32,
    pub format: CanMessageFormat,
    pub data: [u8; CAN_FRAME_SIZE],
    pub length: u8,
}

impl CanMessage {
    /// Build a frame, deriving the format from the arbitration id.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let length = payload.len().min(CAN_FRAME_SIZE);
        let mut data = [0u8; CAN_FRAME_SIZE];
        data[..length].copy_from_slice(&payload[..length]);
        Self {
            id,
            format: if id > MAX_STANDARD_ID {
                CanMessageFormat::Extended
            } else {
                CanMessageFormat::Standard
            },
            data,
            length: length as u8,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Sink for outgoing CAN frames.
///
/// The protocol codec writes request and flow-control frames through this
/// seam; a bus implements it by enqueueing onto its transmit queue.
pub trait FrameWriter {
    /// Returns false if the frame could not be accepted.
    fn send_frame(&mut self, id: u32, payload: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct AcceptanceFilter {
    id: u32,
    format: CanMessageFormat,
    refcount: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The hardware filter table has no free entries.
    CapacityExhausted,
}

impl core::fmt::Display for FilterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FilterError::CapacityExhausted => write!(f, "acceptance filter table full"),
        }
    }
}

impl std::error::Error for FilterError {}

/// One physical CAN controller.
///
/// Owns the transmit queue the firmware drains onto the wire and the
/// reference-counted acceptance filter table. Filters are shared across
/// overlapping diagnostic requests; the last releaser uninstalls.
#[derive(Debug)]
pub struct CanBus {
    address: u8,
    raw_writable: bool,
    tx_queue: Deque<CanMessage, MAX_TX_QUEUE_SIZE>,
    filters: Vec<AcceptanceFilter, MAX_ACCEPTANCE_FILTERS>,
}

impl CanBus {
    pub fn new(address: u8, raw_writable: bool) -> Self {
        Self {
            address,
            raw_writable,
            tx_queue: Deque::new(),
            filters: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn raw_writable(&self) -> bool {
        self.raw_writable
    }

    /// Queue a frame for transmission. A full queue drops the frame.
    pub fn enqueue_message(&mut self, message: CanMessage) {
        if self.tx_queue.push_back(message).is_err() {
            warn!(
                "transmit queue full on bus {}, dropping frame 0x{:x}",
                self.address, message.id
            );
        }
    }

    /// Pop the next frame bound for the wire. The firmware main loop drains
    /// this into the controller mailboxes.
    pub fn dequeue_message(&mut self) -> Option<CanMessage> {
        self.tx_queue.pop_front()
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    /// Install a filter or bump its reference count.
    pub fn add_acceptance_filter(
        &mut self,
        id: u32,
        format: CanMessageFormat,
    ) -> Result<(), FilterError> {
        if let Some(filter) = self
            .filters
            .iter_mut()
            .find(|f| f.id == id && f.format == format)
        {
            filter.refcount = filter.refcount.saturating_add(1);
            return Ok(());
        }

        self.filters
            .push(AcceptanceFilter {
                id,
                format,
                refcount: 1,
            })
            .map_err(|_| {
                debug!(
                    "no room for another acceptance filter 0x{:x} on bus {}",
                    id, self.address
                );
                FilterError::CapacityExhausted
            })
    }

    /// Drop one reference to a filter, uninstalling it when the count
    /// reaches zero. Removing an absent filter is a logged no-op.
    pub fn remove_acceptance_filter(&mut self, id: u32, format: CanMessageFormat) {
        match self
            .filters
            .iter()
            .position(|f| f.id == id && f.format == format)
        {
            Some(index) => {
                self.filters[index].refcount -= 1;
                if self.filters[index].refcount == 0 {
                    self.filters.swap_remove(index);
                }
            }
            None => {
                debug!(
                    "asked to remove filter 0x{:x} on bus {} but it is not installed",
                    id, self.address
                );
            }
        }
    }

    pub fn has_acceptance_filter(&self, id: u32) -> bool {
        self.filters.iter().any(|f| f.id == id)
    }

    pub fn filter_refcount(&self, id: u32) -> u8 {
        self.filters
            .iter()
            .find(|f| f.id == id)
            .map_or(0, |f| f.refcount)
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

impl FrameWriter for CanBus {
    fn send_frame(&mut self, id: u32, payload: &[u8]) -> bool {
        self.enqueue_message(CanMessage::new(id, payload));
        true
    }
}

/// Find a bus by its configured address.
pub fn lookup_bus(address: u8, buses: &[CanBus]) -> Option<usize> {
    buses.iter().position(|bus| bus.address() == address)
}
