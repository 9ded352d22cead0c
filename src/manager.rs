//! The diagnostics manager: a fixed pool of request slots partitioned into
//! free, one-shot, and recurring collections, scheduled onto the CAN buses
//! and fed by the receive path.

use arrayvec::ArrayString;
use heapless::Vec;
use tracing::{debug, warn};

use crate::bus::{lookup_bus, CanBus, CanMessage, CanMessageFormat, MAX_CAN_BUSES};
use crate::clock::{Clock, Lcg, SystemClock};
use crate::codec::{self, DiagnosticRequest, DiagnosticResponse};
use crate::obd2::{
    decode_vin, vin_request, MODE_VEHICLE_INFORMATION, OBD2_FUNCTIONAL_BROADCAST_ID,
    OBD2_FUNCTIONAL_RESPONSE_COUNT, OBD2_FUNCTIONAL_RESPONSE_START,
    RESPONSE_ARBITRATION_ID_OFFSET, VIN_LENGTH, VIN_PID,
};
use crate::pipeline::{
    hex_payload, DiagnosticMessage, PartialFrameMessage, Pipeline, SignalValue, VehicleMessage,
};
use crate::request::{ActiveRequest, RequestOptions};

pub const MAX_SIMULTANEOUS_DIAG_REQUESTS: usize = 20;

/// Runtime configuration of the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Synthesize responses instead of touching the buses.
    pub emulated_data: bool,
    /// Emit partial multi-frame notifications while a response assembles.
    pub multiframe_streaming: bool,
    /// Bus address used for automatic OBD-II queries.
    pub obd2_bus: u8,
    pub rng_seed: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            emulated_data: false,
            multiframe_streaming: false,
            obd2_bus: 1,
            rng_seed: Lcg::DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsError {
    /// All request slots are taken.
    PoolExhausted,
    /// The bus could not install the response acceptance filter(s).
    FilterCapacity,
    /// A codec-equal recurring request already exists on the bus.
    DuplicateRecurring,
    FrequencyTooHigh,
    UnknownBus(u8),
    BusNotWritable(u8),
    /// The command is missing its arbitration id or mode.
    MissingRequestFields,
    NoSuchRequest,
    UnsupportedEmulatorRequest,
}

impl core::fmt::Display for DiagnosticsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DiagnosticsError::PoolExhausted => write!(f, "no free diagnostic request slots"),
            DiagnosticsError::FilterCapacity => write!(f, "could not install acceptance filter"),
            DiagnosticsError::DuplicateRecurring => {
                write!(f, "an equal recurring request already exists")
            }
            DiagnosticsError::FrequencyTooHigh => write!(f, "recurring frequency above maximum"),
            DiagnosticsError::UnknownBus(address) => write!(f, "no CAN bus at address {}", address),
            DiagnosticsError::BusNotWritable(address) => {
                write!(f, "raw CAN writes not allowed for bus {}", address)
            }
            DiagnosticsError::MissingRequestFields => {
                write!(f, "diagnostic requests need at least an arbitration id and mode")
            }
            DiagnosticsError::NoSuchRequest => write!(f, "no matching recurring request"),
            DiagnosticsError::UnsupportedEmulatorRequest => {
                write!(f, "request outside the emulator's supported ranges")
            }
        }
    }
}

impl std::error::Error for DiagnosticsError {}

type SlotList = Vec<usize, MAX_SIMULTANEOUS_DIAG_REQUESTS>;

/// Owns the buses, the request slot pool, and the three collections that
/// partition it. All mutation happens on the firmware main-loop context
/// through three entry points: `send_requests`, `receive`, and the command
/// handler.
pub struct DiagnosticsManager<C: Clock = SystemClock> {
    buses: Vec<CanBus, MAX_CAN_BUSES>,
    slots: [Option<ActiveRequest<C>>; MAX_SIMULTANEOUS_DIAG_REQUESTS],
    free: SlotList,
    /// One-shot requests in admission order.
    nonrecurring: SlotList,
    /// Recurring FIFO: index 0 is the next schedule candidate; completed
    /// entries rotate to the tail.
    recurring: SlotList,
    obd2_bus: Option<u8>,
    config: ManagerConfig,
    pub(crate) rng: Lcg,
    clock: C,
    vin: Option<ArrayString<VIN_LENGTH>>,
    previous_partial_frame: i32,
    initialized: bool,
}

impl DiagnosticsManager<SystemClock> {
    pub fn new(buses: Vec<CanBus, MAX_CAN_BUSES>, config: ManagerConfig) -> Self {
        Self::with_clock(buses, config, SystemClock::new())
    }
}

impl<C: Clock> DiagnosticsManager<C> {
    pub fn with_clock(buses: Vec<CanBus, MAX_CAN_BUSES>, config: ManagerConfig, clock: C) -> Self {
        let rng = Lcg::new(config.rng_seed);
        let obd2_bus = lookup_bus(config.obd2_bus, &buses).map(|index| buses[index].address());
        if obd2_bus.is_none() {
            warn!(
                "no bus at the configured OBD-II address {}",
                config.obd2_bus
            );
        }
        let mut manager = Self {
            buses,
            slots: core::array::from_fn(|_| None),
            free: Vec::new(),
            nonrecurring: Vec::new(),
            recurring: Vec::new(),
            obd2_bus,
            config,
            rng,
            clock,
            vin: None,
            previous_partial_frame: -1,
            initialized: false,
        };
        manager.reset();
        manager.initialized = true;
        debug!("initialized diagnostics");
        manager
    }

    /// Cancel every active request and return all slots to the free list.
    pub fn reset(&mut self) {
        if self.initialized {
            debug!("clearing existing diagnostic requests");
            self.cleanup_active_requests(true);
        }
        self.nonrecurring.clear();
        self.recurring.clear();
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            *slot = None;
            let _ = self.free.push(index);
        }
        debug!("reset diagnostics requests");
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bus(&self, address: u8) -> Option<&CanBus> {
        lookup_bus(address, &self.buses).map(|index| &self.buses[index])
    }

    pub fn bus_mut(&mut self, address: u8) -> Option<&mut CanBus> {
        lookup_bus(address, &self.buses).map(move |index| &mut self.buses[index])
    }

    pub fn buses(&self) -> &[CanBus] {
        &self.buses
    }

    /// The cached vehicle identification number, once a VIN query has
    /// completed.
    pub fn vin(&self) -> Option<&str> {
        self.vin.as_deref()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free.len()
    }

    pub fn active_request_count(&self) -> usize {
        self.nonrecurring.len() + self.recurring.len()
    }

    /// Recurring requests from the head of the queue (next candidate) to
    /// the tail.
    pub fn recurring_requests(&self) -> impl Iterator<Item = &ActiveRequest<C>> {
        self.recurring
            .iter()
            .filter_map(|&index| self.slots[index].as_ref())
    }

    pub fn one_shot_requests(&self) -> impl Iterator<Item = &ActiveRequest<C>> {
        self.nonrecurring
            .iter()
            .filter_map(|&index| self.slots[index].as_ref())
    }

    // ------------------------------------------------------------------
    // Admission and cancellation
    // ------------------------------------------------------------------

    /// Admit a one-shot request. It transmits on the next `send_requests`
    /// tick for its bus and completes on first response or timeout.
    pub fn add_one_shot(
        &mut self,
        bus_address: u8,
        request: DiagnosticRequest,
        options: RequestOptions<C>,
    ) -> Result<(), DiagnosticsError> {
        self.cleanup_active_requests(false);
        self.admit(bus_address, request, options, 0.0)
    }

    /// Admit a recurring request at `frequency_hz` (at most 10 Hz). New
    /// entries go to the head of the queue so they transmit first.
    pub fn add_recurring(
        &mut self,
        bus_address: u8,
        request: DiagnosticRequest,
        options: RequestOptions<C>,
        frequency_hz: f32,
    ) -> Result<(), DiagnosticsError> {
        if frequency_hz > crate::obd2::MAX_RECURRING_DIAGNOSTIC_FREQUENCY_HZ {
            debug!(
                "requested recurring diagnostic frequency {} is higher than the maximum of {}",
                frequency_hz,
                crate::obd2::MAX_RECURRING_DIAGNOSTIC_FREQUENCY_HZ
            );
            return Err(DiagnosticsError::FrequencyTooHigh);
        }
        self.cleanup_active_requests(false);
        if self.find_recurring(bus_address, &request).is_some() {
            debug!("can't add request, one already exists with the same key");
            return Err(DiagnosticsError::DuplicateRecurring);
        }
        self.admit(bus_address, request, options, frequency_hz)
    }

    /// Cancel the recurring request codec-equal to `request` on the bus.
    pub fn cancel_recurring(
        &mut self,
        bus_address: u8,
        request: &DiagnosticRequest,
    ) -> Result<(), DiagnosticsError> {
        match self.find_recurring(bus_address, request) {
            Some(position) => {
                let slot_index = self.recurring.remove(position);
                self.cancel_slot(slot_index);
                Ok(())
            }
            None => Err(DiagnosticsError::NoSuchRequest),
        }
    }

    /// Issue the directed VIN query on the configured OBD-II bus. The
    /// decoded VIN is cached on completion and served from `vin()`.
    pub fn request_vin(&mut self) -> Result<(), DiagnosticsError> {
        let bus_address = self
            .obd2_bus
            .ok_or(DiagnosticsError::UnknownBus(self.config.obd2_bus))?;
        self.add_one_shot(bus_address, vin_request(), RequestOptions::default())
    }

    fn admit(
        &mut self,
        bus_address: u8,
        request: DiagnosticRequest,
        options: RequestOptions<C>,
        frequency_hz: f32,
    ) -> Result<(), DiagnosticsError> {
        let bus_index =
            lookup_bus(bus_address, &self.buses).ok_or(DiagnosticsError::UnknownBus(bus_address))?;
        let Some(&slot_index) = self.free.last() else {
            debug!("unable to allocate space for a new diagnostic request");
            return Err(DiagnosticsError::PoolExhausted);
        };

        Self::install_filters(&mut self.buses[bus_index], &request)?;

        let handle = codec::generate_request(&request);
        let entry = ActiveRequest::new(bus_address, handle, options, frequency_hz);
        self.free.pop();
        self.slots[slot_index] = Some(entry);
        if frequency_hz != 0.0 {
            let _ = self.recurring.insert(0, slot_index);
            debug!(
                "added recurring diagnostic request (freq: {}) on bus {}: {}",
                frequency_hz,
                bus_address,
                codec::request_to_string(&request)
            );
        } else {
            let _ = self.nonrecurring.push(slot_index);
            debug!(
                "added one-time diagnostic request on bus {}: {}",
                bus_address,
                codec::request_to_string(&request)
            );
        }
        Ok(())
    }

    fn find_recurring(&self, bus_address: u8, request: &DiagnosticRequest) -> Option<usize> {
        self.recurring.iter().position(|&index| {
            self.slots[index].as_ref().is_some_and(|entry| {
                entry.bus == bus_address && codec::request_equals(&entry.handle.request, request)
            })
        })
    }

    /// Return a slot to the free list and drop one reference to each CAN
    /// filter it used.
    fn cancel_slot(&mut self, slot_index: usize) {
        if let Some(entry) = self.slots[slot_index].take() {
            if let Some(bus_index) = lookup_bus(entry.bus, &self.buses) {
                Self::release_filters(&mut self.buses[bus_index], entry.arbitration_id);
            }
            let _ = self.free.push(slot_index);
        }
    }

    /// Install the response filter(s) a request needs: the offset id for a
    /// directed request, the whole functional response range for a
    /// broadcast. Rolls back on partial failure.
    fn install_filters(bus: &mut CanBus, request: &DiagnosticRequest) -> Result<(), DiagnosticsError> {
        if request.arbitration_id == OBD2_FUNCTIONAL_BROADCAST_ID {
            for filter in OBD2_FUNCTIONAL_RESPONSE_START
                ..OBD2_FUNCTIONAL_RESPONSE_START + OBD2_FUNCTIONAL_RESPONSE_COUNT
            {
                if bus
                    .add_acceptance_filter(filter, CanMessageFormat::Standard)
                    .is_err()
                {
                    for installed in OBD2_FUNCTIONAL_RESPONSE_START..filter {
                        bus.remove_acceptance_filter(installed, CanMessageFormat::Standard);
                    }
                    debug!(
                        "couldn't add filters for functional broadcast 0x{:x} to bus {}",
                        request.arbitration_id,
                        bus.address()
                    );
                    return Err(DiagnosticsError::FilterCapacity);
                }
            }
            Ok(())
        } else {
            bus.add_acceptance_filter(
                request.arbitration_id + RESPONSE_ARBITRATION_ID_OFFSET,
                CanMessageFormat::Standard,
            )
            .map_err(|_| {
                debug!(
                    "couldn't add filter 0x{:x} to bus {}",
                    request.arbitration_id,
                    bus.address()
                );
                DiagnosticsError::FilterCapacity
            })
        }
    }

    fn release_filters(bus: &mut CanBus, arbitration_id: u32) {
        if arbitration_id == OBD2_FUNCTIONAL_BROADCAST_ID {
            for filter in OBD2_FUNCTIONAL_RESPONSE_START
                ..OBD2_FUNCTIONAL_RESPONSE_START + OBD2_FUNCTIONAL_RESPONSE_COUNT
            {
                bus.remove_acceptance_filter(filter, CanMessageFormat::Standard);
            }
        } else {
            bus.remove_acceptance_filter(
                arbitration_id + RESPONSE_ARBITRATION_ID_OFFSET,
                CanMessageFormat::Standard,
            );
        }
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Reap completed entries from both active collections: one-shots are
    /// cancelled, recurring entries rotate to the queue tail. `force`
    /// cancels everything unconditionally.
    pub(crate) fn cleanup_active_requests(&mut self, force: bool) {
        let now_ms = self.clock.now_ms();
        let snapshot: SlotList = self.nonrecurring.clone();
        for slot_index in snapshot {
            self.cleanup_one(slot_index, force, now_ms);
        }
        let snapshot: SlotList = self.recurring.clone();
        for slot_index in snapshot {
            self.cleanup_one(slot_index, force, now_ms);
        }
    }

    fn cleanup_one(&mut self, slot_index: usize, force: bool, now_ms: u64) {
        let (recurring, request_string) = {
            let Some(entry) = self.slots[slot_index].as_mut() else {
                return;
            };
            let completed = entry.in_flight && entry.completed(now_ms, &mut self.rng);
            if !(force || completed) {
                return;
            }
            entry.in_flight = false;
            (
                entry.recurring,
                codec::request_to_string(&entry.handle.request),
            )
        };

        if recurring {
            if let Some(position) = self.recurring.iter().position(|&index| index == slot_index) {
                self.recurring.remove(position);
            }
            if force {
                self.cancel_slot(slot_index);
            } else {
                debug!(
                    "moving completed recurring request to the back of the queue: {}",
                    request_string
                );
                let _ = self.recurring.push(slot_index);
            }
        } else {
            if let Some(position) = self
                .nonrecurring
                .iter()
                .position(|&index| index == slot_index)
            {
                self.nonrecurring.remove(position);
            }
            debug!(
                "cancelling completed, non-recurring request: {}",
                request_string
            );
            self.cancel_slot(slot_index);
        }
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// Transmit every due request targeting `bus_address`: one-shots first,
    /// then the recurring queue in FIFO order.
    pub fn send_requests(&mut self, bus_address: u8) {
        self.cleanup_active_requests(false);
        let snapshot: SlotList = self.nonrecurring.clone();
        for slot_index in snapshot {
            self.send_one(slot_index, bus_address);
        }
        let snapshot: SlotList = self.recurring.clone();
        for slot_index in snapshot {
            self.send_one(slot_index, bus_address);
        }
    }

    fn send_one(&mut self, slot_index: usize, bus_address: u8) {
        let now_ms = self.clock.now_ms();
        let should_send = {
            let Some(entry) = self.slots[slot_index].as_mut() else {
                return;
            };
            if entry.bus != bus_address || entry.in_flight {
                return;
            }
            if entry.recurring {
                // Recurring sends are jittered across the first period.
                entry.frequency_clock.elapsed(now_ms, true, &mut self.rng)
            } else {
                !entry.completed(now_ms, &mut self.rng)
            }
        };
        if !should_send || !self.clear_to_send(slot_index) {
            return;
        }

        let Some(bus_index) = lookup_bus(bus_address, &self.buses) else {
            return;
        };
        let buses = &mut self.buses;
        let Some(entry) = self.slots[slot_index].as_mut() else {
            return;
        };
        entry.frequency_clock.tick(now_ms);
        codec::start_request(&mut entry.handle, &mut buses[bus_index]);
        if entry.handle.completed && !entry.handle.success {
            debug!("fatal error sending diagnostic request");
        } else {
            entry.arm_timeout(now_ms);
            entry.in_flight = true;
        }
    }

    /// No other in-flight request may share this request's (bus,
    /// arbitration id) pair.
    fn clear_to_send(&self, slot_index: usize) -> bool {
        let Some(request) = self.slots[slot_index].as_ref() else {
            return false;
        };
        let conflicting = |&index: &usize| {
            index != slot_index
                && self.slots[index].as_ref().is_some_and(|candidate| {
                    candidate.in_flight
                        && candidate.bus == request.bus
                        && candidate.arbitration_id == request.arbitration_id
                })
        };
        !self.nonrecurring.iter().any(conflicting) && !self.recurring.iter().any(conflicting)
    }

    // ------------------------------------------------------------------
    // Frame dispatch
    // ------------------------------------------------------------------

    /// Fan an incoming frame out to every in-flight request on the bus and
    /// relay whatever completes.
    pub fn receive(&mut self, bus_address: u8, message: &CanMessage, pipeline: &mut Pipeline) {
        let snapshot: SlotList = self.recurring.clone();
        for slot_index in snapshot {
            self.receive_one(slot_index, bus_address, message, pipeline);
        }
        let snapshot: SlotList = self.nonrecurring.clone();
        for slot_index in snapshot {
            self.receive_one(slot_index, bus_address, message, pipeline);
        }
        self.cleanup_active_requests(false);
    }

    fn receive_one(
        &mut self,
        slot_index: usize,
        bus_address: u8,
        message: &CanMessage,
        pipeline: &mut Pipeline,
    ) {
        let now_ms = self.clock.now_ms();
        let Some(bus_index) = lookup_bus(bus_address, &self.buses) else {
            return;
        };

        let (response, transport_completed, transport_success) = {
            let buses = &mut self.buses;
            let Some(entry) = self.slots[slot_index].as_mut() else {
                return;
            };
            if entry.bus != bus_address || !entry.in_flight {
                return;
            }
            let response = codec::receive_can_frame(
                &mut entry.handle,
                &mut buses[bus_index],
                message.id,
                message.data(),
            );
            (response, entry.handle.completed, entry.handle.success)
        };

        if response.multi_frame {
            if self.config.multiframe_streaming {
                self.relay_partial_frame(slot_index, &response, pipeline);
            }
            if !response.completed {
                // The continuation is alive, give it another window.
                if let Some(entry) = self.slots[slot_index].as_mut() {
                    entry.timeout_clock.tick(now_ms);
                }
            } else if !self.config.multiframe_streaming {
                self.relay_response(slot_index, &response, pipeline);
            }
        } else if response.completed && transport_completed {
            if transport_success {
                self.relay_response(slot_index, &response, pipeline);
            } else {
                debug!("fatal error sending or receiving diagnostic request");
            }
        }
    }

    // ------------------------------------------------------------------
    // Response relay
    // ------------------------------------------------------------------

    fn relay_response(
        &mut self,
        slot_index: usize,
        response: &DiagnosticResponse,
        pipeline: &mut Pipeline,
    ) {
        let parsed_value = codec::payload_to_integer(response) as f32;
        let Some(entry) = self.slots[slot_index].as_ref() else {
            return;
        };

        let mut decoded = ArrayString::new();
        let has_decoder = entry.decoder.is_some();
        if let Some(decoder) = entry.decoder {
            decoder(response, parsed_value, &mut decoded);
        }

        let field = if response.multi_frame {
            if !has_decoder {
                for &byte in &response.payload {
                    if decoded.try_push(byte as char).is_err() {
                        break;
                    }
                }
            }
            SignalValue::Text(decoded)
        } else {
            if !has_decoder {
                let _ = core::fmt::write(&mut decoded, format_args!("{}", parsed_value));
            }
            SignalValue::Num(decoded.as_str().parse().unwrap_or(0.0))
        };

        if response.success && !entry.name.is_empty() {
            // A named request publishes just the value, no response details.
            match &field {
                SignalValue::Text(text) if !text.is_empty() => {
                    pipeline.publish_text(&entry.name, *text)
                }
                SignalValue::Text(_) => pipeline.publish_numeric(&entry.name, 0.0),
                SignalValue::Num(value) => pipeline.publish_numeric(&entry.name, *value),
            }
        } else {
            let message = Self::wrap_diagnostic_response(entry, response, field, has_decoder);
            pipeline.publish(VehicleMessage::Diagnostic(message));
        }

        if response.success
            && response.mode == MODE_VEHICLE_INFORMATION
            && response.pid == VIN_PID
        {
            if let Some(vin) = decode_vin(&response.payload) {
                debug!("decoded vehicle identification number: {}", vin);
                self.vin = Some(vin);
            }
        }

        if let Some(callback) = entry.callback {
            callback(self, entry, response, parsed_value);
        }
    }

    fn wrap_diagnostic_response(
        entry: &ActiveRequest<C>,
        response: &DiagnosticResponse,
        field: SignalValue,
        has_decoder: bool,
    ) -> DiagnosticMessage {
        // Directed responses arrive at the offset id; recover the module
        // address. Responses to a functional broadcast already carry the
        // responding module's own id.
        let message_id = if entry.arbitration_id != OBD2_FUNCTIONAL_BROADCAST_ID {
            response.arbitration_id - RESPONSE_ARBITRATION_ID_OFFSET
        } else {
            response.arbitration_id
        };

        let mut message = DiagnosticMessage {
            bus: entry.bus,
            message_id,
            mode: response.mode,
            pid: response.pid,
            success: response.success,
            negative_response_code: (!response.success)
                .then_some(response.negative_response_code),
            value: None,
            payload: heapless::Vec::new(),
        };
        if response.payload_length() > 0 {
            if has_decoder {
                message.value = Some(field);
            } else {
                let _ = message.payload.extend_from_slice(&response.payload);
            }
        }
        message
    }

    fn relay_partial_frame(
        &mut self,
        slot_index: usize,
        response: &DiagnosticResponse,
        pipeline: &mut Pipeline,
    ) {
        let Some(entry) = self.slots[slot_index].as_ref() else {
            return;
        };
        // -1 marks the last slice of the response.
        let frame = if response.completed {
            -1
        } else {
            self.previous_partial_frame + 1
        };
        self.previous_partial_frame = frame;

        let message = PartialFrameMessage {
            timestamp: self.clock.now_ms(),
            frame,
            message_id: response.arbitration_id,
            bus: entry.bus,
            total_size: 0,
            mode: response.mode,
            pid: response.pid,
            value: 0,
            success: response.negative_response_code == 0,
            negative_response_code: (response.negative_response_code != 0)
                .then_some(response.negative_response_code),
            payload: hex_payload(&response.payload),
        };
        pipeline.publish(VehicleMessage::Partial(message));

        if response.completed {
            if let Some(callback) = entry.callback {
                callback(self, entry, response, codec::payload_to_integer(response) as f32);
            }
        }
    }
}
