use arrayvec::ArrayString;

use crate::clock::{Clock, FrequencyClock, Lcg, SystemClock};
use crate::codec::{DiagnosticResponse, RequestHandle};
use crate::manager::DiagnosticsManager;

pub const MAX_GENERIC_NAME_LENGTH: usize = 40;
pub const MAX_DECODED_VALUE_LENGTH: usize = 128;

/// Response timeout window: 100 ms from the last transmission or
/// continuation frame.
const TIMEOUT_FREQUENCY_HZ: f32 = 10.0;

pub type SignalName = ArrayString<MAX_GENERIC_NAME_LENGTH>;

/// Turns a completed response into a text rendering of its value.
pub type ResponseDecoder =
    fn(&DiagnosticResponse, f32, &mut ArrayString<MAX_DECODED_VALUE_LENGTH>);

/// Notified after a response has been relayed. Runs synchronously inside
/// the receive path with a shared view of the manager, so callbacks can
/// inspect but never mutate manager state.
pub type ResponseCallback<C = SystemClock> =
    fn(&DiagnosticsManager<C>, &ActiveRequest<C>, &DiagnosticResponse, f32);

/// Optional attributes of an admitted request.
pub struct RequestOptions<C: Clock = SystemClock> {
    /// Publish completed responses as this named signal instead of a
    /// structured diagnostic message.
    pub name: Option<SignalName>,
    /// Stay in flight for the full timeout window and relay every response;
    /// used for functional broadcasts.
    pub wait_for_multiple_responses: bool,
    pub decoder: Option<ResponseDecoder>,
    pub callback: Option<ResponseCallback<C>>,
}

// Every field is copyable whatever the clock driver, so these impls skip
// the derive-imposed bound on `C`.
impl<C: Clock> Default for RequestOptions<C> {
    fn default() -> Self {
        Self {
            name: None,
            wait_for_multiple_responses: false,
            decoder: None,
            callback: None,
        }
    }
}

impl<C: Clock> Clone for RequestOptions<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Clock> Copy for RequestOptions<C> {}

/// One outstanding diagnostic interaction occupying a manager slot.
pub struct ActiveRequest<C: Clock = SystemClock> {
    pub(crate) bus: u8,
    pub(crate) arbitration_id: u32,
    pub(crate) handle: RequestHandle,
    pub(crate) name: SignalName,
    pub(crate) wait_for_multiple_responses: bool,
    pub(crate) decoder: Option<ResponseDecoder>,
    pub(crate) callback: Option<ResponseCallback<C>>,
    pub(crate) recurring: bool,
    pub(crate) frequency_clock: FrequencyClock,
    pub(crate) timeout_clock: FrequencyClock,
    pub(crate) in_flight: bool,
}

impl<C: Clock> ActiveRequest<C> {
    pub(crate) fn new(
        bus: u8,
        handle: RequestHandle,
        options: RequestOptions<C>,
        frequency_hz: f32,
    ) -> Self {
        Self {
            bus,
            arbitration_id: handle.request.arbitration_id,
            handle,
            name: options.name.unwrap_or_default(),
            wait_for_multiple_responses: options.wait_for_multiple_responses,
            decoder: options.decoder,
            callback: options.callback,
            recurring: frequency_hz != 0.0,
            frequency_clock: FrequencyClock::new(frequency_hz),
            timeout_clock: FrequencyClock::new(TIMEOUT_FREQUENCY_HZ),
            in_flight: false,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recurring(&self) -> bool {
        self.recurring
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn request(&self) -> &crate::codec::DiagnosticRequest {
        &self.handle.request
    }

    /// Restart the 100 ms response window after a transmission.
    pub(crate) fn arm_timeout(&mut self, now_ms: u64) {
        self.timeout_clock = FrequencyClock::new(TIMEOUT_FREQUENCY_HZ);
        self.timeout_clock.tick(now_ms);
    }

    /// A sufficient response has arrived. Broadcast-style requests wait out
    /// the whole timeout window instead.
    pub(crate) fn response_received(&self) -> bool {
        !self.wait_for_multiple_responses && self.handle.completed
    }

    // The timeout clock is deterministic, never staggered.
    pub(crate) fn timed_out(&mut self, now_ms: u64, rng: &mut Lcg) -> bool {
        self.timeout_clock.elapsed(now_ms, false, rng)
    }

    /// The request is done: answered, or sent and out of time.
    pub(crate) fn completed(&mut self, now_ms: u64, rng: &mut Lcg) -> bool {
        self.response_received() || (self.timed_out(now_ms, rng) && self.handle.request_sent)
    }
}
