//! Upstream control commands: translate add/cancel descriptors from the
//! command channel into request lifecycle operations.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::codec::{DiagnosticRequest, MAX_REQUEST_PAYLOAD};
use crate::emulator;
use crate::manager::{DiagnosticsError, DiagnosticsManager};
use crate::obd2::{
    is_obd2_request, obd2_pid_decoder, passthrough_decoder, OBD2_FUNCTIONAL_BROADCAST_ID,
};
use crate::pipeline::{Pipeline, VehicleMessage};
use crate::request::{RequestOptions, ResponseDecoder, SignalName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandAction {
    Add,
    Cancel,
}

/// How the requester wants response payloads interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DecodedType {
    /// Not specified; OBD-II-looking requests get the OBD-II decoder.
    #[default]
    Unused,
    /// No interpretation, pass the payload through.
    None,
    Obd2,
}

/// Request descriptor embedded in a control command. A `bus` of 0 means
/// "any": the first configured bus is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub bus: u8,
    #[serde(default)]
    pub message_id: u32,
    #[serde(default)]
    pub mode: u8,
    #[serde(default)]
    pub pid: Option<u16>,
    #[serde(default)]
    pub payload: heapless::Vec<u8, MAX_REQUEST_PAYLOAD>,
    #[serde(default)]
    pub name: Option<SignalName>,
    #[serde(default)]
    pub frequency_hz: f32,
    #[serde(default)]
    pub multiple_responses: Option<bool>,
    #[serde(default)]
    pub decoded_type: DecodedType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticControlCommand {
    pub action: CommandAction,
    pub request: CommandRequest,
}

impl DiagnosticControlCommand {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl<C: Clock> DiagnosticsManager<C> {
    /// Process one upstream control command.
    ///
    /// With emulation configured the bus is bypassed entirely and a
    /// synthesized response is published instead.
    pub fn handle_command(
        &mut self,
        command: &DiagnosticControlCommand,
        pipeline: &mut Pipeline,
    ) -> Result<(), DiagnosticsError> {
        let request = &command.request;
        if request.message_id == 0 || request.mode == 0 {
            debug!("diagnostic requests need at least an arbitration id and mode");
            return Err(DiagnosticsError::MissingRequestFields);
        }

        let bus_address = self.resolve_bus_address(request.bus)?;

        if self.config().emulated_data {
            let message = emulator::emulate_response(
                &mut self.rng,
                bus_address,
                request.message_id,
                request.mode,
                request.pid.unwrap_or(0),
            )?;
            pipeline.publish(VehicleMessage::Diagnostic(message));
            return Ok(());
        }

        let writable = self
            .bus(bus_address)
            .map(crate::bus::CanBus::raw_writable)
            .unwrap_or(false);
        if !writable {
            debug!("raw CAN writes not allowed for bus {}", bus_address);
            return Err(DiagnosticsError::BusNotWritable(bus_address));
        }

        let mut diagnostic_request = DiagnosticRequest::new(request.message_id, request.mode);
        diagnostic_request.pid = request.pid;
        diagnostic_request.payload = request.payload.clone();

        let decoder: Option<ResponseDecoder> = match request.decoded_type {
            DecodedType::None => Some(passthrough_decoder),
            DecodedType::Obd2 => Some(obd2_pid_decoder),
            DecodedType::Unused => {
                is_obd2_request(&diagnostic_request).then_some(obd2_pid_decoder as ResponseDecoder)
            }
        };

        // Functional broadcasts always wait for multiple responses; an
        // explicit true turns it on for directed requests too.
        let mut multiple_responses = request.message_id == OBD2_FUNCTIONAL_BROADCAST_ID;
        if request.multiple_responses == Some(true) {
            multiple_responses = true;
        }

        let options: RequestOptions<C> = RequestOptions {
            name: request.name,
            wait_for_multiple_responses: multiple_responses,
            decoder,
            callback: None,
        };

        match command.action {
            CommandAction::Add => {
                if request.frequency_hz != 0.0 {
                    self.add_recurring(
                        bus_address,
                        diagnostic_request,
                        options,
                        request.frequency_hz,
                    )
                } else {
                    self.add_one_shot(bus_address, diagnostic_request, options)
                }
            }
            CommandAction::Cancel => self.cancel_recurring(bus_address, &diagnostic_request),
        }
    }

    fn resolve_bus_address(&self, requested: u8) -> Result<u8, DiagnosticsError> {
        if let Some(bus) = self.bus(requested) {
            return Ok(bus.address());
        }
        if requested == 0 {
            if let Some(first) = self.buses().first() {
                debug!(
                    "no bus specified for diagnostic request, using first active: {}",
                    first.address()
                );
                return Ok(first.address());
            }
        }
        debug!("no active bus {} to send diagnostic request", requested);
        Err(DiagnosticsError::UnknownBus(requested))
    }
}
