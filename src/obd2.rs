//! OBD-II conventions: functional addressing constants, request
//! classification, and the built-in response decoders.

use arrayvec::ArrayString;

use crate::codec::{DiagnosticRequest, DiagnosticResponse};
use crate::request::MAX_DECODED_VALUE_LENGTH;

/// Functional broadcast address; solicits responses from every module.
pub const OBD2_FUNCTIONAL_BROADCAST_ID: u32 = 0x7DF;
/// First arbitration id modules respond from after a functional broadcast.
pub const OBD2_FUNCTIONAL_RESPONSE_START: u32 = 0x7E8;
pub const OBD2_FUNCTIONAL_RESPONSE_COUNT: u32 = 8;
/// Standard 11-bit offset between a directed request id and its response id.
pub const RESPONSE_ARBITRATION_ID_OFFSET: u32 = 0x8;
pub const MAX_RECURRING_DIAGNOSTIC_FREQUENCY_HZ: f32 = 10.0;

pub const MODE_CURRENT_DATA: u8 = 0x01;
pub const MODE_VEHICLE_INFORMATION: u8 = 0x09;
pub const MODE_ENHANCED_DATA: u8 = 0x22;

pub const VIN_PID: u16 = 0x02;
pub const VIN_LENGTH: usize = 17;
/// Engine control module, the usual target for directed OBD-II queries.
const ECM_ARBITRATION_ID: u32 = 0x7E0;

/// A request looks like standard OBD-II when it reads current data with a
/// one-byte PID.
pub fn is_obd2_request(request: &DiagnosticRequest) -> bool {
    request.mode == MODE_CURRENT_DATA && request.pid.is_some_and(|pid| pid <= 0xFF)
}

/// The directed VIN query (mode 0x09, PID 0x02 to the ECM).
pub fn vin_request() -> DiagnosticRequest {
    DiagnosticRequest::with_pid(ECM_ARBITRATION_ID, MODE_VEHICLE_INFORMATION, VIN_PID)
}

/// Pull the 17-character VIN out of a completed vehicle-information
/// response, skipping the leading report index byte.
pub fn decode_vin(payload: &[u8]) -> Option<ArrayString<VIN_LENGTH>> {
    let ascii: &[u8] = match payload.len() {
        len if len > VIN_LENGTH => &payload[len - VIN_LENGTH..],
        len if len == VIN_LENGTH => payload,
        _ => return None,
    };
    if !ascii.iter().all(|byte| byte.is_ascii_graphic()) {
        return None;
    }
    let mut vin = ArrayString::new();
    for &byte in ascii {
        vin.push(byte as char);
    }
    Some(vin)
}

/// Decoder used when the requester asked for no interpretation: multi-frame
/// payloads pass through as text, everything else as the parsed number.
pub fn passthrough_decoder(
    response: &DiagnosticResponse,
    parsed_value: f32,
    out: &mut ArrayString<MAX_DECODED_VALUE_LENGTH>,
) {
    if response.multi_frame {
        for &byte in &response.payload {
            if out.try_push(byte as char).is_err() {
                break;
            }
        }
    } else {
        let _ = core::fmt::write(out, format_args!("{}", parsed_value));
    }
}

/// Scale the raw reading of a handful of well-known mode 0x01 PIDs into
/// engineering units; unknown PIDs fall back to the raw value.
pub fn obd2_pid_decoder(
    response: &DiagnosticResponse,
    parsed_value: f32,
    out: &mut ArrayString<MAX_DECODED_VALUE_LENGTH>,
) {
    let value = match (response.mode, response.pid) {
        // Engine coolant temperature, degrees C
        (MODE_CURRENT_DATA, 0x05) => parsed_value - 40.0,
        // Engine speed, RPM
        (MODE_CURRENT_DATA, 0x0C) => parsed_value / 4.0,
        // Vehicle speed, km/h
        (MODE_CURRENT_DATA, 0x0D) => parsed_value,
        // Throttle position, percent
        (MODE_CURRENT_DATA, 0x11) => parsed_value * 100.0 / 255.0,
        // Fuel level, percent
        (MODE_CURRENT_DATA, 0x2F) => parsed_value * 100.0 / 255.0,
        _ => parsed_value,
    };
    let _ = core::fmt::write(out, format_args!("{}", value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_obd2_request() {
        assert!(is_obd2_request(&DiagnosticRequest::with_pid(
            0x7DF, 0x01, 0x0C
        )));
        assert!(!is_obd2_request(&DiagnosticRequest::new(0x7E0, 0x01)));
        assert!(!is_obd2_request(&DiagnosticRequest::with_pid(
            0x7E0, 0x22, 0xDE00
        )));
    }

    #[test]
    fn test_decode_vin_skips_report_index() {
        let mut payload = vec![0x01];
        payload.extend_from_slice(b"1FAHP88F53A123456");
        assert_eq!(
            decode_vin(&payload).unwrap().as_str(),
            "1FAHP88F53A123456"
        );
    }

    #[test]
    fn test_decode_vin_rejects_short_or_binary() {
        assert!(decode_vin(b"TOOSHORT").is_none());
        let mut payload = vec![0x01];
        payload.extend_from_slice(&[0x00; VIN_LENGTH]);
        assert!(decode_vin(&payload).is_none());
    }

    #[test]
    fn test_obd2_decoder_engine_speed() {
        let mut response = DiagnosticResponse {
            arbitration_id: 0x7E8,
            mode: 0x01,
            pid: 0x0C,
            completed: true,
            multi_frame: false,
            success: true,
            negative_response_code: 0,
            payload: heapless::Vec::new(),
        };
        response.payload.extend_from_slice(&[0x1A, 0xF8]).unwrap();

        let mut out = ArrayString::new();
        obd2_pid_decoder(&response, 0x1AF8 as f32, &mut out);
        assert_eq!(out.as_str(), "1726");
    }
}
