//! Synthesizes plausible diagnostic responses for a bounded set of request
//! ids, modes, and PIDs, without any bus I/O.

use tracing::debug;

use crate::clock::Lcg;
use crate::manager::DiagnosticsError;
use crate::obd2::{
    MODE_CURRENT_DATA, MODE_ENHANCED_DATA, MODE_VEHICLE_INFORMATION, OBD2_FUNCTIONAL_BROADCAST_ID,
    RESPONSE_ARBITRATION_ID_OFFSET,
};
use crate::pipeline::{DiagnosticMessage, SignalValue};

const SUPPORTED_ID_START: u32 = 0x701;
const SUPPORTED_ID_END: u32 = 0x7F1;
const RESERVED_IDS: [u32; 5] = [0x703, 0x750, 0x7B0, 0x7D7, 0x7F0];

const FUNCTIONAL_RESPONSE_LOW: u32 = 0x7E8;
const FUNCTIONAL_RESPONSE_HIGH: u32 = 0x7EF;

const NEGATIVE_RESPONSE_CODE_LOW: u32 = 0x10;
const NEGATIVE_RESPONSE_CODE_HIGH: u32 = 0xF1;
const MAX_EMULATED_VALUE: u32 = 0x1000;

pub fn is_supported_message_id(request_id: u32) -> bool {
    if !(SUPPORTED_ID_START..=SUPPORTED_ID_END).contains(&request_id) {
        debug!(
            "request id 0x{:x} is outside the range supported by the emulator (0x701 - 0x7f1)",
            request_id
        );
        return false;
    }
    if RESERVED_IDS.contains(&request_id) {
        debug!(
            "request id 0x{:x} is reserved and not supported by the emulator",
            request_id
        );
        return false;
    }
    true
}

pub fn is_supported_mode(mode: u8) -> bool {
    let supported = matches!(
        mode,
        MODE_CURRENT_DATA | MODE_VEHICLE_INFORMATION | MODE_ENHANCED_DATA
    );
    if !supported {
        debug!(
            "request mode 0x{:x} is not supported by the emulator (0x1, 0x9, 0x22)",
            mode
        );
    }
    supported
}

pub fn is_supported_pid(mode: u8, pid: u16) -> bool {
    let supported = match mode {
        MODE_CURRENT_DATA => pid <= 0xA6,
        MODE_VEHICLE_INFORMATION => pid <= 0x0B,
        MODE_ENHANCED_DATA => (0xDE00..=0xDEEF).contains(&pid),
        _ => false,
    };
    if !supported {
        debug!("mode 0x{:x} does not support pid 0x{:x}", mode, pid);
    }
    supported
}

/// Response id for an emulated request: the offset id, or a random module
/// in the functional response range for a broadcast.
pub fn emulated_message_id(rng: &mut Lcg, request_id: u32) -> u32 {
    if request_id == OBD2_FUNCTIONAL_BROADCAST_ID {
        rng.range_inclusive(FUNCTIONAL_RESPONSE_LOW, FUNCTIONAL_RESPONSE_HIGH)
    } else {
        request_id + RESPONSE_ARBITRATION_ID_OFFSET
    }
}

/// Validate the request against the emulator's supported ranges and
/// synthesize a response: a coin flip decides success, a successful reading
/// gets a random value, a failed one a random negative response code.
pub fn emulate_response(
    rng: &mut Lcg,
    bus_address: u8,
    request_id: u32,
    mode: u8,
    pid: u16,
) -> Result<DiagnosticMessage, DiagnosticsError> {
    if !is_supported_message_id(request_id) || !is_supported_mode(mode) || !is_supported_pid(mode, pid)
    {
        return Err(DiagnosticsError::UnsupportedEmulatorRequest);
    }

    let mut message = DiagnosticMessage {
        bus: bus_address,
        message_id: emulated_message_id(rng, request_id),
        mode,
        pid,
        success: rng.coin_flip(),
        negative_response_code: None,
        value: None,
        payload: heapless::Vec::new(),
    };
    if message.success {
        message.value = Some(SignalValue::Num(f64::from(
            rng.next_u32() % MAX_EMULATED_VALUE,
        )));
    } else {
        message.negative_response_code = Some(
            rng.range_inclusive(NEGATIVE_RESPONSE_CODE_LOW, NEGATIVE_RESPONSE_CODE_HIGH) as u8,
        );
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_range_and_reservations() {
        assert!(is_supported_message_id(0x702));
        assert!(!is_supported_message_id(0x703));
        assert!(!is_supported_message_id(0x700));
        assert!(!is_supported_message_id(0x7F2));
        assert!(is_supported_message_id(0x7F1));
        assert!(!is_supported_message_id(0x7F0));
    }

    #[test]
    fn test_mode_support() {
        assert!(is_supported_mode(0x01));
        assert!(!is_supported_mode(0x02));
        assert!(is_supported_mode(0x09));
        assert!(is_supported_mode(0x22));
    }

    #[test]
    fn test_pid_ranges_per_mode() {
        assert!(is_supported_pid(0x01, 0x00));
        assert!(is_supported_pid(0x01, 0xA6));
        assert!(!is_supported_pid(0x01, 0xA7));
        assert!(is_supported_pid(0x09, 0x0B));
        assert!(!is_supported_pid(0x09, 0x0C));
        assert!(is_supported_pid(0x22, 0xDEEF));
        assert!(!is_supported_pid(0x22, 0xDF00));
        assert!(!is_supported_pid(0x22, 0xDDFF));
    }

    #[test]
    fn test_broadcast_maps_to_functional_response_range() {
        let mut rng = Lcg::default();
        for _ in 0..64 {
            let id = emulated_message_id(&mut rng, 0x7DF);
            assert!((0x7E8..=0x7EF).contains(&id));
        }
        assert_eq!(emulated_message_id(&mut rng, 0x7E0), 0x7E8);
    }

    #[test]
    fn test_emulated_response_value_ranges() {
        let mut rng = Lcg::default();
        for _ in 0..64 {
            let message = emulate_response(&mut rng, 1, 0x7E0, 0x01, 0x20).unwrap();
            assert_eq!(message.message_id, 0x7E8);
            if message.success {
                match message.value {
                    Some(SignalValue::Num(value)) => {
                        assert!((0.0..f64::from(MAX_EMULATED_VALUE)).contains(&value))
                    }
                    other => panic!("expected a numeric value, got {:?}", other),
                }
            } else {
                let code = message.negative_response_code.unwrap();
                assert!((0x10..=0xF1).contains(&code));
            }
        }
    }

    #[test]
    fn test_unsupported_requests_are_rejected() {
        let mut rng = Lcg::default();
        assert!(emulate_response(&mut rng, 1, 0x703, 0x01, 0x00).is_err());
        assert!(emulate_response(&mut rng, 1, 0x7E0, 0x02, 0x00).is_err());
        assert!(emulate_response(&mut rng, 1, 0x7E0, 0x22, 0xDF00).is_err());
    }
}
