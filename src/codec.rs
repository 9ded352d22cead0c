//! Shim binding to the UDS/ISO-TP protocol codec.
//!
//! The manager consumes the codec through a handful of operations: generate
//! a request handle, start it on the wire, feed it incoming frames, and
//! interpret the assembled payload. Frames go out through the [`FrameWriter`]
//! seam so the codec never needs to know which bus it is bound to.

use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::FrameWriter;
use crate::obd2::{
    OBD2_FUNCTIONAL_BROADCAST_ID, OBD2_FUNCTIONAL_RESPONSE_COUNT, OBD2_FUNCTIONAL_RESPONSE_START,
    RESPONSE_ARBITRATION_ID_OFFSET,
};

pub const MAX_REQUEST_PAYLOAD: usize = 6;
pub const MAX_RESPONSE_PAYLOAD: usize = 256;

/// UDS positive responses echo the request mode plus this offset.
const MODE_RESPONSE_OFFSET: u8 = 0x40;
/// Service id of a UDS negative response.
const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// ISO-TP protocol control information, high nibble of the first byte.
const PCI_SINGLE_FRAME: u8 = 0x0;
const PCI_FIRST_FRAME: u8 = 0x1;
const PCI_CONSECUTIVE_FRAME: u8 = 0x2;
/// Flow control frame: continue-to-send, no block limit, no separation time.
const FLOW_CONTROL_CONTINUE: [u8; 3] = [0x30, 0x00, 0x00];

/// One diagnostic request as handed to the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    pub arbitration_id: u32,
    pub mode: u8,
    pub pid: Option<u16>,
    pub payload: Vec<u8, MAX_REQUEST_PAYLOAD>,
}

impl DiagnosticRequest {
    pub fn new(arbitration_id: u32, mode: u8) -> Self {
        Self {
            arbitration_id,
            mode,
            pid: None,
            payload: Vec::new(),
        }
    }

    pub fn with_pid(arbitration_id: u32, mode: u8, pid: u16) -> Self {
        Self {
            pid: Some(pid),
            ..Self::new(arbitration_id, mode)
        }
    }

    /// Width of the PID field on the wire. Enhanced-data reads (mode 0x22)
    /// use 16-bit data identifiers.
    fn pid_length(&self) -> usize {
        match self.pid {
            None => 0,
            Some(pid) if self.mode == 0x22 || pid > 0xFF => 2,
            Some(_) => 1,
        }
    }
}

/// Two requests address the same interaction when their arbitration id,
/// mode, and PID agree; the free-form payload does not participate.
pub fn request_equals(a: &DiagnosticRequest, b: &DiagnosticRequest) -> bool {
    a.arbitration_id == b.arbitration_id && a.mode == b.mode && a.pid == b.pid
}

/// Debug rendering of a request, e.g. `arb_id: 0x7df, mode: 0x1, pid: 0x2`.
pub fn request_to_string(request: &DiagnosticRequest) -> ArrayString<64> {
    let mut out = ArrayString::new();
    let _ = core::fmt::write(
        &mut out,
        format_args!(
            "arb_id: 0x{:x}, mode: 0x{:x}",
            request.arbitration_id, request.mode
        ),
    );
    if let Some(pid) = request.pid {
        let _ = core::fmt::write(&mut out, format_args!(", pid: 0x{:x}", pid));
    }
    out
}

#[derive(Debug, Clone, Default)]
struct IsotpAssembly {
    in_progress: bool,
    expected_size: usize,
    next_sequence: u8,
    buffer: Vec<u8, MAX_RESPONSE_PAYLOAD>,
}

impl IsotpAssembly {
    fn reset(&mut self) {
        self.in_progress = false;
        self.expected_size = 0;
        self.next_sequence = 0;
        self.buffer.clear();
    }
}

/// Codec state for one outstanding request: the serialized request, the
/// multi-frame assembly buffer, and the transport flags the manager's
/// completion predicates read.
///
/// `success` tracks the transport outcome; a negative response is still a
/// transport success and is reported through [`DiagnosticResponse`].
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub request: DiagnosticRequest,
    pub completed: bool,
    pub success: bool,
    pub request_sent: bool,
    assembly: IsotpAssembly,
}

/// Decoded outcome of feeding one CAN frame to a request's codec state.
///
/// `completed == false && multi_frame == false` means the frame was not for
/// this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResponse {
    pub arbitration_id: u32,
    pub mode: u8,
    pub pid: u16,
    pub completed: bool,
    pub multi_frame: bool,
    pub success: bool,
    pub negative_response_code: u8,
    pub payload: Vec<u8, MAX_RESPONSE_PAYLOAD>,
}

impl DiagnosticResponse {
    fn inert(arbitration_id: u32) -> Self {
        Self {
            arbitration_id,
            mode: 0,
            pid: 0,
            completed: false,
            multi_frame: false,
            success: false,
            negative_response_code: 0,
            payload: Vec::new(),
        }
    }

    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }
}

/// Build the codec state for a request without touching the wire.
pub fn generate_request(request: &DiagnosticRequest) -> RequestHandle {
    RequestHandle {
        request: request.clone(),
        completed: false,
        success: false,
        request_sent: false,
        assembly: IsotpAssembly::default(),
    }
}

/// Encode and enqueue the request frame.
///
/// Resets the handle's transport state, so a recurring request can restart
/// the same handle each period. An unencodable request or a rejected frame
/// marks the handle completed-without-success; the caller treats that as a
/// fatal transmission error.
pub fn start_request(handle: &mut RequestHandle, writer: &mut impl FrameWriter) {
    handle.completed = false;
    handle.success = false;
    handle.request_sent = false;
    handle.assembly.reset();

    let request = &handle.request;
    let content_length = 1 + request.pid_length() + request.payload.len();
    if content_length > 7 {
        debug!(
            "request does not fit a single frame: {}",
            request_to_string(request)
        );
        handle.completed = true;
        return;
    }

    let mut frame = [0u8; 8];
    frame[0] = content_length as u8;
    frame[1] = request.mode;
    let mut offset = 2;
    if let Some(pid) = request.pid {
        if request.pid_length() == 2 {
            frame[offset] = (pid >> 8) as u8;
            frame[offset + 1] = pid as u8;
            offset += 2;
        } else {
            frame[offset] = pid as u8;
            offset += 1;
        }
    }
    frame[offset..offset + request.payload.len()].copy_from_slice(&request.payload);

    if writer.send_frame(request.arbitration_id, &frame) {
        handle.request_sent = true;
    } else {
        handle.completed = true;
    }
}

/// True when `arbitration_id` is a plausible response id for the request:
/// the point-to-point offset id, or any id in the functional response range
/// for a broadcast request.
fn matches_response_id(request: &DiagnosticRequest, arbitration_id: u32) -> bool {
    if request.arbitration_id == OBD2_FUNCTIONAL_BROADCAST_ID {
        (OBD2_FUNCTIONAL_RESPONSE_START
            ..OBD2_FUNCTIONAL_RESPONSE_START + OBD2_FUNCTIONAL_RESPONSE_COUNT)
            .contains(&arbitration_id)
    } else {
        arbitration_id == request.arbitration_id + RESPONSE_ARBITRATION_ID_OFFSET
    }
}

/// Feed one incoming CAN frame to a request's codec state.
///
/// Multi-frame first frames trigger an immediate flow-control reply through
/// `writer`. The returned response reports per-frame progress; the handle's
/// flags track the overall transport outcome.
pub fn receive_can_frame(
    handle: &mut RequestHandle,
    writer: &mut impl FrameWriter,
    arbitration_id: u32,
    data: &[u8],
) -> DiagnosticResponse {
    if !matches_response_id(&handle.request, arbitration_id) || data.is_empty() {
        return DiagnosticResponse::inert(arbitration_id);
    }

    match data[0] >> 4 {
        PCI_SINGLE_FRAME => {
            let length = (data[0] & 0x0F) as usize;
            if length == 0 || data.len() < 1 + length {
                return DiagnosticResponse::inert(arbitration_id);
            }
            single_frame_response(handle, arbitration_id, &data[1..1 + length])
        }
        PCI_FIRST_FRAME => {
            if data.len() < 2 {
                return DiagnosticResponse::inert(arbitration_id);
            }
            let total = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
            if total > MAX_RESPONSE_PAYLOAD {
                debug!(
                    "multi-frame response of {} bytes is larger than the assembly buffer",
                    total
                );
                return DiagnosticResponse::inert(arbitration_id);
            }
            handle.assembly.reset();
            handle.assembly.in_progress = true;
            handle.assembly.expected_size = total;
            handle.assembly.next_sequence = 1;
            let _ = handle.assembly.buffer.extend_from_slice(&data[2..]);

            writer.send_frame(handle.request.arbitration_id, &FLOW_CONTROL_CONTINUE);

            let mut response = DiagnosticResponse::inert(arbitration_id);
            response.multi_frame = true;
            response.mode = handle.request.mode;
            response.pid = handle.request.pid.unwrap_or(0);
            let _ = response.payload.extend_from_slice(&data[2..]);
            response
        }
        PCI_CONSECUTIVE_FRAME => {
            if !handle.assembly.in_progress {
                return DiagnosticResponse::inert(arbitration_id);
            }
            let sequence = data[0] & 0x0F;
            if sequence != handle.assembly.next_sequence {
                debug!(
                    "out-of-order consecutive frame: expected {}, got {}",
                    handle.assembly.next_sequence, sequence
                );
                return DiagnosticResponse::inert(arbitration_id);
            }
            handle.assembly.next_sequence = (handle.assembly.next_sequence + 1) & 0x0F;

            let remaining = handle
                .assembly
                .expected_size
                .saturating_sub(handle.assembly.buffer.len());
            let take = remaining.min(data.len() - 1);
            let _ = handle.assembly.buffer.extend_from_slice(&data[1..1 + take]);

            if handle.assembly.buffer.len() >= handle.assembly.expected_size {
                let content: Vec<u8, MAX_RESPONSE_PAYLOAD> = handle.assembly.buffer.clone();
                handle.assembly.reset();
                let mut response = single_frame_response(handle, arbitration_id, &content);
                response.multi_frame = true;
                response
            } else {
                let mut response = DiagnosticResponse::inert(arbitration_id);
                response.multi_frame = true;
                response.mode = handle.request.mode;
                response.pid = handle.request.pid.unwrap_or(0);
                let _ = response.payload.extend_from_slice(&data[1..1 + take]);
                response
            }
        }
        _ => DiagnosticResponse::inert(arbitration_id),
    }
}

/// Interpret an assembled UDS content block (single frame body or completed
/// multi-frame buffer).
fn single_frame_response(
    handle: &mut RequestHandle,
    arbitration_id: u32,
    content: &[u8],
) -> DiagnosticResponse {
    let mut response = DiagnosticResponse::inert(arbitration_id);
    if content.is_empty() {
        return response;
    }

    if content[0] == NEGATIVE_RESPONSE_SID {
        if content.len() < 3 {
            return response;
        }
        response.mode = content[1];
        response.pid = handle.request.pid.unwrap_or(0);
        response.negative_response_code = content[2];
        response.completed = true;
        handle.completed = true;
        handle.success = true;
        return response;
    }

    if content[0] != handle.request.mode.wrapping_add(MODE_RESPONSE_OFFSET) {
        return DiagnosticResponse::inert(arbitration_id);
    }
    response.mode = content[0] - MODE_RESPONSE_OFFSET;

    let mut offset = 1;
    if let Some(pid) = handle.request.pid {
        let width = handle.request.pid_length();
        if content.len() < offset + width {
            return DiagnosticResponse::inert(arbitration_id);
        }
        let echoed = if width == 2 {
            (u16::from(content[offset]) << 8) | u16::from(content[offset + 1])
        } else {
            u16::from(content[offset])
        };
        if echoed != pid {
            return DiagnosticResponse::inert(arbitration_id);
        }
        response.pid = echoed;
        offset += width;
    }

    let _ = response.payload.extend_from_slice(&content[offset..]);
    response.completed = true;
    response.success = true;
    handle.completed = true;
    handle.success = true;
    response
}

/// Big-endian interpretation of the payload; payloads longer than eight
/// bytes contribute their leading bytes only.
pub fn payload_to_integer(response: &DiagnosticResponse) -> u64 {
    response
        .payload
        .iter()
        .take(8)
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingWriter(std::vec::Vec<(u32, std::vec::Vec<u8>)>);

    impl FrameWriter for RecordingWriter {
        fn send_frame(&mut self, id: u32, payload: &[u8]) -> bool {
            self.0.push((id, payload.to_vec()));
            true
        }
    }

    struct RejectingWriter;

    impl FrameWriter for RejectingWriter {
        fn send_frame(&mut self, _id: u32, _payload: &[u8]) -> bool {
            false
        }
    }

    fn engine_rpm_request() -> DiagnosticRequest {
        DiagnosticRequest::with_pid(0x7E0, 0x01, 0x0C)
    }

    #[test]
    fn test_start_encodes_single_frame() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut writer);

        assert!(handle.request_sent);
        assert!(!handle.completed);
        let (id, frame) = &writer.0[0];
        assert_eq!(*id, 0x7E0);
        assert_eq!(&frame[..3], &[0x02, 0x01, 0x0C]);
    }

    #[test]
    fn test_start_failure_marks_fatal() {
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut RejectingWriter);
        assert!(handle.completed);
        assert!(!handle.success);
        assert!(!handle.request_sent);
    }

    #[test]
    fn test_mode_22_uses_wide_pid() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&DiagnosticRequest::with_pid(0x7E0, 0x22, 0xDE05));
        start_request(&mut handle, &mut writer);
        let (_, frame) = &writer.0[0];
        assert_eq!(&frame[..4], &[0x03, 0x22, 0xDE, 0x05]);
    }

    #[test]
    fn test_single_frame_round_trip() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut writer);

        let response = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7E8,
            &[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0],
        );
        assert!(response.completed);
        assert!(response.success);
        assert!(!response.multi_frame);
        assert_eq!(response.mode, 0x01);
        assert_eq!(response.pid, 0x0C);
        assert_eq!(response.payload.as_slice(), &[0x1A, 0xF8]);
        assert_eq!(payload_to_integer(&response), 0x1AF8);
        assert!(handle.completed && handle.success);
    }

    #[test]
    fn test_negative_response() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut writer);

        let response =
            receive_can_frame(&mut handle, &mut writer, 0x7E8, &[0x03, 0x7F, 0x01, 0x12]);
        assert!(response.completed);
        assert!(!response.success);
        assert_eq!(response.negative_response_code, 0x12);
        assert_eq!(response.mode, 0x01);
        // A negative response is still a transport success.
        assert!(handle.completed && handle.success);
    }

    #[test]
    fn test_frame_for_other_arbitration_id_is_inert() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut writer);

        let response = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7E9,
            &[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0],
        );
        assert!(!response.completed);
        assert!(!response.multi_frame);
        assert!(!handle.completed);
    }

    #[test]
    fn test_broadcast_accepts_functional_response_range() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&DiagnosticRequest::with_pid(0x7DF, 0x01, 0x00));
        start_request(&mut handle, &mut writer);

        let response = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7EB,
            &[0x06, 0x41, 0x00, 0xBE, 0x3E, 0xB8, 0x11, 0],
        );
        assert!(response.completed);
        assert_eq!(response.arbitration_id, 0x7EB);
    }

    #[test]
    fn test_multi_frame_reassembly_with_flow_control() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&DiagnosticRequest::with_pid(0x7E0, 0x09, 0x02));
        start_request(&mut handle, &mut writer);
        writer.0.clear();

        // VIN response: 49 02 01 then 17 ASCII characters, 20 bytes total.
        let first = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7E8,
            &[0x10, 0x14, 0x49, 0x02, 0x01, b'1', b'F', b'A'],
        );
        assert!(first.multi_frame);
        assert!(!first.completed);
        // Flow control goes back to the request arbitration id.
        assert_eq!(writer.0[0].0, 0x7E0);
        assert_eq!(&writer.0[0].1[..1], &[0x30]);

        let middle = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7E8,
            &[0x21, b'H', b'P', b'8', b'8', b'F', b'5', b'3'],
        );
        assert!(middle.multi_frame && !middle.completed);

        let last = receive_can_frame(
            &mut handle,
            &mut writer,
            0x7E8,
            &[0x22, b'A', b'1', b'2', b'3', b'4', b'5', b'6'],
        );
        assert!(last.multi_frame);
        assert!(last.completed);
        assert!(last.success);
        assert_eq!(last.mode, 0x09);
        assert_eq!(last.pid, 0x02);
        assert_eq!(last.payload.as_slice(), b"\x011FAHP88F53A123456");
        assert!(handle.completed && handle.success);
    }

    #[test]
    fn test_consecutive_frame_without_first_is_ignored() {
        let mut writer = RecordingWriter(vec![]);
        let mut handle = generate_request(&engine_rpm_request());
        start_request(&mut handle, &mut writer);

        let response =
            receive_can_frame(&mut handle, &mut writer, 0x7E8, &[0x21, 1, 2, 3, 4, 5, 6, 7]);
        assert!(!response.completed);
        assert!(!response.multi_frame);
    }

    #[test]
    fn test_request_equals_ignores_payload() {
        let mut a = DiagnosticRequest::with_pid(0x7E0, 0x01, 0x0C);
        let b = DiagnosticRequest::with_pid(0x7E0, 0x01, 0x0C);
        a.payload.extend_from_slice(&[1, 2]).unwrap();
        assert!(request_equals(&a, &b));
        assert!(!request_equals(
            &a,
            &DiagnosticRequest::with_pid(0x7E1, 0x01, 0x0C)
        ));
    }

    #[test]
    fn test_request_to_string() {
        let request = DiagnosticRequest::with_pid(0x7DF, 0x01, 0x02);
        assert_eq!(
            request_to_string(&request).as_str(),
            "arb_id: 0x7df, mode: 0x1, pid: 0x2"
        );
    }
}
