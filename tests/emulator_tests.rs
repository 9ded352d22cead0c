use diagbus::pipeline::SignalValue;
use diagbus::testing::ManualClock;
use diagbus::{
    CanBus, CommandAction, CommandRequest, DecodedType, DiagnosticControlCommand,
    DiagnosticsError, DiagnosticsManager, ManagerConfig, Pipeline, VehicleMessage,
    MAX_SIMULTANEOUS_DIAG_REQUESTS,
};

fn emulating_manager() -> DiagnosticsManager<ManualClock> {
    let mut buses = heapless::Vec::new();
    let _ = buses.push(CanBus::new(1, true));
    let config = ManagerConfig {
        emulated_data: true,
        ..Default::default()
    };
    DiagnosticsManager::with_clock(buses, config, ManualClock::new())
}

fn add_command(message_id: u32, mode: u8, pid: u16) -> DiagnosticControlCommand {
    DiagnosticControlCommand {
        action: CommandAction::Add,
        request: CommandRequest {
            bus: 1,
            message_id,
            mode,
            pid: Some(pid),
            payload: heapless::Vec::new(),
            name: None,
            frequency_hz: 0.0,
            multiple_responses: None,
            decoded_type: DecodedType::Unused,
        },
    }
}

#[test]
fn test_emulated_response_shape() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    manager
        .handle_command(&add_command(0x7E0, 0x01, 0x20), &mut pipeline)
        .unwrap();

    match pipeline.pop().unwrap() {
        VehicleMessage::Diagnostic(message) => {
            assert_eq!(message.bus, 1);
            assert_eq!(message.message_id, 0x7E8);
            assert_eq!(message.mode, 0x01);
            assert_eq!(message.pid, 0x20);
            if message.success {
                match message.value {
                    Some(SignalValue::Num(value)) => assert!((0.0..4096.0).contains(&value)),
                    other => panic!("expected a numeric value, got {:?}", other),
                }
                assert_eq!(message.negative_response_code, None);
            } else {
                let code = message.negative_response_code.unwrap();
                assert!((0x10..=0xF1).contains(&code));
                assert_eq!(message.value, None);
            }
        }
        other => panic!("expected a diagnostic message, got {:?}", other),
    }
}

#[test]
fn test_emulation_never_touches_the_bus() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    manager
        .handle_command(&add_command(0x7E0, 0x01, 0x20), &mut pipeline)
        .unwrap();

    assert_eq!(manager.bus(1).unwrap().tx_queue_len(), 0);
    assert_eq!(manager.bus(1).unwrap().filter_count(), 0);
    assert_eq!(manager.active_request_count(), 0);
    assert_eq!(manager.free_slot_count(), MAX_SIMULTANEOUS_DIAG_REQUESTS);
}

#[test]
fn test_broadcast_picks_a_functional_responder() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    for _ in 0..16 {
        manager
            .handle_command(&add_command(0x7DF, 0x01, 0x00), &mut pipeline)
            .unwrap();
        match pipeline.pop().unwrap() {
            VehicleMessage::Diagnostic(message) => {
                assert!((0x7E8..=0x7EF).contains(&message.message_id));
            }
            other => panic!("expected a diagnostic message, got {:?}", other),
        }
    }
}

#[test]
fn test_reserved_and_out_of_range_ids_rejected() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    assert_eq!(
        manager.handle_command(&add_command(0x703, 0x01, 0x00), &mut pipeline),
        Err(DiagnosticsError::UnsupportedEmulatorRequest)
    );
    manager
        .handle_command(&add_command(0x702, 0x01, 0x00), &mut pipeline)
        .unwrap();
    assert_eq!(
        manager.handle_command(&add_command(0x6FF, 0x01, 0x00), &mut pipeline),
        Err(DiagnosticsError::UnsupportedEmulatorRequest)
    );
    // Nothing is published for a rejected request.
    assert_eq!(pipeline.len(), 1);
}

#[test]
fn test_unsupported_mode_rejected() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    assert_eq!(
        manager.handle_command(&add_command(0x7E0, 0x02, 0x00), &mut pipeline),
        Err(DiagnosticsError::UnsupportedEmulatorRequest)
    );
    assert!(pipeline.is_empty());
}

#[test]
fn test_enhanced_data_pid_boundaries() {
    let mut manager = emulating_manager();
    let mut pipeline = Pipeline::new();

    manager
        .handle_command(&add_command(0x7E0, 0x22, 0xDEEF), &mut pipeline)
        .unwrap();
    assert_eq!(
        manager.handle_command(&add_command(0x7E0, 0x22, 0xDF00), &mut pipeline),
        Err(DiagnosticsError::UnsupportedEmulatorRequest)
    );
}
