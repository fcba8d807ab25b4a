//! Tests for the device side dispatcher

mod common;

use common::*;

const DID: Did = Did::new(1, 2);

#[test]
fn test_command_answers_with_telemetry() {
    let mut dev = test_device(DID);
    let query = Frame::command(DID, Endpoint::Ep1, &[0xAA, 0x55]).unwrap();

    let response = dev.handle_frame(&query).expect("Command should be answered");
    assert_eq!(response.id, Id::response(FrameType::Telemetry, DID, Endpoint::Ep1));
    assert_eq!(response.payload(), &[1, TELEMETRY_MARKER]);
    assert_eq!(dev.api().commands, vec![(Endpoint::Ep1, vec![0xAA, 0x55])]);

    let system = dev.system();
    assert_eq!(system.received_total.get(), 1);
    assert_eq!(system.received_command.get(), 1);
    assert_eq!(system.sent_total.get(), 1);
    assert_eq!(system.sent_telemetry.get(), 1);
    assert_eq!(system.last_command_error.get(), 0);
}

#[test]
fn test_telemetry_query() {
    let mut dev = test_device(DID);
    let response = dev
        .handle_frame(&Frame::telemetry_query(DID, Endpoint::Ep2))
        .expect("Telemetry should be answered");
    assert_eq!(response.id, Id::response(FrameType::Telemetry, DID, Endpoint::Ep2));
    assert_eq!(response.payload(), &[2, TELEMETRY_MARKER]);
    assert_eq!(dev.system().received_request_telemetry.get(), 1);
    assert!(dev.api().commands.is_empty());
}

#[test]
fn test_broadcast_query_is_answered_with_own_did() {
    let mut dev = test_device(DID);
    let response = dev
        .handle_frame(&Frame::telemetry_query(Did::BROADCAST, Endpoint::App))
        .expect("Broadcast should be answered");
    assert_eq!(response.did(), DID);
}

#[test]
fn test_failed_command_reports_error() {
    let mut dev = test_device(DID);
    let query = Frame::command(DID, Endpoint::BoardControl, &[]).unwrap();

    let response = dev.handle_frame(&query).expect("Error frame expected");
    assert_eq!(response.id, Id::response(FrameType::Command, DID, Endpoint::BoardControl));
    assert_eq!(response.error(), Some((u32::from(ErrorCode::InvalidEndpoint), 0)));
    assert_eq!(dev.system().last_command_error.get(), 0x3A07);
    assert_eq!(dev.system().sent_telemetry.get(), 0);
}

#[test]
fn test_missing_handlers() {
    let mut dev = bare_device(DID);

    let response = dev
        .handle_frame(&Frame::command(DID, Endpoint::App, &[1]).unwrap())
        .expect("Error frame expected");
    assert_eq!(response.error(), Some((u32::from(ErrorCode::HandlerMissing), 0)));

    let response = dev
        .handle_frame(&Frame::telemetry_query(DID, Endpoint::App))
        .expect("Error frame expected");
    assert_eq!(response.id.frame_type, FrameType::Command);
    assert_eq!(response.error(), Some((u32::from(ErrorCode::HandlerMissing), 0)));
}

#[test]
fn test_read_identification_name() {
    let mut dev = test_device(DID);

    let response = dev
        .handle_frame(&Frame::read_attribute(DID, keys::NAME))
        .expect("Read should be answered");
    assert_eq!(response.id, Id::response(FrameType::ReadAttribute, DID, Endpoint::App));
    assert_eq!(response.attribute_key(), Some(keys::NAME));
    assert_eq!(response.attribute_value(), Some(u32::from_le_bytes(*b"test")));

    let response = dev.handle_frame(&Frame::read_attribute(DID, keys::NAME.with_part(2))).unwrap();
    assert_eq!(response.attribute_value(), Some(u32::from_le_bytes([b'e', 0, 0, 0])));

    assert_eq!(dev.read_attribute(keys::DID), Ok(DID.raw() as u32));
    assert_eq!(dev.read_attribute(keys::MAGIC_NUMBER), Ok(0xCAFE_F00D));
    assert_eq!(dev.system().received_read_attribute.get(), 2);
}

#[test]
fn test_write_read_only_attribute() {
    let mut dev = test_device(DID);
    let query = Frame::write_attribute(DID, keys::UPTIME, 1234);

    let response = dev.handle_frame(&query).expect("Error frame expected");
    assert_eq!(response.id, Id::response(FrameType::WriteAttribute, DID, Endpoint::App));
    assert_eq!(
        response.error(),
        Some((u32::from(ErrorCode::ReadOnly), keys::UPTIME.raw() as u32))
    );
    assert_eq!(dev.system().uptime.get(), 0, "Read-only attribute must not change");

    assert_eq!(dev.write_attribute(keys::DID, 0x3F), Err(Error::ReadOnly));
    assert_eq!(dev.did(), DID);
}

#[test]
fn test_unknown_attribute_keys() {
    let mut dev = bare_device(DID);

    let unknown_section = AttributeKey::new(0x5, 0, 0);
    let response = dev.handle_frame(&Frame::read_attribute(DID, unknown_section)).unwrap();
    assert_eq!(
        response.error(),
        Some((u32::from(ErrorCode::UnknownSection), unknown_section.raw() as u32))
    );

    assert_eq!(
        dev.read_attribute(AttributeKey::new(1, 0xF0, 0)),
        Err(Error::UnknownAttribute)
    );
    assert_eq!(dev.read_attribute(keys::NAME.with_part(8)), Err(Error::UnknownPart));
    assert_eq!(dev.write_attribute(keys::TIMEZONE.with_part(1), 0), Err(Error::UnknownPart));
}

#[test]
fn test_config_write_runs_hooks() {
    let mut dev = test_device(DID);
    let query = Frame::write_attribute(DID, keys::TELEMETRY_PERIOD, 15_000);

    let response = dev.handle_frame(&query).expect("Write should be answered");
    assert_eq!(response.id.frame_type, FrameType::ReadAttribute);
    assert_eq!(response.attribute_key(), Some(keys::TELEMETRY_PERIOD));
    assert_eq!(response.attribute_value(), Some(15_000));

    assert_eq!(dev.config().telemetry_period.get(), 15_000);
    assert_eq!(dev.api().config_writes, 1);
    // the read-back refreshes the section first
    assert_eq!(dev.api().config_reads, 1);
    assert_eq!(dev.system().received_write_attribute.get(), 1);
}

#[test]
fn test_rejected_config_write_is_rolled_back() {
    let mut dev = test_device(DID);
    dev.api_mut().reject_config = true;

    let query = Frame::write_attribute(DID, keys::TELEMETRY_PERIOD, 15_000);
    let response = dev.handle_frame(&query).expect("Error frame expected");
    assert!(response.id.is_error());
    assert_eq!(dev.config().telemetry_period.get(), 60_000, "Config must be restored");
    assert_eq!(dev.api().config_writes, 0);

    assert_eq!(dev.write_attribute(keys::TELEMETRY_DELAY, 9), Err(Error::Driver(-28)));
    assert_eq!(dev.config().telemetry_delay.get(), 5);
}

#[test]
fn test_narrow_config_write_truncates_value() {
    let mut dev = test_device(DID);
    dev.write_attribute(keys::TELEMETRY_DELAY_MAX, 0x0001_0200).unwrap();
    assert_eq!(dev.config().telemetry_delay_max.get(), 0x0200);
    assert_eq!(dev.read_attribute(keys::TELEMETRY_DELAY_MAX), Ok(0x0200));
}

#[test]
fn test_custom_attributes() {
    let mut dev = test_device(DID);
    let key = AttributeKey::new(0xF, 0x01, 0);

    assert_eq!(dev.read_attribute(key), Err(Error::NoSuchCustomAttribute));

    let response = dev.handle_frame(&Frame::write_attribute(DID, key, 7)).unwrap();
    assert_eq!(response.attribute_key(), Some(key));
    assert_eq!(response.attribute_value(), Some(7));
    assert_eq!(dev.api().custom.get(&key.raw()), Some(&7));
}

#[test]
fn test_error_response_disabled() {
    let mut dev = test_device(DID);
    dev.config_mut().set_error_response(false);

    let response = dev.handle_frame(&Frame::write_attribute(DID, keys::UPTIME, 1));
    assert!(response.is_none(), "No error frame when error responses are disabled");
    assert_eq!(dev.system().received_total.get(), 1);
    assert_eq!(dev.system().sent_total.get(), 0);
}

#[test]
fn test_frames_not_for_this_device_are_ignored() {
    let mut dev = test_device(DID);

    assert!(dev.handle_frame(&Frame::telemetry_query(Did::new(1, 3), Endpoint::App)).is_none());
    let response = Frame::telemetry_response(DID, Endpoint::App, &[]).unwrap();
    assert!(dev.handle_frame(&response).is_none());

    assert_eq!(dev.system().received_ignored.get(), 2);
    assert_eq!(dev.system().received_total.get(), 0);
}

#[test]
fn test_time_write_synchronizes_platform_clock() {
    let mut dev = test_device(DID);
    dev.config_mut().telemetry_period.set(0);

    let mut bus = MockBus::new();
    bus.now_ms = 10_000;
    bus.push_rx(Frame::write_attribute(DID, keys::TIME, 1_700_000_000));

    dev.process(&mut bus).unwrap();

    assert_eq!(bus.set_time_calls, vec![1_700_000_000]);
    assert_eq!(bus.sent.len(), 1);
    let (response, delay) = bus.sent[0];
    assert_eq!(delay, 0, "Unicast responses are sent immediately");
    assert_eq!(response.attribute_key(), Some(keys::TIME));
    assert_eq!(response.attribute_value(), Some(1_700_000_000));
    assert_eq!(dev.system().time.get(), 1_700_000_000);
    assert_eq!(dev.system().uptime.get(), 0);
}

#[test]
fn test_periodic_telemetry() {
    let mut dev = test_device(DID);
    dev.config_mut().set_telemetry_endpoint(Endpoint::Ep1);
    let mut bus = MockBus::new();

    // first telemetry is due right away
    dev.process(&mut bus).unwrap();
    let (frame, delay) = bus.sent.pop_front().expect("Periodic telemetry expected");
    assert_eq!(frame.id, Id::response(FrameType::Telemetry, DID, Endpoint::Ep1));
    assert_eq!(delay, 5);
    assert_eq!(dev.time_until_process(), 60_000);

    bus.advance(1_000);
    dev.process(&mut bus).unwrap();
    assert!(bus.sent.is_empty());
    assert_eq!(dev.time_until_process(), 59_000);

    bus.advance(59_000);
    dev.process(&mut bus).unwrap();
    assert_eq!(bus.sent.len(), 1);
    assert_eq!(dev.system().sent_telemetry.get(), 2);
}

#[test]
fn test_recv_failure_still_sends_due_telemetry() {
    let mut dev = test_device(DID);
    let mut bus = MockBus::new();
    bus.push_rx(Frame::telemetry_query(DID, Endpoint::Ep2));
    bus.fail_next_recv = true;

    assert_eq!(dev.process(&mut bus), Err(Error::Driver(-11)));
    let (frame, _) = bus.sent.pop_front().expect("Periodic telemetry expected");
    assert_eq!(frame.id, Id::response(FrameType::Telemetry, DID, Endpoint::App));
    assert!(bus.sent.is_empty());

    // the queued query is answered on the next poll
    dev.process(&mut bus).unwrap();
    let (frame, delay) = bus.sent.pop_front().expect("Telemetry response expected");
    assert_eq!(frame.id, Id::response(FrameType::Telemetry, DID, Endpoint::Ep2));
    assert_eq!(delay, 0);
}

#[test]
fn test_triggered_telemetry() {
    let mut dev = test_device(DID);
    dev.config_mut().telemetry_period.set(0);
    let mut bus = MockBus::new();

    dev.process(&mut bus).unwrap();
    assert!(bus.sent.is_empty(), "Periodic telemetry is disabled");
    assert_eq!(dev.time_until_process(), u32::MAX);

    dev.trigger_telemetry(Endpoint::Ep2);
    assert_eq!(dev.time_until_process(), 0);
    dev.process(&mut bus).unwrap();
    let frame = bus.take_sent().expect("Requested telemetry expected");
    assert_eq!(frame.id.endpoint, Endpoint::Ep2);
}

#[test]
fn test_broadcast_response_delay() {
    let mut dev = test_device(DID);
    dev.config_mut().telemetry_period.set(0);
    dev.config_mut().telemetry_delay_min.set(20);
    dev.config_mut().telemetry_delay_max.set(20);
    let mut bus = MockBus::new();

    bus.push_rx(Frame::telemetry_query(Did::BROADCAST, Endpoint::App));
    dev.process(&mut bus).unwrap();
    assert_eq!(bus.sent.pop_front().map(|(_, delay)| delay), Some(20));

    dev.config_mut().telemetry_delay_max.set(100);
    bus.entropy_byte = 0xFF;
    bus.push_rx(Frame::telemetry_query(Did::BROADCAST, Endpoint::App));
    dev.process(&mut bus).unwrap();
    let delay = bus.sent.pop_front().map(|(_, delay)| delay).unwrap();
    assert!((20..=100).contains(&delay), "Delay {} outside the configured bounds", delay);
}

#[test]
fn test_reset_counters() {
    let mut dev = test_device(DID);
    dev.handle_frame(&Frame::telemetry_query(DID, Endpoint::App));
    dev.handle_frame(&Frame::telemetry_query(Did::new(0, 0), Endpoint::App));
    dev.reset_counters();

    let system = dev.system();
    assert_eq!(system.received_total.get(), 0);
    assert_eq!(system.received_ignored.get(), 0);
    assert_eq!(system.sent_telemetry.get(), 0);
}
