//! Bulk-Only transport through a live session
//!
//! Each test scripts the device side with `MockBackend`, submits one or more
//! commands and checks both the final command and the frames on the wire.

use engine::test_utils::{
    Call, DEFAULT_TEST_TIMEOUT, Reply, mock_session, recv_within, sense_bytes,
};
use engine::{ControlRequest, DeviceSession, Protocol, TransferError};
use protocol::{
    Command, CommandSet, CommandStatus, CommandWrapper, CswStatus, DataBuffer, Direction,
    StatusWrapper, scsi,
};

fn passed(residue: u32) -> Reply {
    Reply::Csw {
        status: CswStatus::Passed,
        residue,
    }
}

fn run(session: &DeviceSession, cmd: Command) -> Command {
    let rx = session.submit(cmd).expect("session accepts command");
    recv_within(rx, DEFAULT_TEST_TIMEOUT).expect("command completes")
}

#[test]
fn test_read_10_good() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    let payload: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
    mock.push_all([Reply::Accept, Reply::Data(payload.clone()), passed(0)]);

    let done = run(
        &session,
        Command::read(&scsi::read_10(0x10, 1), 512).unwrap(),
    );

    assert_eq!(done.status, CommandStatus::Good);
    assert_eq!(done.residue, 0);
    assert_eq!(done.data.to_vec(), payload);
    assert!(done.sense.is_empty());

    let frames = mock.bulk_out_payloads();
    assert_eq!(frames.len(), 1);
    let cbw = CommandWrapper::decode(&frames[0]).unwrap();
    assert_eq!(cbw.data_transfer_length, 512);
    assert!(cbw.is_data_in());
    assert_eq!(cbw.cb_length, 10);
    assert_eq!(cbw.command_block(), &scsi::read_10(0x10, 1));
}

#[test]
fn test_tags_increment_and_lun_is_carried() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, passed(0), Reply::Accept, passed(0)]);

    run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    run(
        &session,
        Command::no_data(&scsi::test_unit_ready()).unwrap().with_lun(1),
    );

    let frames = mock.bulk_out_payloads();
    let first = CommandWrapper::decode(&frames[0]).unwrap();
    let second = CommandWrapper::decode(&frames[1]).unwrap();
    assert_eq!(second.tag, first.tag.wrapping_add(1));
    assert_eq!(first.lun, 0);
    assert_eq!(second.lun, 1);
}

#[test]
fn test_tag_mismatch_is_error() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    let wrong = StatusWrapper {
        tag: 0xdead_beef,
        residue: 0,
        status: CswStatus::Passed,
    }
    .encode();
    mock.push_all([Reply::Accept, Reply::Data(wrong.to_vec())]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Error);
    assert!(done.sense.is_empty());
}

#[test]
fn test_bad_signature_is_error() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    let mut frame = StatusWrapper {
        tag: 1,
        residue: 0,
        status: CswStatus::Passed,
    }
    .encode();
    frame[0] = b'X';
    mock.push_all([Reply::Accept, Reply::Data(frame.to_vec())]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Error);
}

#[test]
fn test_csw_stall_retried_once() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Fail(TransferError::Stall),
        passed(0),
    ]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Good);
    assert_eq!(mock.halts_cleared(), vec![0x81]);
}

#[test]
fn test_csw_stall_twice_is_error() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Fail(TransferError::Stall),
        Reply::Fail(TransferError::Stall),
    ]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Error);
    assert_eq!(mock.halts_cleared(), vec![0x81, 0x81]);
}

#[test]
fn test_zero_length_csw_retried() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Partial(0), passed(0)]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Good);
}

#[test]
fn test_phase_error_runs_reset_recovery() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Csw {
            status: CswStatus::PhaseError,
            residue: 0,
        },
    ]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::Error);

    let calls = mock.calls();
    let tail = &calls[calls.len() - 3..];
    assert_eq!(
        tail,
        &[
            Call::ControlOut {
                request: ControlRequest::class_out(0xff, 0),
                data: Vec::new(),
            },
            Call::ClearHalt(0x81),
            Call::ClearHalt(0x02),
        ]
    );
}

#[test]
fn test_data_stage_timeout_resets_instead_of_resending() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Fail(TransferError::Timeout)]);

    let done = run(
        &session,
        Command::write(&scsi::write_10(0, 8), vec![0xaa; 4096]).unwrap(),
    );
    assert_eq!(done.status, CommandStatus::Error);
    assert_eq!(done.residue, 4096);
    assert!(session.flags().timed_out);

    let calls = mock.calls();
    // CBW and one data submission, never a second copy of the payload
    assert_eq!(mock.bulk_out_payloads().len(), 2);
    assert_eq!(
        &calls[calls.len() - 3..],
        &[
            Call::ControlOut {
                request: ControlRequest::class_out(0xff, 0),
                data: Vec::new(),
            },
            Call::ClearHalt(0x81),
            Call::ClearHalt(0x02),
        ]
    );
}

#[test]
fn test_failed_reset_recovery_falls_back_to_port_reset() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Csw {
            status: CswStatus::PhaseError,
            residue: 0,
        },
        Reply::Fail(TransferError::Stall),
    ]);

    run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(mock.calls().last(), Some(&Call::ResetPort));
}

#[test]
fn test_failed_status_resolved_with_sense() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Csw {
            status: CswStatus::Failed,
            residue: 0,
        },
        Reply::Accept,
        Reply::Data(sense_bytes(0x02, 0x3a, 0x00)),
        passed(0),
    ]);

    let done = run(&session, Command::no_data(&scsi::test_unit_ready()).unwrap());
    assert_eq!(done.status, CommandStatus::CheckCondition);
    assert_eq!(done.sense.key_code(), 0x02);
    assert_eq!(done.sense.asc(), 0x3a);

    let sense_cbw = CommandWrapper::decode(&mock.bulk_out_payloads()[1]).unwrap();
    assert_eq!(sense_cbw.command_block()[0], scsi::REQUEST_SENSE);
    assert_eq!(sense_cbw.data_transfer_length, 18);
}

#[test]
fn test_larger_device_residue_recorded() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Accept, passed(12)]);

    let done = run(
        &session,
        Command::read(&scsi::read_10(0, 1), 512)
            .unwrap()
            .allow_short(),
    );
    // Producer opted into partial data, no sense needed
    assert_eq!(done.status, CommandStatus::Good);
    assert_eq!(done.residue, 12);
    assert_eq!(mock.bulk_out_payloads().len(), 1);
}

#[test]
fn test_short_read_10_senses_by_default() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Partial(100),
        passed(0),
        Reply::Accept,
        Reply::Data(sense_bytes(0x03, 0x11, 0x00)),
        passed(0),
    ]);

    let done = run(&session, Command::read(&scsi::read_10(0, 1), 512).unwrap());
    assert_eq!(done.status, CommandStatus::CheckCondition);
    assert_eq!(done.residue, 412);
    assert_eq!(done.sense.key_code(), 0x03);

    let sense_cbw = CommandWrapper::decode(&mock.bulk_out_payloads()[1]).unwrap();
    assert_eq!(sense_cbw.command_block()[0], scsi::REQUEST_SENSE);
}

#[test]
fn test_short_inquiry_is_tolerated() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Partial(36), passed(60)]);

    let done = run(&session, Command::read(&scsi::inquiry(96), 96).unwrap());
    assert_eq!(done.status, CommandStatus::Good);
    assert_eq!(done.residue, 60);
    assert_eq!(mock.bulk_out_payloads().len(), 1);
}

#[test]
fn test_intolerable_short_read_triggers_sense() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Partial(100),
        passed(412),
        Reply::Accept,
        Reply::Data(sense_bytes(0x03, 0x11, 0x00)),
        passed(0),
    ]);

    let done = run(
        &session,
        Command::read(&scsi::read_10(0, 1), 512)
            .unwrap()
            .require_exact_length(),
    );
    assert_eq!(done.status, CommandStatus::CheckCondition);
    assert_eq!(done.residue, 412);
    assert_eq!(done.sense.key_code(), 0x03);
}

#[test]
fn test_write_stall_stops_segments() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Fail(TransferError::Stall),
        Reply::Csw {
            status: CswStatus::Failed,
            residue: 1024,
        },
        Reply::Accept,
        Reply::Data(sense_bytes(0x07, 0x27, 0x00)),
        passed(0),
    ]);

    let cmd = Command::new(
        &scsi::write_10(0, 2),
        Direction::Out,
        DataBuffer::Segments(vec![vec![0xaa; 512], vec![0xbb; 512]]),
    )
    .unwrap();
    let done = run(&session, cmd);

    assert_eq!(done.status, CommandStatus::CheckCondition);
    assert_eq!(done.sense.key_code(), 0x07);
    assert_eq!(done.residue, 1024);
    assert!(mock.halts_cleared().contains(&0x02));

    // CBW, first segment, REQUEST SENSE CBW; never the second segment
    let payloads = mock.bulk_out_payloads();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[1], vec![0xaa; 512]);
    assert!(!payloads.contains(&vec![0xbb; 512]));
}
