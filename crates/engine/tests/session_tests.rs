//! Session lifecycle, abort and reset coordination

use engine::test_utils::{
    Call, DEFAULT_TEST_TIMEOUT, MockBackend, Reply, fast_config, mock_session, recv_within,
    sense_bytes, with_deadline,
};
use engine::{
    Completion, ControlRequest, CustomProtocol, DeviceBinding, DeviceKey, DeviceSession,
    EnqueueError, Endpoints, Link, Protocol, SessionConfig, SessionError, SessionRegistry,
    TransferError, WorkerState,
};
use protocol::{Command, CommandSet, CommandStatus, CswStatus, TransportResult, scsi};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn tur() -> Command {
    Command::no_data(&scsi::test_unit_ready()).unwrap()
}

fn passed() -> Reply {
    Reply::Csw {
        status: CswStatus::Passed,
        residue: 0,
    }
}

#[test]
fn test_abort_without_command_is_noop() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    session.abort().unwrap();
    assert_eq!(session.state(), WorkerState::Idle);
    assert!(mock.calls().is_empty());
    assert!(!mock.is_cancelled());
}

#[test]
fn test_second_command_rejected_while_busy() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Block]);

    let first = session.submit(tur()).unwrap();
    assert!(mock.wait_until_blocked(DEFAULT_TEST_TIMEOUT));
    assert_eq!(session.state(), WorkerState::Running);

    let err = session.submit(tur().with_lun(3)).unwrap_err();
    let EnqueueError::Busy(returned) = err else {
        panic!("expected Busy");
    };
    assert_eq!(returned.lun, 3);

    session.abort().unwrap();
    let done = recv_within(first, DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Aborted);
}

#[test]
fn test_abort_unblocks_in_flight_transfer() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Block]);

    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let completion = {
        let fired = fired.clone();
        Completion::new(move |cmd| {
            fired.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(cmd);
        })
    };
    session
        .enqueue(Command::read(&scsi::read_10(0, 8), 4096).unwrap(), completion)
        .unwrap();
    assert!(mock.wait_until_blocked(DEFAULT_TEST_TIMEOUT));

    session.abort().unwrap();
    assert_eq!(session.state(), WorkerState::Idle);
    assert!(!session.flags().aborting);

    let done = recv_within(rx, DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Aborted);
    assert!(done.sense.is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // No auto-sense after an abort
    assert_eq!(mock.bulk_out_payloads().len(), 1);

    // Cancellation is re-armed for the next command
    mock.push_all([Reply::Accept, passed()]);
    let next = recv_within(session.submit(tur()).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(next.status, CommandStatus::Good);
}

#[test]
fn test_reset_waits_for_running_command() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([
        Reply::Accept,
        Reply::Delayed(Duration::from_millis(150), Box::new(Reply::Accept)),
        passed(),
    ]);

    let rx = session
        .submit(Command::read(&scsi::read_10(0, 1), 512).unwrap())
        .unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(session.state(), WorkerState::Running);

    session.reset_device().unwrap();
    assert_eq!(session.state(), WorkerState::Idle);

    let done = recv_within(rx, DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Good);

    let calls = mock.calls();
    let csw_read = calls
        .iter()
        .rposition(|call| matches!(call, Call::BulkIn { len: 13, .. }))
        .unwrap();
    let reset_request = calls
        .iter()
        .position(|call| {
            matches!(call, Call::ControlOut { request, .. }
                if *request == ControlRequest::class_out(0xff, 0))
        })
        .unwrap();
    assert!(csw_read < reset_request);
    assert_eq!(mock.overlapping_calls(), 0);
}

#[test]
fn test_reset_never_overlaps_blocked_transfer() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Block]);

    let session = Arc::new(session);
    let rx = session
        .submit(Command::read(&scsi::read_10(0, 1), 512).unwrap())
        .unwrap();
    assert!(mock.wait_until_blocked(DEFAULT_TEST_TIMEOUT));

    let resetter = {
        let session = session.clone();
        thread::spawn(move || session.reset_device())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!resetter.is_finished());
    assert!(
        !mock
            .calls()
            .iter()
            .any(|call| matches!(call, Call::ControlOut { .. }))
    );
    // New work is refused while the reset is pending
    assert!(matches!(session.submit(tur()), Err(EnqueueError::Busy(_))));

    session.abort().unwrap();
    with_deadline(resetter, DEFAULT_TEST_TIMEOUT)
        .expect("reset finishes")
        .unwrap();

    let done = recv_within(rx, DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Aborted);
    assert_eq!(session.state(), WorkerState::Idle);
    assert_eq!(mock.overlapping_calls(), 0);
    assert_eq!(
        &mock.calls()[mock.calls().len() - 2..],
        &[Call::ClearHalt(0x81), Call::ClearHalt(0x02)]
    );
}

#[test]
fn test_reset_bus_refuses_shared_device() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.set_active_interfaces(2);
    assert!(matches!(
        session.reset_bus(),
        Err(SessionError::SharedDevice { interfaces: 2 })
    ));
    assert!(mock.calls().is_empty());

    mock.set_active_interfaces(1);
    session.reset_bus().unwrap();
    assert_eq!(mock.calls(), vec![Call::ResetPort]);
}

#[test]
fn test_failed_reset_reports_error_and_returns_idle() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push(Reply::Fail(TransferError::NoDevice));
    assert!(matches!(
        session.reset_device(),
        Err(SessionError::Reset(TransferError::NoDevice))
    ));
    assert_eq!(session.state(), WorkerState::Idle);
}

#[test]
fn test_timeout_sets_flag_until_next_command() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Fail(TransferError::Timeout)]);

    let done = recv_within(session.submit(tur()).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Error);
    assert!(session.flags().timed_out);

    mock.push_all([Reply::Accept, passed()]);
    recv_within(session.submit(tur()).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert!(!session.flags().timed_out);
}

#[test]
fn test_shutdown_aborts_in_flight_command() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Block]);

    let rx = session.submit(tur()).unwrap();
    assert!(mock.wait_until_blocked(DEFAULT_TEST_TIMEOUT));

    session.shutdown();
    assert!(session.flags().disconnecting);
    let done = recv_within(rx, DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Aborted);

    assert!(matches!(
        session.submit(tur()),
        Err(EnqueueError::Disconnected(_))
    ));
    assert!(matches!(
        session.reset_device(),
        Err(SessionError::Disconnected)
    ));
    // Second shutdown is a no-op
    session.shutdown();
}

#[test]
fn test_bind_queries_max_lun() {
    let mock = MockBackend::new();
    mock.push(Reply::Data(vec![0x01]));

    let config = SessionConfig {
        reset_settle_ms: 1,
        ..Default::default()
    };
    let session = DeviceSession::bind(
        DeviceBinding {
            key: DeviceKey::new(3, 7),
            endpoints: Endpoints::default(),
            protocol: Protocol::BulkOnly,
            command_set: CommandSet::Transparent,
        },
        mock.clone(),
        &config,
    )
    .unwrap();

    assert_eq!(session.max_lun(), 1);
    assert_eq!(session.protocol_name(), "Bulk-Only");
    assert_eq!(
        mock.calls(),
        vec![Call::ControlIn {
            request: ControlRequest::class_in(0xfe, 0),
            len: 1,
        }]
    );
}

/// Backend that answers every command itself and fails the first one
struct Scripted {
    executed: Arc<AtomicUsize>,
}

impl CustomProtocol for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&mut self, _link: &mut Link, cmd: &mut Command) -> TransportResult {
        let count = self.executed.fetch_add(1, Ordering::SeqCst);
        if cmd.opcode() == scsi::REQUEST_SENSE {
            let sense = sense_bytes(0x04, 0x44, 0x00);
            if let Some(segment) = cmd.data.segments_mut().first_mut() {
                segment.copy_from_slice(&sense);
            }
            return TransportResult::Good;
        }
        if cmd.opcode() == 0xee {
            panic!("device-specific failure");
        }
        if count == 0 {
            TransportResult::Failed
        } else {
            TransportResult::Good
        }
    }

    fn reset(&mut self, _link: &mut Link) -> Result<(), TransferError> {
        Ok(())
    }
}

#[test]
fn test_custom_protocol_dispatch_and_panic_isolation() {
    let executed = Arc::new(AtomicUsize::new(0));
    let protocol = Protocol::Custom(Box::new(Scripted {
        executed: executed.clone(),
    }));
    let (session, _mock) = mock_session(protocol, CommandSet::Transparent);
    assert_eq!(session.protocol_name(), "scripted");

    let done = recv_within(session.submit(tur()).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::CheckCondition);
    assert_eq!(done.sense.key_code(), 0x04);
    assert_eq!(executed.load(Ordering::SeqCst), 2);

    let boom = Command::no_data(&[0xee, 0, 0, 0, 0, 0]).unwrap();
    let done = recv_within(session.submit(boom).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Error);

    // The worker survives the panic
    let done = recv_within(session.submit(tur()).unwrap(), DEFAULT_TEST_TIMEOUT).unwrap();
    assert_eq!(done.status, CommandStatus::Good);
}

#[test]
fn test_registry_lifecycle() {
    let registry = SessionRegistry::new();
    let (first, _first_mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    let (duplicate, _dup_mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    let key = first.key();

    let session = registry.insert(first).unwrap();
    assert!(matches!(
        registry.insert(duplicate),
        Err(SessionError::AlreadyRegistered(k)) if k == key
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.keys(), vec![key]);
    assert!(registry.get(key).is_some());

    let removed = registry.remove(key).unwrap();
    assert!(removed.flags().disconnecting);
    assert!(session.flags().disconnecting);
    assert!(registry.is_empty());
    assert!(registry.remove(key).is_none());
}

#[test]
fn test_registry_shutdown_all() {
    let registry = SessionRegistry::new();
    let mock = MockBackend::new();
    for address in 1..=3 {
        let session = DeviceSession::bind(
            DeviceBinding {
                key: DeviceKey::new(1, address),
                endpoints: Endpoints::default(),
                protocol: Protocol::ControlBulk,
                command_set: CommandSet::Transparent,
            },
            mock.clone(),
            &fast_config(),
        )
        .unwrap();
        registry.insert(session).unwrap();
    }
    assert_eq!(registry.len(), 3);

    let kept = registry.get(DeviceKey::new(1, 2)).unwrap();
    registry.shutdown_all();
    assert!(registry.is_empty());
    assert_eq!(kept.state(), WorkerState::Idle);
    assert!(matches!(
        kept.submit(tur()),
        Err(EnqueueError::Disconnected(_))
    ));
}

#[tokio::test]
async fn test_submit_resolves_receiver() {
    let (session, mock) = mock_session(Protocol::BulkOnly, CommandSet::Transparent);
    mock.push_all([Reply::Accept, Reply::Data(vec![0x1f; 36]), passed()]);

    let rx = session
        .submit(Command::read(&scsi::inquiry(36), 36).unwrap())
        .unwrap();
    let done = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .expect("completion within timeout")
        .expect("completion delivered");
    assert_eq!(done.status, CommandStatus::Good);
    assert_eq!(done.data.to_vec(), vec![0x1f; 36]);
}
