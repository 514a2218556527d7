//! Bulk data phase shared by every built-in protocol
//!
//! Walks the command's payload segment by segment on the bulk endpoint
//! matching its direction. A stall clears the halt and ends the phase with
//! FAILED; a partial segment ends it with SHORT; a timeout ends it with ERROR
//! and schedules reset recovery. Whatever stops the walk, the bytes moved so
//! far are reported so the caller can record residue.

use crate::backend::TransferError;
use crate::protocols::Link;
use protocol::{Command, DataBuffer, Direction, TransportResult};
use tracing::{debug, trace, warn};

/// Result of one data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStageOutcome {
    pub result: TransportResult,
    pub transferred: usize,
}

impl DataStageOutcome {
    fn stop(result: TransportResult, transferred: usize) -> Self {
        Self {
            result,
            transferred,
        }
    }
}

/// Move a payload over the bulk endpoint for `direction`
pub fn transfer(link: &mut Link, direction: Direction, data: &mut DataBuffer) -> DataStageOutcome {
    let endpoint = match direction {
        Direction::In => link.endpoints().bulk_in,
        Direction::Out => link.endpoints().bulk_out,
        Direction::None => return DataStageOutcome::stop(TransportResult::Good, 0),
    };

    let mut transferred = 0usize;
    for (index, segment) in data.segments_mut().iter_mut().enumerate() {
        let requested = segment.len();
        if requested == 0 {
            continue;
        }

        let outcome = match direction {
            Direction::In => link.backend().bulk_in(endpoint, &mut segment[..]),
            _ => link.backend().bulk_out(endpoint, &segment[..]),
        };
        trace!(index, requested, ?outcome, "Data segment");

        match outcome {
            Ok(actual) if actual == requested => transferred += actual,
            Ok(actual) if actual < requested => {
                transferred += actual;
                debug!(index, requested, actual, "Short data segment");
                return DataStageOutcome::stop(TransportResult::Short, transferred);
            }
            Ok(actual) => {
                warn!(index, requested, actual, "Device moved more data than requested");
                return DataStageOutcome::stop(TransportResult::Error, transferred);
            }
            Err(TransferError::Stall) => {
                debug!(
                    index,
                    endpoint = format_args!("{:#04x}", endpoint),
                    "Data stage stalled"
                );
                link.clear_halt(endpoint);
                return DataStageOutcome::stop(TransportResult::Failed, transferred);
            }
            Err(TransferError::Cancelled) => {
                return DataStageOutcome::stop(TransportResult::Aborted, transferred);
            }
            Err(TransferError::Timeout) => {
                // Device and host disagree on how far the transfer got
                link.note_failure("data", &TransferError::Timeout);
                link.request_reset();
                return DataStageOutcome::stop(TransportResult::Error, transferred);
            }
            Err(err) => {
                link.note_failure("data", &err);
                return DataStageOutcome::stop(TransportResult::Error, transferred);
            }
        }
    }

    DataStageOutcome::stop(TransportResult::Good, transferred)
}

/// Run the data phase of `cmd` and record its residue
pub fn run(link: &mut Link, cmd: &mut Command) -> TransportResult {
    let requested = cmd.transfer_len();
    let outcome = transfer(link, cmd.direction, &mut cmd.data);
    cmd.residue = requested.saturating_sub(outcome.transferred);
    outcome.result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Endpoints;
    use crate::test_utils::{Call, MockBackend, Reply};
    use protocol::CommandSet;
    use std::time::Duration;

    fn link_with(mock: &std::sync::Arc<MockBackend>) -> Link {
        Link::new(
            mock.clone(),
            Endpoints::default(),
            CommandSet::Transparent,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_segments_in_order() {
        let mock = MockBackend::new();
        mock.push(Reply::Data(vec![1; 4]));
        mock.push(Reply::Data(vec![2; 2]));
        let mut link = link_with(&mock);

        let mut data = DataBuffer::Segments(vec![vec![0; 4], Vec::new(), vec![0; 2]]);
        let outcome = transfer(&mut link, Direction::In, &mut data);

        assert_eq!(outcome.result, TransportResult::Good);
        assert_eq!(outcome.transferred, 6);
        assert_eq!(data.to_vec(), vec![1, 1, 1, 1, 2, 2]);
        // Empty segment is skipped
        assert_eq!(mock.calls().len(), 2);
    }

    #[test]
    fn test_stall_on_first_segment() {
        let mock = MockBackend::new();
        mock.push(Reply::Fail(TransferError::Stall));
        let mut link = link_with(&mock);

        let mut data = DataBuffer::Segments(vec![vec![0; 512]; 3]);
        let outcome = transfer(&mut link, Direction::Out, &mut data);

        assert_eq!(outcome.result, TransportResult::Failed);
        assert_eq!(outcome.transferred, 0);
        assert_eq!(
            mock.calls(),
            vec![
                Call::BulkOut {
                    endpoint: 0x02,
                    data: vec![0; 512]
                },
                Call::ClearHalt(0x02),
            ]
        );
    }

    #[test]
    fn test_partial_segment_is_short() {
        let mock = MockBackend::new();
        mock.push(Reply::Partial(100));
        let mut link = link_with(&mock);

        let mut cmd = Command::read(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], 512).unwrap();
        assert_eq!(run(&mut link, &mut cmd), TransportResult::Short);
        assert_eq!(cmd.residue, 412);
        assert_eq!(cmd.transferred(), 100);
    }

    #[test]
    fn test_overrun_is_error() {
        let mock = MockBackend::new();
        mock.push(Reply::Partial(600));
        let mut link = link_with(&mock);

        let mut data = DataBuffer::Contiguous(vec![0; 512]);
        let outcome = transfer(&mut link, Direction::In, &mut data);
        assert_eq!(outcome.result, TransportResult::Error);
    }

    #[test]
    fn test_cancelled_is_aborted() {
        let mock = MockBackend::new();
        mock.push(Reply::Fail(TransferError::Cancelled));
        let mut link = link_with(&mock);

        let mut data = DataBuffer::Contiguous(vec![0; 64]);
        let outcome = transfer(&mut link, Direction::In, &mut data);
        assert_eq!(outcome.result, TransportResult::Aborted);
    }

    #[test]
    fn test_timeout_requests_reset() {
        let mock = MockBackend::new();
        mock.push(Reply::Data(vec![7; 512]));
        mock.push(Reply::Fail(TransferError::Timeout));
        let mut link = link_with(&mock);

        let mut data = DataBuffer::Segments(vec![vec![0; 512]; 2]);
        let outcome = transfer(&mut link, Direction::In, &mut data);

        assert_eq!(outcome.result, TransportResult::Error);
        assert_eq!(outcome.transferred, 512);
        assert!(link.take_reset_required());
        assert!(link.take_timed_out());
    }

    #[test]
    fn test_no_data_phase() {
        let mock = MockBackend::new();
        let mut link = link_with(&mock);

        let mut data = DataBuffer::None;
        let outcome = transfer(&mut link, Direction::None, &mut data);
        assert_eq!(outcome.result, TransportResult::Good);
        assert!(mock.calls().is_empty());
    }
}
