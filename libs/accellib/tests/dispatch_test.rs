//! Command dispatch and completion integration tests, driven end to end
//! against the simulated hardware queue.

mod common;

use std::time::Duration;

use accellib::{AccelError, CommandStatus, KernelClass, SessionKind, MIN_EXEC_BUFFERS};
use common::{fixture, Fixture, VENDOR};

fn encoder_session(fx: &Fixture) -> accellib::Session {
    let mut session = fx.manager.create_session(SessionKind::Encoder);
    fx.manager
        .alloc_kernel(&mut session, KernelClass::Encoder(1), VENDOR, false)
        .unwrap();
    session
}

fn regmap(words: usize) -> Vec<u8> {
    (0..words * 4).map(|i| i as u8).collect()
}

#[test]
fn test_submit_poll_exactly_once() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let mut statuses: Vec<CommandStatus> = (0..3)
        .map(|_| {
            let handle = fx.manager.submit_command(&session, &regmap(16)).unwrap();
            CommandStatus::new(handle)
        })
        .collect();
    assert_eq!(fx.queue.in_flight(), 3);

    // Nothing completed yet.
    let done = fx
        .manager
        .poll_commands(&session, &mut statuses, None)
        .unwrap();
    assert_eq!(done, 0);
    assert!(statuses.iter().all(|s| !s.finished));

    // Hardware finishes all three.
    assert_eq!(fx.queue.complete_all(), 3);
    let done = fx
        .manager
        .poll_commands(&session, &mut statuses, None)
        .unwrap();
    assert_eq!(done, 3);
    assert!(statuses.iter().all(|s| s.finished));

    // All buffers returned to the pool.
    let dispatch = fx.manager.device_dispatch(0).unwrap();
    assert_eq!(dispatch.buffers_in_use(), 0);

    // A further poll never reports them again.
    let done = fx
        .manager
        .poll_commands(&session, &mut statuses, None)
        .unwrap();
    assert_eq!(done, 0);
    assert!(statuses.iter().all(|s| s.finished));
}

#[test]
fn test_completion_respects_submission_order() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let mut statuses: Vec<CommandStatus> = (0..3)
        .map(|_| CommandStatus::new(fx.manager.submit_command(&session, &regmap(8)).unwrap()))
        .collect();

    // Only the oldest command completes.
    assert!(fx.queue.complete_next());
    fx.manager
        .poll_commands(&session, &mut statuses, None)
        .unwrap();
    assert!(statuses[0].finished);
    assert!(!statuses[1].finished);
    assert!(!statuses[2].finished);
}

#[test]
fn test_pool_exhaustion_is_retryable_error() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let mut statuses: Vec<CommandStatus> = (0..MIN_EXEC_BUFFERS)
        .map(|_| CommandStatus::new(fx.manager.submit_command(&session, &regmap(4)).unwrap()))
        .collect();
    let err = fx
        .manager
        .submit_command(&session, &regmap(4))
        .unwrap_err();
    assert!(matches!(err, AccelError::NoBuffer(_)));
    assert!(err.is_exhaustion());

    // Completing and reaping one command returns its buffer to the pool.
    fx.queue.complete_next();
    fx.manager
        .poll_commands(&session, &mut statuses, None)
        .unwrap();
    let handle = fx.manager.submit_command(&session, &regmap(4)).unwrap();
    assert!(handle.counter > 0);
}

#[test]
fn test_regmap_validation() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let err = fx.manager.submit_command(&session, &[]).unwrap_err();
    assert!(matches!(err, AccelError::Invalid(_)));

    let err = fx.manager.submit_command(&session, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, AccelError::Invalid(_)));

    let oversized = vec![0u8; accellib::MAX_REGMAP_SIZE + 4];
    let err = fx.manager.submit_command(&session, &oversized).unwrap_err();
    assert!(matches!(err, AccelError::Invalid(_)));
}

#[test]
fn test_foreign_session_handle_is_integrity_failure() {
    let fx = fixture(1, false);
    let session_a = encoder_session(&fx);
    let session_b = encoder_session(&fx);

    let handle = fx.manager.submit_command(&session_a, &regmap(4)).unwrap();
    let mut statuses = [CommandStatus::new(handle)];

    // Session B presenting A's handle trips the signature check.
    let err = fx
        .manager
        .poll_commands(&session_b, &mut statuses, None)
        .unwrap_err();
    assert!(matches!(err, AccelError::Integrity(_)));
}

#[test]
fn test_wait_any_consumes_each_completion_once() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    fx.manager.submit_command(&session, &regmap(4)).unwrap();
    fx.manager.submit_command(&session, &regmap(4)).unwrap();
    fx.queue.complete_all();

    fx.manager
        .is_any_command_done(&session, Duration::from_millis(500))
        .unwrap();
    fx.manager
        .is_any_command_done(&session, Duration::from_millis(500))
        .unwrap();

    // Both credits consumed; a third wait has nothing to report.
    let err = fx
        .manager
        .is_any_command_done(&session, Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, AccelError::Timeout(_)));
}

#[test]
fn test_blocking_poll_times_out_when_hardware_stalls() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let handle = fx.manager.submit_command(&session, &regmap(4)).unwrap();
    let mut statuses = [CommandStatus::new(handle)];

    let err = fx
        .manager
        .poll_commands(&session, &mut statuses, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, AccelError::Timeout(_)));
}

#[test]
fn test_return_codes_surface_hardware_errors() {
    let fx = fixture(1, false);
    let session = encoder_session(&fx);

    let ok = fx.manager.submit_command(&session, &regmap(4)).unwrap();
    let bad = fx.manager.submit_command(&session, &regmap(4)).unwrap();
    let mut statuses = [CommandStatus::new(ok), CommandStatus::new(bad)];

    // Return codes are only available after completion.
    let err = fx
        .manager
        .command_return_codes(&session, &mut statuses)
        .unwrap_err();
    assert!(matches!(err, AccelError::Invalid(_)));

    fx.queue.complete_next_with(0);
    fx.queue.complete_next_with(-22);
    fx.manager
        .poll_commands(&session, &mut statuses, Some(Duration::from_secs(1)))
        .unwrap();

    let errors = fx
        .manager
        .command_return_codes(&session, &mut statuses)
        .unwrap();
    assert_eq!(errors, 1);
    assert_eq!(statuses[0].return_code, 0);
    assert_eq!(statuses[1].return_code, -22);
}

#[test]
fn test_channel_sessions_share_one_pool() {
    // Two encoder sessions multiplexed on one kernel draw from the same
    // per-device buffer pool.
    let fx = fixture(1, false);
    let first = encoder_session(&fx);
    let second = encoder_session(&fx);
    assert_ne!(first.chan_id, second.chan_id);

    fx.manager.submit_command(&first, &regmap(16)).unwrap();
    fx.manager.submit_command(&second, &regmap(16)).unwrap();

    let dispatch = fx.manager.device_dispatch(0).unwrap();
    assert_eq!(dispatch.buffers_in_use(), 2);
    assert_eq!(dispatch.pool_size(), MIN_EXEC_BUFFERS);
}

#[test]
fn test_admin_session_cannot_dispatch() {
    let fx = fixture(1, false);
    let session = fx.manager.create_session(SessionKind::Admin);
    let err = fx.manager.submit_command(&session, &regmap(4)).unwrap_err();
    assert!(matches!(err, AccelError::Invalid(_)));
}
