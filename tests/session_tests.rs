//! Integration tests for sessions and command blocks.
//!
//! These tests verify the session manager end to end over the mock transport:
//! - Block lifecycle, output capture, and ordered updates
//! - Cancellation with a hard deadline
//! - Close semantics and tombstones
//! - Recovery across a degraded connection and forced close on loss

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

use std::time::Duration;

use tokio::time::{Instant, sleep};

use helpers::{HOST, TestEnv, db, next_event, next_update};
use ratssh::executor::OutputStream;
use ratssh::pool::PoolEvent;
use ratssh::session::truncation_marker;
use ratssh::{BlockStatus, Classification, ErrorKind, SessionError, SessionOptions, SessionState, UpdateEvent};

// ============================================================================
// Block Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_echo_completes_with_output() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        assert_eq!(env.client.sessions().session_state(session).unwrap(), SessionState::Active);

        let mut updates = env.client.block_updates(session).unwrap();
        let block_id = env.client.submit_command(session, "echo hello").await.unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Completed);
        assert_eq!(block.exit_code, Some(0));
        assert_eq!(block.output_text(), "hello\n");
        assert_eq!(block.classification, Classification::OneShot);
        assert!(block.started_at.is_some());
        assert!(block.finished_at.is_some());

        let mut events = Vec::new();
        let mut last_seq = 0;
        loop {
            let update = updates.recv().await.unwrap();
            assert!(update.seq > last_seq);
            last_seq = update.seq;
            assert_eq!(update.session_id, session);
            assert_eq!(update.block_id, Some(block_id));
            let done = matches!(update.event, UpdateEvent::BlockFinished { .. });
            events.push(update.event);
            if done {
                break;
            }
        }
        assert_eq!(
            events,
            vec![
                UpdateEvent::BlockCreated {
                    command: "echo hello".to_string(),
                    classification: Classification::OneShot,
                },
                UpdateEvent::BlockStarted,
                UpdateEvent::Output {
                    stream: OutputStream::Stdout,
                    bytes: b"hello\n".to_vec(),
                },
                UpdateEvent::BlockFinished {
                    status: BlockStatus::Completed,
                    exit_code: Some(0),
                    error: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_completed_with_code() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "missing-tool --flag").await.unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Completed);
        assert_eq!(block.exit_code, Some(127));
        assert!(block.output_text().contains("not found"));
        assert_eq!(block.error, None);
    }

    #[tokio::test]
    async fn test_blocks_are_numbered_in_submission_order() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let first = env.client.submit_command(session, "true").await.unwrap();
        let second = env.client.submit_command(session, "exit 3").await.unwrap();
        env.client.sessions().wait_for_block(session, second).await.unwrap();
        env.client.sessions().wait_for_block(session, first).await.unwrap();

        let blocks = env.client.sessions().blocks(session).unwrap();
        let summary: Vec<_> = blocks.iter().map(|b| (b.id, b.command.as_str(), b.exit_code)).collect();
        assert_eq!(summary, vec![(1, "true", Some(0)), (2, "exit 3", Some(3))]);
    }

    #[tokio::test]
    async fn test_interactive_block_takes_input() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let mut updates = env.client.block_updates(session).unwrap();
        let block_id = env.client.submit_command(session, "cat").await.unwrap();
        next_update(&mut updates, |u| matches!(u.event, UpdateEvent::BlockStarted)).await;

        let sessions = env.client.sessions();
        assert_eq!(sessions.block(session, block_id).unwrap().classification, Classification::Interactive);
        sessions.send_input(session, block_id, b"ping\n").unwrap();
        next_update(&mut updates, |u| matches!(u.event, UpdateEvent::Output { .. })).await;
        sessions.close_input(session, block_id).unwrap();

        let block = sessions.wait_for_block(session, block_id).await.unwrap();
        assert_eq!(block.status, BlockStatus::Completed);
        assert_eq!(block.output_text(), "ping\n");
    }

    #[tokio::test]
    async fn test_forward_input_until_eof() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "cat").await.unwrap();

        let sessions = env.client.sessions();
        let input: &[u8] = b"first\nsecond\n";
        sessions.forward_input(session, block_id, input).await.unwrap();

        let block = sessions.wait_for_block(session, block_id).await.unwrap();
        assert_eq!(block.status, BlockStatus::Completed);
        assert_eq!(block.exit_code, Some(0));
        assert_eq!(block.output_text(), "first\nsecond\n");

        // Nothing left to feed once the block is done.
        let late: &[u8] = b"late\n";
        assert_eq!(
            sessions.forward_input(session, block_id, late).await.unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn test_input_rejected_for_non_interactive_block() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "echo hi").await.unwrap();
        env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        let err = env.client.sessions().send_input(session, block_id, b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = env.client.sessions().cancel_block(session, block_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_retained_output_is_bounded() {
        let env = TestEnv::new(|c| c.session.output_limit = 16);
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let mut updates = env.client.block_updates(session).unwrap();
        let block_id = env.client.submit_command(session, "seq 20").await.unwrap();

        let truncated = next_update(&mut updates, |u| matches!(u.event, UpdateEvent::OutputTruncated { .. })).await;
        assert_eq!(truncated.event, UpdateEvent::OutputTruncated { limit: 16 });

        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();
        assert_eq!(block.output.len(), 16);
        assert!(block.output.is_truncated());
        // 1..=20 is 51 bytes; the buffer keeps the last 16.
        assert_eq!(block.output.dropped(), 35);
        let text = block.output_text();
        assert!(text.starts_with(&truncation_marker(35)));
        assert!(text.ends_with("18\n19\n20\n"));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let env = TestEnv::new(|_| {});
        let other = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        env.client.close_session(other).await.unwrap();

        let err = env.client.submit_command(other, "true").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let stranger = "00000000-0000-4000-8000-000000000000".parse().unwrap();
        assert!(matches!(
            env.client.submit_command(stranger, "true").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            env.client.close_session(stranger).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_info_serializes() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();

        let infos = serde_json::to_value(env.client.sessions().list_sessions()).unwrap();
        let info = &infos[0];
        assert_eq!(info["profile_id"], "db");
        assert_eq!(info["state"], "active");
        assert_eq!(info["recoverable"], false);
        assert!(info["created_at"].as_str().is_some_and(|t| t.contains('T')));
        assert_eq!(info["id"], serde_json::to_value(session).unwrap());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_cut_off() {
        let env = TestEnv::new(|c| c.session.update_buffer = 4);
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let mut stalled = env.client.block_updates(session).unwrap();

        let block_id = env.client.submit_command(session, "seq 50").await.unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();
        assert_eq!(block.status, BlockStatus::Completed);
        assert!(block.output_text().ends_with("50\n"));

        let mut buffered = 0;
        while stalled.recv().await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, 4);
        assert!(stalled.lagged());

        // The session itself is unaffected.
        let mut fresh = env.client.block_updates(session).unwrap();
        let next = env.client.submit_command(session, "echo ok").await.unwrap();
        let update = next_update(&mut fresh, |u| u.block_id == Some(next)).await;
        assert!(matches!(update.event, UpdateEvent::BlockCreated { .. }));
        assert!(!fresh.lagged());
    }
}

// ============================================================================
// Cancellation Tests
// ============================================================================

mod cancel_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_honored_interrupt() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "tail -f /var/log/syslog").await.unwrap();
        assert_eq!(
            env.client.sessions().block(session, block_id).unwrap().classification,
            Classification::Continuous
        );

        sleep(Duration::from_millis(2500)).await;
        env.client.sessions().cancel_block(session, block_id).unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Cancelled);
        assert_eq!(block.exit_code, Some(130));
        assert!(block.output_text().starts_with("line 1\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ignored_interrupt_hits_deadline() {
        let env = TestEnv::new(|c| c.session.exec.cancel_grace = Duration::from_secs(2));
        env.connector.set_ignore_interrupt(HOST, true);
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "tail -f app.log").await.unwrap();
        sleep(Duration::from_secs(3)).await;

        let started = Instant::now();
        env.client.sessions().cancel_block(session, block_id).unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Cancelled);
        assert_eq!(block.exit_code, None);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));

        // Only the session shell remains.
        sleep(Duration::from_millis(10)).await;
        assert_eq!(env.connector.live_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejected_after_eof_keeps_connection() {
        let env = TestEnv::new(|_| {});
        env.connector.set_reject_after_eof(HOST, true);
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "tail -f /var/log/syslog").await.unwrap();
        sleep(Duration::from_millis(1500)).await;

        env.client.sessions().cancel_block(session, block_id).unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Cancelled);
        assert_eq!(block.error, None);
        assert_eq!(env.client.sessions().session_state(session).unwrap(), SessionState::Active);
        assert!(!env.client.sessions().is_recoverable(session).unwrap());
        assert_eq!(env.client.sessions().pool().stats().degraded, 0);

        let next = env.client.submit_command(session, "echo still here").await.unwrap();
        let block = env.client.sessions().wait_for_block(session, next).await.unwrap();
        assert_eq!(block.output_text(), "still here\n");
        assert_eq!(env.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timeout_fails_block() {
        let env = TestEnv::new(|c| c.session.exec.command_timeout = Some(Duration::from_secs(5)));
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let block_id = env.client.submit_command(session, "sleep 60").await.unwrap();
        let block = env.client.sessions().wait_for_block(session, block_id).await.unwrap();

        assert_eq!(block.status, BlockStatus::Failed);
        assert_eq!(block.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_on_one_connection_run_independently() {
        let env = TestEnv::new(|_| {});
        let busy = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let idle = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        assert_eq!(env.connector.connect_count(), 1);

        let stream = env.client.submit_command(busy, "yes").await.unwrap();
        let quick = env.client.submit_command(idle, "echo ready").await.unwrap();
        let block = env.client.sessions().wait_for_block(idle, quick).await.unwrap();
        assert_eq!(block.output_text(), "ready\n");
        assert!(env.client.sessions().block(busy, stream).unwrap().is_running());
    }
}

// ============================================================================
// Close Tests
// ============================================================================

mod close_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_running_blocks() {
        let env = TestEnv::new(|_| {});
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let mut updates = env.client.block_updates(session).unwrap();
        let block_id = env.client.submit_command(session, "tail -f /var/log/syslog").await.unwrap();
        next_update(&mut updates, |u| matches!(u.event, UpdateEvent::Output { .. })).await;

        env.client.close_session(session).await.unwrap();

        let finished = next_update(&mut updates, |u| matches!(u.event, UpdateEvent::BlockFinished { .. })).await;
        assert_eq!(finished.block_id, Some(block_id));
        assert!(matches!(
            finished.event,
            UpdateEvent::BlockFinished {
                status: BlockStatus::Cancelled,
                ..
            }
        ));
        let closed = updates.recv().await.unwrap();
        assert_eq!(closed.event, UpdateEvent::SessionClosed { reason: None });
        assert!(updates.recv().await.is_none());

        let sessions = env.client.sessions();
        assert_eq!(sessions.session_state(session).unwrap(), SessionState::Closed);
        assert_eq!(sessions.closed_session(session).map(|c| c.reason), Some(None));
        assert_eq!(sessions.pool().stats().refs, 0);
        assert!(sessions.list_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_forces_stubborn_blocks_after_grace() {
        let env = TestEnv::new(|c| {
            c.session.close_grace = Duration::from_secs(1);
            c.session.exec.cancel_grace = Duration::from_secs(10);
        });
        env.connector.set_ignore_interrupt(HOST, true);
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        env.client.submit_command(session, "yes").await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        env.client.close_session(session).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            env.client.sessions().session_state(session).unwrap(),
            SessionState::Closed
        );
        // Closing again is a no-op.
        env.client.close_session(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let env = TestEnv::new(|_| {});
        let a = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let b = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        env.client.shutdown().await;

        for id in [a, b] {
            assert_eq!(env.client.sessions().session_state(id).unwrap(), SessionState::Closed);
        }
        assert_eq!(env.client.sessions().pool().stats().total, 0);
    }
}

// ============================================================================
// Recovery Tests
// ============================================================================

mod recovery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_sessions_survive_transient_loss() {
        let env = TestEnv::new(|c| c.pool.grace_window = Duration::from_secs(30));
        let sessions = env.client.sessions();
        let first = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let second = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();

        let done = env.client.submit_command(first, "echo before").await.unwrap();
        sessions.wait_for_block(first, done).await.unwrap();
        let streaming = env.client.submit_command(second, "tail -f log").await.unwrap();

        let mut first_updates = env.client.block_updates(first).unwrap();
        let mut second_updates = env.client.block_updates(second).unwrap();
        env.connector.break_host(HOST);

        next_update(&mut first_updates, |u| matches!(u.event, UpdateEvent::SessionRecovering { .. })).await;
        next_update(&mut second_updates, |u| matches!(u.event, UpdateEvent::SessionRecovering { .. })).await;
        assert!(sessions.is_recoverable(first).unwrap());
        assert_eq!(sessions.session_state(second).unwrap(), SessionState::Active);

        let lost = sessions.block(second, streaming).unwrap();
        assert_eq!(lost.status, BlockStatus::Failed);
        assert_eq!(lost.error.map(|e| e.kind), Some(ErrorKind::ConnectionLost));

        let refused = env.client.submit_command(first, "echo during").await.unwrap_err();
        assert_eq!(refused.kind(), ErrorKind::InvalidState);

        env.connector.restore_host(HOST);
        next_update(&mut first_updates, |u| matches!(u.event, UpdateEvent::SessionResumed)).await;
        next_update(&mut second_updates, |u| matches!(u.event, UpdateEvent::SessionResumed)).await;
        assert!(!sessions.is_recoverable(first).unwrap());

        assert_eq!(sessions.block(first, done).unwrap().output_text(), "before\n");
        let after = env.client.submit_command(first, "echo after").await.unwrap();
        assert_eq!(sessions.wait_for_block(first, after).await.unwrap().output_text(), "after\n");
        assert_eq!(sessions.pool().stats().refs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_during_shell_open_recovers() {
        let env = TestEnv::new(|c| {
            c.pool.keepalive_interval = Duration::from_secs(1);
            c.pool.keepalive_max_failures = 1;
            c.pool.grace_window = Duration::from_secs(30);
        });
        let sessions = env.client.sessions();
        let mut events = sessions.pool().subscribe();
        env.connector.set_open_delay(Duration::from_secs(3));
        env.connector.fail_keepalives(HOST, 1);

        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        next_event(&mut events, |e| matches!(e, PoolEvent::Restored { .. })).await;
        assert_eq!(sessions.session_state(session).unwrap(), SessionState::Active);

        for _ in 0..30 {
            if !sessions.is_recoverable(session).unwrap() {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        assert!(!sessions.is_recoverable(session).unwrap());

        // The shell opened on the old transport was never attached, so its
        // failure does not degrade the replacement connection.
        sleep(Duration::from_secs(5)).await;
        let stats = sessions.pool().stats();
        assert_eq!((stats.total, stats.ready, stats.degraded), (1, 1, 0));
        assert_eq!(env.connector.connect_count(), 2);

        env.connector.set_open_delay(Duration::ZERO);
        let block_id = env.client.submit_command(session, "echo ok").await.unwrap();
        assert_eq!(sessions.wait_for_block(session, block_id).await.unwrap().output_text(), "ok\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_closes_with_connection_lost() {
        let env = TestEnv::new(|c| {
            c.pool.grace_window = Duration::from_secs(5);
            c.pool.reconnect.max_retries = 100;
            c.pool.reconnect.max_delay = Duration::from_secs(1);
        });
        let session = env.client.create_session(&db(), &SessionOptions::default()).await.unwrap();
        let mut updates = env.client.block_updates(session).unwrap();

        let started = Instant::now();
        env.connector.break_host(HOST);

        let recovering = next_update(&mut updates, |u| matches!(u.event, UpdateEvent::SessionRecovering { .. })).await;
        assert_eq!(
            recovering.event,
            UpdateEvent::SessionRecovering {
                grace: Duration::from_secs(5)
            }
        );
        let closed = next_update(&mut updates, |u| u.is_session_closed()).await;
        assert!(started.elapsed() >= Duration::from_secs(5));

        let UpdateEvent::SessionClosed { reason: Some(reason) } = closed.event else {
            panic!("expected a forced close, got {:?}", closed.event);
        };
        assert_eq!(reason.kind, ErrorKind::ConnectionLost);

        let sessions = env.client.sessions();
        assert_eq!(sessions.session_state(session).unwrap(), SessionState::Closed);
        assert_eq!(
            sessions.closed_session(session).and_then(|c| c.reason).map(|r| r.kind),
            Some(ErrorKind::ConnectionLost)
        );
        assert_eq!(sessions.pool().stats().total, 0);
    }
}
