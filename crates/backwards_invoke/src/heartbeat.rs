use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::correlation::{MAX_WAIT, deadline_after};
use crate::session::Session;

/// Spawn the liveness task for `session`. It ends on its own when the session
/// closes; a failed heartbeat closes the session.
pub(crate) fn spawn(session: Session, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = session.subscribe_state();
        let every = every.min(MAX_WAIT);
        let mut ticker = tokio::time::interval_at(deadline_after(tokio::time::Instant::now(), every), every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = session.heartbeat() {
                        warn!(error = %e, "heartbeat failed, stopping");
                        break;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() || state.borrow().is_closed() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    })
}

#[cfg(test)]
mod tests {
    use crate::error::InvokeError;
    use crate::frame::{OutboundEvent, OutboundFrame};
    use crate::kind::InvokeType;
    use crate::mock_daemon::MockDaemon;
    use crate::session::{Session, SessionConfig};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, duplex};

    #[tokio::test]
    async fn emits_heartbeat_frames() {
        let (plugin_io, daemon_io) = duplex(4096);
        let (plugin_rd, plugin_wr) = tokio::io::split(plugin_io);
        let (daemon_rd, _daemon_wr) = tokio::io::split(daemon_io);
        let config = SessionConfig {
            heartbeat_interval: Some(Duration::from_millis(20)),
            ..SessionConfig::default()
        };
        let (session, _inbound) = Session::start(plugin_rd, plugin_wr, config);

        let mut lines = BufReader::new(daemon_rd).lines();
        for _ in 0..3 {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .expect("heartbeat in time")
                .unwrap()
                .unwrap();
            let frame: OutboundFrame = serde_json::from_str(&line).unwrap();
            assert_eq!(frame.event, OutboundEvent::Heartbeat);
            assert!(frame.session_id.is_none());
        }
        session.close();
    }

    #[tokio::test]
    async fn heartbeat_into_a_dead_pipe_closes_the_session() {
        let (mock, _inbound) = MockDaemon::start_with(SessionConfig {
            heartbeat_interval: Some(Duration::from_millis(20)),
            ..SessionConfig::default()
        });
        let session = mock.session();
        let mut sub = session.send(None, InvokeType::Llm, json!({})).unwrap();
        mock.next_request().await.unwrap();
        mock.stop_reading().await;

        let reason = tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("heartbeat write should close the session");
        assert!(reason.starts_with("transport"), "reason {reason}");
        assert!(matches!(sub.recv().await, Err(InvokeError::ConnectionClosed(_))));
        assert!(session.heartbeat().is_err());
    }
}
