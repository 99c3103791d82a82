//! ReconnectController (spec §2.11, §4.8): the client-side loop that
//! re-establishes the control channel and re-presents identity via the
//! stored token after a connection drop.

use tokio::time::{sleep, Duration};

use crate::signalling::RECONNECT_RETRY_INTERVAL_SECS;
use crate::transport::control::{ControlEvent, ControlTransport};

/// Outcome of one reconnect attempt cycle, reported back to the actor
/// driving it so it can update `ClientState` and emit the matching events.
pub enum ReconnectOutcome {
    /// TCP + handshake succeeded and the transport is ready for the
    /// caller to send RECONNECT and await the result.
    Connected {
        transport: ControlTransport,
        events: tokio::sync::mpsc::UnboundedReceiver<ControlEvent>,
    },
    /// The loop was asked to stop before a connection succeeded.
    Cancelled,
}

/// Retry `ControlTransport::connect` against `server_addr` every
/// [`RECONNECT_RETRY_INTERVAL_SECS`] until it succeeds or `cancel` fires.
/// Matches spec §4.8: "retry the control-channel connection every ~2s
/// until success ... the loop stops cleanly on either successful
/// resumption or on destruction."
pub async fn reconnect_loop(
    server_addr: &str,
    mut cancel: tokio::sync::oneshot::Receiver<()>,
) -> ReconnectOutcome {
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => return ReconnectOutcome::Cancelled,
            result = ControlTransport::connect(server_addr) => {
                match result {
                    Ok((transport, events)) => return ReconnectOutcome::Connected { transport, events },
                    Err(e) => {
                        tracing::debug!(error = %e, server_addr, "reconnect attempt failed, retrying");
                    }
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut cancel => return ReconnectOutcome::Cancelled,
            _ = sleep(Duration::from_secs(RECONNECT_RETRY_INTERVAL_SECS)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reconnect_loop_succeeds_once_listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            crate::wire::handshake_as_acceptor(&mut stream).await.unwrap();
        });

        let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let outcome = reconnect_loop(&addr.to_string(), cancel_rx).await;
        assert!(matches!(outcome, ReconnectOutcome::Connected { .. }));
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_loop_stops_on_cancel() {
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        cancel_tx.send(()).unwrap();
        // Nothing is listening on this address, so the loop would retry
        // forever without the cancel firing first.
        let outcome = reconnect_loop("127.0.0.1:1", cancel_rx).await;
        assert!(matches!(outcome, ReconnectOutcome::Cancelled));
    }
}
