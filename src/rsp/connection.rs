//! Single cooperative event loop per connection, exactly as the
//! specification's concurrency model requires: no internal tasks are
//! spawned, and the server is never serving more than one client. This
//! replaces the teacher's three-task ack/packet broker (`reader.rs`,
//! `writer.rs`, `gdb_server_async.rs`) with one loop whose only
//! suspension points are socket reads, socket writes, and the implicit
//! yield inside them — matching §5 exactly instead of fanning work out
//! across `async_std::task::spawn`.

use async_std::net::{TcpListener, TcpStream, ToSocketAddrs};
use async_std::prelude::*;

use super::framing::{encode, Frame, FrameKind, Framer};

/// Everything the connection loop needs from the protocol core: turn a
/// command payload into a reply, react to a break byte, and hand back
/// any notification queued for non-stop mode.
pub trait Dispatcher {
    fn handle_command(&mut self, payload: &[u8]) -> Vec<u8>;
    fn handle_break(&mut self);
    fn take_pending_notification(&mut self) -> Option<Vec<u8>>;
}

/// Bind `addr` and serve connections one at a time, forever. A
/// disconnect (EOF) is not fatal: the loop goes back to `accept`.
pub async fn accept_loop<Disp: Dispatcher>(
    addr: impl ToSocketAddrs,
    mut make_dispatcher: impl FnMut() -> Disp,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {}", listener.local_addr()?);
    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = stream?;
        if let Ok(peer) = stream.peer_addr() {
            log::info!("accepted connection from {peer}");
        }
        let dispatcher = make_dispatcher();
        if let Err(e) = serve_connection(stream, dispatcher).await {
            log::warn!("connection closed with error: {e}");
        }
    }
    Ok(())
}

/// Drive one client to completion: read bytes, extract frames, ack or
/// nack commands, dispatch them, and interleave any notification the
/// dispatcher has queued. Returns when the client disconnects.
pub async fn serve_connection<Disp: Dispatcher>(mut stream: TcpStream, mut dispatcher: Disp) -> std::io::Result<()> {
    let mut framer = Framer::new();
    let mut buf = [0u8; 4096];

    loop {
        if let Some(payload) = dispatcher.take_pending_notification() {
            stream.write_all(&encode(FrameKind::Notification, &payload)).await?;
            stream.flush().await?;
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        framer.feed(&buf[..n]);

        for frame in framer.drain() {
            match frame {
                Frame::Command(payload) => {
                    stream.write_all(b"+").await?;
                    let reply = dispatcher.handle_command(&payload);
                    stream.write_all(&encode(FrameKind::Command, &reply)).await?;
                    stream.flush().await?;
                }
                Frame::Nack => {
                    stream.write_all(b"-").await?;
                    stream.flush().await?;
                }
                Frame::Break => {
                    log::trace!("break byte received");
                    dispatcher.handle_break();
                }
                Frame::Ack | Frame::Notification(_) => {
                    // Acks for our own outgoing replies/notifications;
                    // nothing to act on at this layer.
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rsp::framing::{encode, FrameKind};

    struct EchoDispatcher {
        notif: Option<Vec<u8>>,
        breaks: u32,
    }

    impl Dispatcher for EchoDispatcher {
        fn handle_command(&mut self, payload: &[u8]) -> Vec<u8> {
            payload.to_vec()
        }

        fn handle_break(&mut self) {
            self.breaks += 1;
        }

        fn take_pending_notification(&mut self) -> Option<Vec<u8>> {
            self.notif.take()
        }
    }

    #[test]
    fn dispatcher_echoes_command_payload() {
        let mut d = EchoDispatcher {
            notif: None,
            breaks: 0,
        };
        let reply = d.handle_command(b"ping");
        assert_eq!(reply, b"ping");
    }

    #[test]
    fn break_increments_counter() {
        let mut d = EchoDispatcher {
            notif: None,
            breaks: 0,
        };
        d.handle_break();
        d.handle_break();
        assert_eq!(d.breaks, 2);
    }

    #[test]
    fn pending_notification_is_taken_once() {
        let mut d = EchoDispatcher {
            notif: Some(b"Stop:T05".to_vec()),
            breaks: 0,
        };
        assert_eq!(d.take_pending_notification(), Some(b"Stop:T05".to_vec()));
        assert_eq!(d.take_pending_notification(), None);
    }

    #[test]
    fn encoded_notification_round_trips_through_framer() {
        let wire = encode(FrameKind::Notification, b"Stop:T05");
        let mut framer = Framer::new();
        framer.feed(&wire);
        assert_eq!(framer.drain(), vec![Frame::Notification(b"Stop:T05".to_vec())]);
    }
}
