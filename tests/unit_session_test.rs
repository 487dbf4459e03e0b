use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sentra::core::SentraError;
use sentra::core::protocol::{Frame, FrameCodec};
use sentra::core::session::{RequestDispatcher, Session, dispatch_common};
use std::sync::Arc;
use tokio_util::codec::Framed;

/// A dispatcher that only knows the common verbs (echo, chunk routing).
struct CommonDispatcher;

#[async_trait::async_trait]
impl RequestDispatcher for CommonDispatcher {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        dispatch_common(session, command, payload).await
    }
}

fn session_pair() -> (Arc<Session>, Arc<Session>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let (left, _) = Session::spawn(a, None, Arc::new(CommonDispatcher), "left");
    let (right, _) = Session::spawn(b, None, Arc::new(CommonDispatcher), "right");
    (left, right)
}

#[tokio::test]
async fn test_execute_echo_round_trip() {
    let (left, _right) = session_pair();
    let reply = left.execute("echo", Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(reply.command, "ok");
    assert_eq!(reply.payload.as_ref(), b"ping");
}

#[tokio::test]
async fn test_unknown_command_gets_err_and_session_survives() {
    let (left, _right) = session_pair();
    let reply = left.execute("bogus", Bytes::new()).await.unwrap();
    assert_eq!(reply.command, "err");
    assert!(reply.into_result().is_err());

    // The session is still usable after a protocol error.
    let reply = left.execute("echo", Bytes::from_static(b"alive")).await.unwrap();
    assert_eq!(reply.payload.as_ref(), b"alive");
}

#[tokio::test]
async fn test_concurrent_exchanges_matched_by_counter_not_order() {
    // Drive the peer side manually so the two responses can be delivered in
    // reverse order of the requests.
    let (a, b) = tokio::io::duplex(1 << 16);
    let (session, _) = Session::spawn(a, None, Arc::new(CommonDispatcher), "caller");
    let mut peer = Framed::new(b, FrameCodec::new(None));

    let s1 = session.clone();
    let s2 = session.clone();
    let call_a = tokio::spawn(async move { s1.execute("echo", Bytes::from_static(b"AAAA")).await });
    let call_b = tokio::spawn(async move { s2.execute("echo", Bytes::from_static(b"BBBB")).await });

    let first = peer.next().await.unwrap().unwrap();
    let second = peer.next().await.unwrap().unwrap();

    // Reply to the second request first.
    peer.send(Frame::new(second.counter, "ok", second.payload.clone()))
        .await
        .unwrap();
    peer.send(Frame::new(first.counter, "ok", first.payload.clone()))
        .await
        .unwrap();

    let reply_a = call_a.await.unwrap().unwrap();
    let reply_b = call_b.await.unwrap().unwrap();
    assert_eq!(reply_a.payload.as_ref(), b"AAAA");
    assert_eq!(reply_b.payload.as_ref(), b"BBBB");
}

#[tokio::test]
async fn test_requests_replied_on_same_counter() {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (_session, _) = Session::spawn(a, None, Arc::new(CommonDispatcher), "responder");
    let mut peer = Framed::new(b, FrameCodec::new(None));

    peer.send(Frame::new(123456, "echo", &b"marco"[..]))
        .await
        .unwrap();
    let reply = peer.next().await.unwrap().unwrap();
    assert_eq!(reply.counter, 123456);
    assert_eq!(reply.command, "ok");
    assert_eq!(reply.payload.as_ref(), b"marco");
}

#[tokio::test]
async fn test_session_close_wakes_pending_exchanges() {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (session, _) = Session::spawn(a, None, Arc::new(CommonDispatcher), "caller");
    let mut peer = Framed::new(b, FrameCodec::new(None));

    let s = session.clone();
    let pending = tokio::spawn(async move { s.execute("echo", Bytes::from_static(b"hang")).await });

    // Swallow the request, then drop the peer to close the stream.
    let _ = peer.next().await.unwrap().unwrap();
    drop(peer);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, SentraError::TransportClosed);

    // Further calls fail fast once the session is closed.
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session should observe the close");
    let err = session.execute("echo", Bytes::new()).await.unwrap_err();
    assert_eq!(err, SentraError::TransportClosed);
}
