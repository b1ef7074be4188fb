//! Connection actor
//!
//! One actor per upgraded socket. The socket is split in two: an inbound
//! task reads frames, decodes events and hands them to the router; an
//! outbound task drains the bounded queue and is the only code that ever
//! writes to the socket. Everyone else reaches the client through a
//! [`ConnectionHandle`].
//!
//! Whichever task exits first runs the teardown: it signals the other task
//! through the handle's cancellation token and removes the actor from the
//! registry. The second task's teardown finds nothing left to remove.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, SendError};
use crate::message::Event;
use crate::registry::ConnectionRegistry;
use crate::router::EventRouter;
use crate::types::{ConnectionId, UserId};

/// Keepalive timing for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Read deadline, extended on every pong
    pub pong_wait: Duration,
    /// Ping period, shorter than `pong_wait` so a healthy peer never times out
    pub ping_interval: Duration,
}

impl Keepalive {
    /// Derive the ping interval as 9/10 of the pong wait
    pub fn from_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::from_pong_wait(Duration::from_secs(10))
    }
}

/// Cloneable sending side of a connection
///
/// Held by the registry and passed to handlers. Enqueueing never blocks.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<Event>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        Self::with_shutdown(user_id, capacity, CancellationToken::new())
    }

    /// Like [`new`](Self::new), but closing when `shutdown` is cancelled
    ///
    /// Pass a child of a server-wide token so one cancel reaches every actor.
    pub fn with_shutdown(
        user_id: UserId,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            sender,
            shutdown,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Enqueue an event for the outbound task
    ///
    /// A full queue drops the event for this recipient instead of waiting.
    pub fn try_send(&self, event: Event) -> Result<(), SendError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Signal both loops to stop; safe to call repeatedly
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

/// Connection actor owning an upgraded socket
pub struct Connection<S> {
    ws: WebSocketStream<S>,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Event>,
    registry: Weak<ConnectionRegistry>,
    router: Arc<EventRouter>,
    keepalive: Keepalive,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        handle: ConnectionHandle,
        outbound: mpsc::Receiver<Event>,
        registry: Weak<ConnectionRegistry>,
        router: Arc<EventRouter>,
        keepalive: Keepalive,
    ) -> Self {
        Self {
            ws,
            handle,
            outbound,
            registry,
            router,
            keepalive,
        }
    }

    /// Run both loops until the connection is torn down
    ///
    /// The handle must already be registered.
    pub async fn run(self) {
        let Connection {
            ws,
            handle,
            outbound,
            registry,
            router,
            keepalive,
        } = self;
        let connection_id = handle.id();
        let (ws_sender, ws_receiver) = ws.split();

        // Spawn read task (WebSocket -> router)
        let read_task = tokio::spawn({
            let handle = handle.clone();
            let registry = registry.clone();
            async move {
                read_loop(ws_receiver, &handle, &router, keepalive.pong_wait).await;
                debug!(connection_id = %handle.id(), "Read task ended");
                teardown(&registry, &handle).await;
            }
        });

        // Spawn write task (queue -> WebSocket)
        let write_task = tokio::spawn(async move {
            if let Err(e) = write_loop(ws_sender, outbound, &handle, keepalive.ping_interval).await {
                debug!(connection_id = %handle.id(), "Write task failed: {}", e);
            }
            debug!(connection_id = %handle.id(), "Write task ended");
            teardown(&registry, &handle).await;
        });

        let (read_result, write_result) = tokio::join!(read_task, write_task);
        for result in [read_result, write_result] {
            if let Err(e) = result {
                error!(connection_id = %connection_id, "Connection task panicked: {}", e);
            }
        }
    }
}

/// Close the connection and drop it from the registry
///
/// Runs once per loop; the second run is a no-op.
async fn teardown(registry: &Weak<ConnectionRegistry>, handle: &ConnectionHandle) {
    handle.close();
    if let Some(registry) = registry.upgrade() {
        registry.unregister(handle.id()).await;
    }
}

/// Inbound loop: read frames until the peer goes away or the deadline passes
async fn read_loop<R>(
    mut ws_receiver: R,
    handle: &ConnectionHandle,
    router: &EventRouter,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let connection_id = handle.id();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            _ = handle.closed() => break,
            next = time::timeout_at(deadline, ws_receiver.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(connection_id = %connection_id, "No pong within {:?}, dropping connection", pong_wait);
                break;
            }
            Ok(None) => {
                debug!(connection_id = %connection_id, "Stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                log_read_error(connection_id, &e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => dispatch(text.as_bytes(), handle, router).await,
            Message::Binary(data) => dispatch(&data, handle, router).await,
            Message::Pong(_) => {
                debug!(connection_id = %connection_id, "Pong");
                deadline = Instant::now() + pong_wait;
            }
            Message::Ping(_) => {
                // Pong is handled automatically by tungstenite
                debug!(connection_id = %connection_id, "Ping");
            }
            Message::Close(frame) => {
                match frame.as_ref().map(|f| f.code) {
                    None | Some(CloseCode::Normal) | Some(CloseCode::Away) => {
                        debug!(connection_id = %connection_id, "Client closed connection");
                    }
                    Some(code) => {
                        info!(connection_id = %connection_id, "Client closed connection with code {}", u16::from(code));
                    }
                }
                break;
            }
            Message::Frame(_) => {}
        }
    }
}

fn log_read_error(connection_id: ConnectionId, err: &WsError) {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            debug!(connection_id = %connection_id, "Connection closed");
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            warn!(connection_id = %connection_id, "Unexpected close: {}", err);
        }
        _ => {
            warn!(connection_id = %connection_id, "WebSocket read error: {}", err);
        }
    }
}

/// Decode one inbound frame and route it
///
/// Malformed frames and handler failures are logged and answered with an
/// `error` event; neither ends the session.
async fn dispatch(bytes: &[u8], handle: &ConnectionHandle, router: &EventRouter) {
    let result = match Event::from_slice(bytes) {
        Ok(event) => router.route(&event, handle).await,
        Err(e) => {
            warn!(connection_id = %handle.id(), "Invalid event payload: {}", e);
            Err(e)
        }
    };

    if let Err(e) = result {
        warn!(
            connection_id = %handle.id(),
            user_id = %handle.user_id(),
            kind = ?e.kind(),
            "Error handling event: {}", e
        );
        if let Err(send_err) = handle.try_send(Event::error(&e)) {
            debug!(connection_id = %handle.id(), "Could not queue error event: {}", send_err);
        }
    }
}

/// Outbound loop: the single writer for this socket
///
/// Ends when the handle is closed, the queue closes, or any write (event or
/// ping) fails. Ping failures are not retried. On close, events already
/// queued are flushed before the close frame.
async fn write_loop<W>(
    mut ws_sender: W,
    mut outbound: mpsc::Receiver<Event>,
    handle: &ConnectionHandle,
    ping_interval: Duration,
) -> Result<(), AppError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = handle.closed() => {
                while let Ok(event) = outbound.try_recv() {
                    write_event(&mut ws_sender, handle, event).await?;
                }
                break;
            }
            maybe_event = outbound.recv() => {
                let Some(event) = maybe_event else {
                    debug!(connection_id = %handle.id(), "Outbound queue closed");
                    break;
                };
                write_event(&mut ws_sender, handle, event).await?;
            }
            _ = ticker.tick() => {
                ws_sender.send(Message::Ping(Default::default())).await?;
            }
        }
    }

    // Send close frame when done
    let _ = ws_sender.close().await;
    Ok(())
}

async fn write_event<W>(ws_sender: &mut W, handle: &ConnectionHandle, event: Event) -> Result<(), AppError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match event.to_json() {
        Ok(json) => ws_sender.send(Message::Text(json.into())).await?,
        Err(e) => {
            // Continue - don't break on serialization errors
            error!(connection_id = %handle.id(), "Failed to serialize event: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, ErrorPayload, EVENT_ERROR};
    use futures_util::sink;
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Client = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, Client) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn spawn_actor(
        registry: &Arc<ConnectionRegistry>,
        capacity: usize,
        keepalive: Keepalive,
    ) -> (ConnectionHandle, Client, JoinHandle<()>) {
        let (server, client) = ws_pair().await;
        let (handle, outbound) = ConnectionHandle::new(UserId::new("1"), capacity);
        registry.register(handle.clone()).await;

        let connection = Connection::new(
            server,
            handle.clone(),
            outbound,
            Arc::downgrade(registry),
            Arc::new(EventRouter::new()),
            keepalive,
        );
        (handle, client, tokio::spawn(connection.run()))
    }

    /// Next text frame from the server, skipping control frames
    async fn next_event(client: &mut Client) -> Event {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return Event::from_slice(text.as_bytes()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    /// Sink that forwards every written frame to a channel
    fn recording_sink() -> (
        impl Sink<Message, Error = WsError> + Unpin,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| WsError::ConnectionClosed)?;
            Ok::<_, WsError>(tx)
        });
        (Box::pin(sink), rx)
    }

    /// Sink whose every write fails like a dead socket
    fn failing_sink() -> impl Sink<Message, Error = WsError> + Unpin {
        Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), WsError>(WsError::ConnectionClosed)
        }))
    }

    #[test]
    fn test_keepalive_ping_interval() {
        let keepalive = Keepalive::from_pong_wait(Duration::from_secs(10));
        assert_eq!(keepalive.ping_interval, Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_try_send_full_queue_drops() {
        let (handle, _rx) = ConnectionHandle::new(UserId::new("1"), 1);
        let event = Event::new("x", &json!({})).unwrap();

        assert!(handle.try_send(event.clone()).is_ok());
        assert_eq!(handle.try_send(event), Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_try_send_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::new(UserId::new("1"), 1);
        drop(rx);
        let event = Event::new("x", &json!({})).unwrap();
        assert_eq!(handle.try_send(event), Err(SendError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_producer_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut client, _task) =
            spawn_actor(&registry, 64, Keepalive::default()).await;

        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 8;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for seq in 0..PER_PRODUCER {
                        let event =
                            Event::new("tick", &json!({ "producer": producer, "seq": seq })).unwrap();
                        handle.try_send(event).unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let mut last_seen = vec![None; PRODUCERS as usize];
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let event = next_event(&mut client).await;
            assert_eq!(event.kind(), "tick");
            let producer = event.payload()["producer"].as_u64().unwrap() as usize;
            let seq = event.payload()["seq"].as_u64().unwrap();
            if let Some(prev) = last_seen[producer] {
                assert!(seq > prev, "producer {producer} out of order");
            }
            last_seen[producer] = Some(seq);
        }
        assert!(last_seen.iter().all(|s| *s == Some(PER_PRODUCER - 1)));
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut client, _task) =
            spawn_actor(&registry, 8, Keepalive::default()).await;

        client.send(Message::Text("not json".into())).await.unwrap();
        let reply = next_event(&mut client).await;
        assert_eq!(reply.kind(), EVENT_ERROR);
        assert_eq!(reply.decode::<ErrorPayload>().unwrap().code, ErrorCode::InvalidMessage);

        client
            .send(Message::Text(r#"{"type":"dance","payload":{}}"#.into()))
            .await
            .unwrap();
        let reply = next_event(&mut client).await;
        assert_eq!(reply.decode::<ErrorPayload>().unwrap().code, ErrorCode::UnknownEvent);

        assert!(registry.contains(handle.id()).await);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_client_close_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut client, task) =
            spawn_actor(&registry, 8, Keepalive::default()).await;

        client.close(None).await.unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_close_sends_close_frame() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut client, task) =
            spawn_actor(&registry, 8, Keepalive::default()).await;

        handle.close();

        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
        task.await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_times_out() {
        let registry = Arc::new(ConnectionRegistry::new());
        let keepalive = Keepalive::from_pong_wait(Duration::from_secs(1));
        // Client never reads, so it never answers pings
        let (_handle, _client, task) = spawn_actor(&registry, 8, keepalive).await;

        task.await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_extend_deadline() {
        let registry = Arc::new(ConnectionRegistry::new());
        let keepalive = Keepalive::from_pong_wait(Duration::from_secs(1));
        let (handle, mut client, _task) = spawn_actor(&registry, 8, keepalive).await;

        // Reading lets tungstenite answer each ping
        let reader = tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

        time::sleep(Duration::from_secs(5)).await;
        assert!(registry.contains(handle.id()).await);

        handle.close();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_frame_decoded_as_event() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut client, _task) =
            spawn_actor(&registry, 8, Keepalive::default()).await;

        client
            .send(Message::Binary(br#"{"type":"dance","payload":{}}"#.to_vec()))
            .await
            .unwrap();

        // The envelope decodes and reaches the router, which has no handler
        let reply = next_event(&mut client).await;
        assert_eq!(reply.decode::<ErrorPayload>().unwrap().code, ErrorCode::UnknownEvent);
        assert!(registry.contains(handle.id()).await);
    }

    #[tokio::test]
    async fn test_peer_dropped_without_close_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, client, task) = spawn_actor(&registry, 8, Keepalive::default()).await;

        drop(client);
        task.await.unwrap();

        assert!(handle.is_closed());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_event_write_failure_ends_write_loop() {
        let (handle, outbound) = ConnectionHandle::new(UserId::new("1"), 8);
        handle.try_send(Event::new("tick", &json!({})).unwrap()).unwrap();

        let result = write_loop(failing_sink(), outbound, &handle, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(AppError::WebSocket(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_failure_is_not_retried() {
        let (handle, outbound) = ConnectionHandle::new(UserId::new("1"), 8);

        let result = time::timeout(
            Duration::from_secs(1),
            write_loop(failing_sink(), outbound, &handle, Duration::from_millis(100)),
        )
        .await;
        assert!(matches!(result, Ok(Err(AppError::WebSocket(_)))));
    }

    #[tokio::test]
    async fn test_write_loop_ends_when_queue_closes() {
        let (producer, outbound) = ConnectionHandle::new(UserId::new("1"), 8);
        // Separate queue for the writer's handle, so dropping `producer` closes `outbound`
        let (writer, _unused) = ConnectionHandle::new(UserId::new("1"), 1);
        drop(producer);

        let (sink, mut written) = recording_sink();
        write_loop(sink, outbound, &writer, Duration::from_secs(60)).await.unwrap();

        assert!(written.try_recv().is_err());
        assert!(!writer.is_closed());
    }

    #[tokio::test]
    async fn test_close_flushes_queued_events() {
        let (handle, outbound) = ConnectionHandle::new(UserId::new("1"), 8);
        for n in 0..3 {
            handle.try_send(Event::new("tick", &json!({ "n": n })).unwrap()).unwrap();
        }
        handle.close();

        let (sink, mut written) = recording_sink();
        write_loop(sink, outbound, &handle, Duration::from_secs(60)).await.unwrap();

        for n in 0..3 {
            match written.try_recv().unwrap() {
                Message::Text(text) => {
                    let event = Event::from_slice(text.as_bytes()).unwrap();
                    assert_eq!(event.payload()["n"], n);
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert!(written.try_recv().is_err());
    }
}
