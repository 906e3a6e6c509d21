//! Request/response correlation over one server's byte transport

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::process::{Inbound, ProcessExit, ProcessHandle};
use crate::rpc::{LspCodec, Message, Notification, Request, RequestId, Response, ResponseError, encode_frame};
use crate::session::error::TransportError;

type Outcome = Result<Value, TransportError>;

/// An outstanding request awaiting its response
struct PendingRequest {
    method: String,
    issued_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

impl PendingRequest {
    fn resolve(self, outcome: Outcome) {
        trace!(
            "'{}' settled after {:?}",
            self.method,
            self.issued_at.elapsed()
        );
        // The caller may have given up already
        let _ = self.slot.send(outcome);
    }
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    requests: HashMap<RequestId, PendingRequest>,
}

struct Shared {
    handle: ProcessHandle,
    next_id: AtomicI64,
    pending: Mutex<PendingTable>,
    closed: watch::Sender<bool>,
}

/// Protocol session bound to one [`ProcessHandle`].
///
/// Every request resolves exactly once: with its response, a timeout, or
/// `SessionClosed` when the transport goes away.
pub struct TransportSession {
    shared: Arc<Shared>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    closed: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl TransportSession {
    pub fn new(mut handle: ProcessHandle, request_timeout: Duration) -> Self {
        let inbound = handle.inbound();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            handle,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(PendingTable::default()),
            closed: closed_tx,
        });

        match inbound {
            Some(inbound) => {
                tokio::spawn(read_loop(shared.clone(), inbound, notify_tx));
            }
            None => {
                warn!("{} has no readable output", shared.handle.label());
                shared.shut();
            }
        }

        Self {
            shared,
            notifications: Mutex::new(Some(notify_rx)),
            closed: closed_rx,
            request_timeout,
        }
    }

    pub fn label(&self) -> &str {
        self.shared.handle.label()
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.handle.pid()
    }

    /// Sends a request bounded by the default request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Outcome {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// On timeout the request is forgotten and the server is sent
    /// `$/cancelRequest`; a late response is then dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Outcome {
        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = self.shared.register(id.clone(), method)?;

        debug!("-> {} ({})", method, id);
        if let Err(e) = self
            .shared
            .send(&Message::request(id.clone(), method, params))
            .await
        {
            self.shared.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::SessionClosed),
            Err(_) => {
                if self.shared.forget(&id) {
                    warn!("'{}' ({}) timed out after {:?}", method, id, timeout);
                    let cancel = Message::notification("$/cancelRequest", Some(json!({ "id": id })));
                    if let Err(e) = self.shared.send(&cancel).await {
                        debug!("Failed to cancel {}: {}", id, e);
                    }
                }
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Sends a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        debug!("-> {} (notification)", method);
        self.shared
            .send(&Message::notification(method, params))
            .await
    }

    /// Takes the stream of server notifications, in arrival order.
    /// Only the first call returns it.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table().requests.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until the transport is closed, either by the server or by `close`.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.shared.handle.try_exit()
    }

    /// Waits for the server behind the transport to exit.
    pub async fn wait_exit(&self) -> ProcessExit {
        self.shared.handle.wait().await
    }

    /// Fails all pending requests with `SessionClosed` and terminates the
    /// server, killing it if it has not exited after `grace`.
    pub async fn close(&self, grace: Duration) -> ProcessExit {
        self.shared.shut();
        self.shared.handle.terminate(grace).await
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shared.shut();
        self.shared.handle.kill();
    }
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: RequestId, method: &str) -> Result<oneshot::Receiver<Outcome>, TransportError> {
        let mut table = self.table();
        if table.closed {
            return Err(TransportError::SessionClosed);
        }

        let (slot, receiver) = oneshot::channel();
        table.requests.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                slot,
            },
        );
        Ok(receiver)
    }

    fn forget(&self, id: &RequestId) -> bool {
        self.table().requests.remove(id).is_some()
    }

    /// Marks the transport closed and resolves every pending request.
    fn shut(&self) {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table();
            table.closed = true;
            table.requests.drain().map(|(_, pending)| pending).collect()
        };

        if !drained.is_empty() {
            debug!(
                "Failing {} pending request(s) on {}",
                drained.len(),
                self.handle.label()
            );
        }
        for pending in drained {
            pending.resolve(Err(TransportError::SessionClosed));
        }
        self.closed.send_replace(true);
    }

    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = encode_frame(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.handle.write(&frame).await.map_err(|e| {
            debug!("Write to {} failed: {}", self.handle.label(), e);
            TransportError::SessionClosed
        })
    }

    fn dispatch(self: &Arc<Self>, message: Message, notifications: &mpsc::UnboundedSender<Notification>) {
        match message {
            Message::Response(response) => self.complete(response),
            Message::Notification(notification) => {
                trace!("<- {} (notification)", notification.method);
                let _ = notifications.send(notification);
            }
            // Replied off the read loop so a full stdin pipe cannot stall reading
            Message::Request(request) => {
                let shared = self.clone();
                tokio::spawn(async move { shared.answer(request).await });
            }
        }
    }

    fn complete(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            warn!(
                "{}",
                TransportError::Protocol(format!(
                    "response without id: {:?}",
                    response.error
                ))
            );
            return;
        };

        let pending = self.table().requests.remove(&id);
        match pending {
            Some(pending) => {
                debug!("<- {} ({})", pending.method, id);
                pending.resolve(response.into_result().map_err(TransportError::Server));
            }
            None => warn!(
                "{}",
                TransportError::Protocol(format!("response for unknown request {}", id))
            ),
        }
    }

    async fn answer(&self, request: Request) {
        debug!("<- {} (server request {})", request.method, request.id);
        let response = match reply_to_server_request(&request) {
            Ok(result) => Response::success(request.id, result),
            Err(error) => Response::failure(request.id, error),
        };
        if let Err(e) = self.send(&Message::Response(response)).await {
            debug!("Failed to answer {}: {}", request.method, e);
        }
    }
}

/// Fixed answers for the requests a server may send to its client
fn reply_to_server_request(request: &Request) -> Result<Value, ResponseError> {
    match request.method.as_str() {
        "workspace/configuration" => {
            let items = request
                .params
                .as_ref()
                .and_then(|params| params.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Ok(Value::Array(vec![Value::Null; items]))
        }
        "window/workDoneProgress/create"
        | "client/registerCapability"
        | "client/unregisterCapability" => Ok(Value::Null),
        "workspace/applyEdit" => Ok(json!({ "applied": false })),
        method => Err(ResponseError::method_not_found(method)),
    }
}

/// Closes the transport when the read loop ends, however it ends
struct ShutOnExit(Arc<Shared>);

impl Drop for ShutOnExit {
    fn drop(&mut self) {
        self.0.shut();
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut inbound: Inbound,
    notifications: mpsc::UnboundedSender<Notification>,
) {
    let _shut = ShutOnExit(shared.clone());
    let mut codec = LspCodec::new();
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    while let Some(chunk) = inbound.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(&bytes),
            Err(e) => {
                warn!("Failed to read from {}: {}", shared.handle.label(), e);
                break;
            }
        }

        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(message)) => shared.dispatch(message, &notifications),
                Ok(None) => break,
                // The bad frame has been consumed; keep reading
                Err(e) => warn!("{}", TransportError::Protocol(e.to_string())),
            }
        }
    }

    debug!("{} closed its output", shared.handle.label());
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use std::future::Future;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    type PeerReader = FramedRead<ReadHalf<DuplexStream>, LspCodec>;
    type PeerWriter = FramedWrite<WriteHalf<DuplexStream>, LspCodec>;

    /// Transport wired to an in-process peer running `script`
    fn scripted_peer<F, Fut>(script: F) -> TransportSession
    where
        F: FnOnce(PeerReader, PeerWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        scripted_peer_with_pipe(16 * 1024, script)
    }

    /// Like `scripted_peer`, with `pipe` bytes of buffer in each direction
    fn scripted_peer_with_pipe<F, Fut>(pipe: usize, script: F) -> TransportSession
    where
        F: FnOnce(PeerReader, PeerWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(pipe);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(script(
            FramedRead::new(server_read, LspCodec::new()),
            FramedWrite::new(server_write, LspCodec::new()),
        ));
        let handle = ProcessHandle::from_task("peer", client_read, client_write, task);
        TransportSession::new(handle, Duration::from_secs(5))
    }

    async fn next_request(reader: &mut PeerReader) -> Request {
        match reader.next().await {
            Some(Ok(Message::Request(request))) => request,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_regardless_of_order() {
        let transport = scripted_peer(|mut reader, mut writer| async move {
            let first = next_request(&mut reader).await;
            let second = next_request(&mut reader).await;
            for request in [second, first] {
                let result = json!(request.method);
                writer
                    .send(Message::Response(Response::success(request.id, result)))
                    .await
                    .unwrap();
            }
            std::future::pending::<()>().await;
        });

        let (a, b) = tokio::join!(
            transport.request("first/method", None),
            transport.request("second/method", None)
        );

        assert_eq!(a.unwrap(), json!("first/method"));
        assert_eq!(b.unwrap(), json!("second/method"));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_surfaces_as_server_error() {
        let transport = scripted_peer(|mut reader, mut writer| async move {
            let request = next_request(&mut reader).await;
            let error = ResponseError {
                code: -32602,
                message: "invalid params".to_string(),
                data: None,
            };
            writer
                .send(Message::Response(Response::failure(request.id, error)))
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });

        let result = transport.request("workspace/executeCommand", None).await;

        let Err(TransportError::Server(error)) = result else {
            panic!("expected server error, got {:?}", result);
        };
        assert_eq!(error.code, -32602);
    }

    #[tokio::test]
    async fn unknown_response_id_does_not_disturb_the_session() {
        let transport = scripted_peer(|mut reader, mut writer| async move {
            let request = next_request(&mut reader).await;
            writer
                .send(Message::Response(Response::success(
                    RequestId::Number(999),
                    json!("stray"),
                )))
                .await
                .unwrap();
            writer
                .send(Message::Response(Response::success(request.id, json!("ok"))))
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });

        let result = transport.request("test/echo", None).await;

        assert_eq!(result.unwrap(), json!("ok"));
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped_and_session_continues() {
        let transport = scripted_peer(|mut reader, mut writer| async move {
            let request = next_request(&mut reader).await;
            writer
                .get_mut()
                .write_all(b"Content-Length: 18446744073709551615\r\n\r\n{}")
                .await
                .unwrap();
            writer
                .send(Message::Response(Response::success(request.id, json!("ok"))))
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });

        let result = tokio::time::timeout(Duration::from_secs(3), transport.request("test/echo", None))
            .await
            .unwrap();

        assert_eq!(result.unwrap(), json!("ok"));
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn timeout_forgets_request_and_sends_cancel() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let transport = scripted_peer(|mut reader, _writer| async move {
            while let Some(Ok(message)) = reader.next().await {
                let _ = seen_tx.send(message);
            }
        });

        let result = transport
            .request_with_timeout("slow/method", None, Duration::from_millis(50))
            .await;

        assert_eq!(
            result,
            Err(TransportError::Timeout {
                method: "slow/method".to_string(),
                after: Duration::from_millis(50),
            })
        );
        assert_eq!(transport.pending_count(), 0);

        let Some(Message::Request(request)) = seen_rx.recv().await else {
            panic!("expected the original request");
        };
        let Some(Message::Notification(cancel)) = seen_rx.recv().await else {
            panic!("expected a cancel notification");
        };
        assert_eq!(cancel.method, "$/cancelRequest");
        assert_eq!(cancel.params, Some(json!({ "id": request.id })));
    }

    #[tokio::test]
    async fn peer_exit_fails_pending_and_later_requests() {
        let transport = scripted_peer(|mut reader, _writer| async move {
            let _ = next_request(&mut reader).await;
        });

        let pending = transport.request("never/answered", None).await;
        transport.closed().await;
        let later = transport.request("after/close", None).await;

        assert_eq!(pending, Err(TransportError::SessionClosed));
        assert_eq!(later, Err(TransportError::SessionClosed));
        assert_eq!(
            transport.notify("after/close", None).await,
            Err(TransportError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn close_resolves_pending_requests() {
        let transport = Arc::new(scripted_peer(|mut reader, _writer| async move {
            while reader.next().await.is_some() {}
            std::future::pending::<()>().await;
        }));

        let waiting = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request("never/answered", None).await })
        };
        while transport.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let exit = transport.close(Duration::from_millis(50)).await;

        assert_eq!(waiting.await.unwrap(), Err(TransportError::SessionClosed));
        assert_eq!(exit, ProcessExit::Killed);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_order() {
        let transport = scripted_peer(|_reader, mut writer| async move {
            for n in 0..3 {
                writer
                    .send(Message::notification(
                        "window/logMessage",
                        Some(json!({ "type": 3, "message": format!("line {}", n) })),
                    ))
                    .await
                    .unwrap();
            }
            std::future::pending::<()>().await;
        });
        let mut notifications = transport.take_notifications().unwrap();

        for n in 0..3 {
            let notification = notifications.recv().await.unwrap();
            assert_eq!(
                notification.params.unwrap()["message"],
                json!(format!("line {}", n))
            );
        }
        assert!(transport.take_notifications().is_none());
    }

    #[tokio::test]
    async fn server_requests_get_fixed_replies() {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let _transport = scripted_peer(|mut reader, mut writer| async move {
            let requests = [
                ("workspace/configuration", Some(json!({ "items": [{}, {}] }))),
                ("workspace/applyEdit", Some(json!({ "edit": {} }))),
                ("custom/unknown", None),
            ];
            for (n, (method, params)) in requests.into_iter().enumerate() {
                writer
                    .send(Message::request(n as i64, method, params))
                    .await
                    .unwrap();
                if let Some(Ok(Message::Response(response))) = reader.next().await {
                    let _ = reply_tx.send(response);
                }
            }
            std::future::pending::<()>().await;
        });

        let configuration = reply_rx.recv().await.unwrap();
        assert_eq!(configuration.into_result().unwrap(), json!([null, null]));

        let apply_edit = reply_rx.recv().await.unwrap();
        assert_eq!(apply_edit.into_result().unwrap(), json!({ "applied": false }));

        let unknown = reply_rx.recv().await.unwrap();
        assert_eq!(unknown.into_result().unwrap_err().code, crate::rpc::message::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unread_replies_do_not_stall_responses() {
        let transport = scripted_peer_with_pipe(128, |mut reader, mut writer| async move {
            let request = next_request(&mut reader).await;
            // Replies to these fill the pipe while the peer is not reading
            for n in 0..20i64 {
                writer
                    .send(Message::request(100 + n, "workspace/configuration", Some(json!({ "items": [{}] }))))
                    .await
                    .unwrap();
            }
            writer
                .send(Message::Response(Response::success(request.id, json!("ok"))))
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });

        let result = tokio::time::timeout(Duration::from_secs(3), transport.request("test/echo", None))
            .await
            .unwrap();

        assert_eq!(result.unwrap(), json!("ok"));
    }
}
