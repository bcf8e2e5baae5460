//! In-process Gateway for client and manager tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{GatewayClientOptions, ReconnectPolicy};
use crate::protocol::Auth;

pub(crate) const TOKEN: &str = "test-token";

/// How the mock answers the `connect` frame
#[derive(Debug, Clone)]
pub(crate) enum Handshake {
    Accept,
    AcceptAfter(Duration),
    Reject { code: Value, message: String },
    /// Never answer
    Silent,
    /// Accept, then stop reading the socket without closing it. Close
    /// frames from the client go unanswered.
    AcceptThenHang,
}

/// Something the mock does on a connection
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Send(Value),
    SendAfter(Duration, Value),
    /// Send a close frame and stop serving the connection
    Close,
}

type Script = Arc<dyn Fn(&Value) -> Vec<Action> + Send + Sync>;

#[derive(Clone)]
struct Shared {
    handshake: Handshake,
    script: Script,
    connections: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<Value>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    push_tx: broadcast::Sender<Action>,
}

pub(crate) struct MockGateway {
    pub addr: SocketAddr,
    shared: Shared,
    accept_task: JoinHandle<()>,
}

impl MockGateway {
    /// Serve on an ephemeral port; `script` maps each request frame to the
    /// actions taken in reply
    pub async fn start<F>(handshake: Handshake, script: F) -> Self
    where
        F: Fn(&Value) -> Vec<Action> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push_tx, _) = broadcast::channel(64);
        let shared = Shared {
            handshake,
            script: Arc::new(script),
            connections: Arc::new(AtomicUsize::new(0)),
            handshakes: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            push_tx,
        };

        let accept_task = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    let push_rx = shared.push_tx.subscribe();
                    tokio::spawn(serve(tcp, shared.clone(), push_rx));
                }
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    /// Answers every request with `{"ok": true, "method": <method>}`
    pub async fn echo() -> Self {
        Self::start(Handshake::Accept, |frame| {
            vec![Action::Send(ok_reply(frame, json!({"ok": true, "method": frame["method"]})))]
        })
        .await
    }

    /// Options pointing at this mock, with reconnect disabled
    pub fn options(&self) -> GatewayClientOptions {
        let mut options = GatewayClientOptions::new(
            "127.0.0.1",
            self.addr.port(),
            Auth::Token {
                token: TOKEN.to_string(),
            },
        );
        options.timeout_ms = 2_000;
        options.reconnect = ReconnectPolicy::disabled();
        options
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub async fn handshakes(&self) -> Vec<Value> {
        self.shared.handshakes.lock().await.clone()
    }

    /// Request frames received after the handshake
    pub async fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().await.clone()
    }

    /// Run an action on every live connection
    pub fn push(&self, action: Action) {
        let _ = self.shared.push_tx.send(action);
    }

    /// Close live connections and stop accepting new ones
    pub fn shutdown(&self) {
        self.push(Action::Close);
        self.accept_task.abort();
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub(crate) fn ok_reply(request: &Value, result: Value) -> Value {
    json!({"id": request["id"], "result": result})
}

pub(crate) fn error_reply(request: &Value, code: i64, message: &str) -> Value {
    json!({"id": request["id"], "error": {"code": code, "message": message}})
}

pub(crate) fn connected_frame() -> Value {
    json!({
        "type": "connected",
        "presence": {"agents": 1},
        "health": {"ok": true},
        "stateVersion": 3
    })
}

async fn serve(tcp: TcpStream, shared: Shared, mut push_rx: broadcast::Receiver<Action>) {
    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    shared
        .handshakes
        .lock()
        .await
        .push(serde_json::from_str(hello.as_str()).unwrap_or(Value::Null));

    let serving = match &shared.handshake {
        Handshake::Accept | Handshake::AcceptThenHang => apply(&out_tx, Action::Send(connected_frame())),
        Handshake::AcceptAfter(delay) => {
            tokio::time::sleep(*delay).await;
            apply(&out_tx, Action::Send(connected_frame()))
        }
        Handshake::Reject { code, message } => {
            apply(
                &out_tx,
                Action::Send(json!({"type": "error", "code": code, "message": message})),
            );
            apply(&out_tx, Action::Close)
        }
        Handshake::Silent => true,
    };
    if !serving {
        drop(out_tx);
        let _ = writer.await;
        return;
    }
    if matches!(shared.handshake, Handshake::AcceptThenHang) {
        let _held = (stream, out_tx, writer);
        std::future::pending::<()>().await;
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    shared.requests.lock().await.push(request.clone());
                    let keep_serving = (shared.script)(&request)
                        .into_iter()
                        .all(|action| apply(&out_tx, action));
                    if !keep_serving {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            action = push_rx.recv() => match action {
                Ok(action) => {
                    if !apply(&out_tx, action) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

/// Returns false once the connection should stop being served
fn apply(out_tx: &mpsc::UnboundedSender<Message>, action: Action) -> bool {
    match action {
        Action::Send(frame) => {
            let _ = out_tx.send(Message::Text(frame.to_string().into()));
            true
        }
        Action::SendAfter(delay, frame) => {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = out_tx.send(Message::Text(frame.to_string().into()));
            });
            true
        }
        Action::Close => {
            let _ = out_tx.send(Message::Close(None));
            false
        }
    }
}
