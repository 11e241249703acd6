//! QMP monitor client.
//!
//! Speaks the line-delimited JSON protocol of the QEMU machine protocol
//! socket: greeting, capability negotiation, then `{execute, arguments, id}`
//! requests matched to `{return|error, id}` replies, with asynchronous
//! events fanned out to subscribers.
//!
//! A single reader task demultiplexes replies and events. Writes are
//! serialized through one writer, so multiple logical callers may have
//! commands in flight concurrently, each distinguished by `id`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};

pub mod commands;

/// Structured error returned by the monitor for a single command.
///
/// Command errors are not fatal to the transport, the caller decides.
#[derive(Debug, Clone)]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

impl fmt::Display for QmpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

impl std::error::Error for QmpError {}

/// Asynchronous event as delivered by the monitor.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub event: String,
    pub data: Value,
    pub timestamp: Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, QmpError>>>>>;

/// Client for a QMP monitor socket.
pub struct QmpClient {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    events: broadcast::Sender<QmpEvent>,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
}

impl QmpClient {
    /// Connect to the monitor socket, consume the greeting and negotiate
    /// capabilities. Both steps are mandatory, a missing or malformed
    /// greeting fails the connection.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|err| format_err!("unable to connect to monitor socket {:?} - {}", path, err))?;

        let (rx, tx) = stream.into_split();
        let mut rx = BufReader::new(rx);

        let mut line = String::new();
        if rx.read_line(&mut line).await? == 0 {
            bail!("monitor closed connection before sending greeting");
        }
        let greeting: Value = line
            .parse()
            .map_err(|err| format_err!("unable to parse monitor greeting - {}", err))?;
        if greeting.get("QMP").is_none() {
            bail!("malformed monitor greeting: {}", greeting);
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);

        let client = Self {
            writer: Arc::new(tokio::sync::Mutex::new(tx)),
            pending: Arc::clone(&pending),
            events: events.clone(),
            next_id: AtomicU64::new(0),
            reader: tokio::spawn(Self::read_loop(rx, pending, events)),
        };

        client.execute("qmp_capabilities", None).await?;

        Ok(client)
    }

    async fn read_loop(
        mut rx: BufReader<OwnedReadHalf>,
        pending: PendingMap,
        events: broadcast::Sender<QmpEvent>,
    ) {
        let mut line = String::new();
        loop {
            line.clear();
            match rx.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => (),
                Err(err) => {
                    log::error!("monitor socket read error: {}", err);
                    break;
                }
            }

            let msg: Value = match line.parse() {
                Ok(msg) => msg,
                Err(err) => {
                    log::error!("unable to parse monitor message - {}", err);
                    break;
                }
            };

            if let Some(name) = msg.get("event").and_then(Value::as_str) {
                let event = QmpEvent {
                    event: name.to_string(),
                    data: msg.get("data").cloned().unwrap_or(Value::Null),
                    timestamp: msg.get("timestamp").cloned().unwrap_or(Value::Null),
                };
                // no receivers is fine, events are dropped then
                let _ = events.send(event);
                continue;
            }

            if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                let waiter = { pending.lock().unwrap().remove(&id) };
                match waiter {
                    Some(tx) => {
                        let result = if let Some(err) = msg.get("error") {
                            Err(QmpError {
                                class: err["class"].as_str().unwrap_or("GenericError").to_string(),
                                desc: err["desc"].as_str().unwrap_or("unknown error").to_string(),
                            })
                        } else {
                            Ok(msg.get("return").cloned().unwrap_or(Value::Null))
                        };
                        let _ = tx.send(result);
                    }
                    None => log::warn!("monitor reply with unknown id {}", id),
                }
                continue;
            }

            log::warn!("ignoring unexpected monitor message: {}", msg);
        }

        // fail all outstanding waiters by dropping their senders
        pending.lock().unwrap().clear();
    }

    /// Execute a single monitor command and return its `return` value.
    ///
    /// A structured command error is surfaced as [`QmpError`], transport
    /// failures as a generic error.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut msg = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            msg["arguments"] = arguments;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut data = msg.to_string();
        data.push('\n');

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_all(data.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                bail!("monitor socket write error: {}", err);
            }
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::new(err).context(format!("command '{}' failed", command))),
            Err(_) => bail!("monitor connection closed while waiting for '{}'", command),
        }
    }

    /// Subscribe to asynchronous events.
    ///
    /// Only events arriving after the subscription are delivered, so
    /// subscribe before issuing the command expected to trigger them.
    pub fn events(&self) -> EventStream {
        EventStream {
            rx: self.events.subscribe(),
        }
    }

    /// Close the client, cancelling all outstanding waiters.
    pub fn close(&self) {
        self.reader.abort();
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Subscription handle for monitor events.
pub struct EventStream {
    rx: broadcast::Receiver<QmpEvent>,
}

impl EventStream {
    /// Await the next event whose name is in `names` and that satisfies
    /// `predicate`. `timeout` bounds the overall wait.
    pub async fn wait<F>(
        &mut self,
        names: &[&str],
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<QmpEvent, Error>
    where
        F: Fn(&QmpEvent) -> bool,
    {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(event) => {
                        if names.contains(&event.event.as_str()) && predicate(&event) {
                            return Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!("event stream lagged, {} events dropped", count);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("monitor connection closed while waiting for events");
                    }
                }
            }
        };

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(result) => result,
                Err(_) => bail!("timeout waiting for event ({:?})", names),
            },
            None => wait.await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn test_socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("qmp-test-{}-{}.sock", name, std::process::id()))
    }

    const GREETING: &str =
        "{\"QMP\": {\"version\": {\"qemu\": {\"major\": 7, \"minor\": 2, \"micro\": 0}}, \"capabilities\": []}}\n";

    async fn spawn_server<F, Fut>(name: &str, handler: F) -> std::path::PathBuf
    where
        F: FnOnce(tokio::net::UnixStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let path = test_socket_path(name);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(GREETING.as_bytes()).await.unwrap();
            handler(stream).await;
        });
        path
    }

    async fn answer_capabilities(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>, writer: &mut tokio::net::unix::OwnedWriteHalf) {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let msg: Value = line.parse().unwrap();
        assert_eq!(msg["execute"], "qmp_capabilities");
        let reply = json!({ "return": {}, "id": msg["id"] });
        writer
            .write_all(format!("{}\n", reply).as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_execute() {
        let path = spawn_server("execute", |stream| async move {
            let (rx, mut tx) = stream.into_split();
            let mut rx = BufReader::new(rx);
            answer_capabilities(&mut rx, &mut tx).await;

            let mut line = String::new();
            rx.read_line(&mut line).await.unwrap();
            let msg: Value = line.parse().unwrap();
            assert_eq!(msg["execute"], "query-status");
            let reply = json!({ "return": { "status": "running" }, "id": msg["id"] });
            tx.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        })
        .await;

        let client = QmpClient::connect(&path).await.unwrap();
        let status = client.execute("query-status", None).await.unwrap();
        assert_eq!(status["status"], "running");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let path = spawn_server("ooo", |stream| async move {
            let (rx, mut tx) = stream.into_split();
            let mut rx = BufReader::new(rx);
            answer_capabilities(&mut rx, &mut tx).await;

            let mut first = String::new();
            rx.read_line(&mut first).await.unwrap();
            let first: Value = first.parse().unwrap();
            let mut second = String::new();
            rx.read_line(&mut second).await.unwrap();
            let second: Value = second.parse().unwrap();

            // answer in reverse arrival order
            let reply = json!({ "return": { "name": "vm1" }, "id": second["id"] });
            tx.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
            let reply = json!({ "return": { "status": "running" }, "id": first["id"] });
            tx.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        })
        .await;

        let client = Arc::new(QmpClient::connect(&path).await.unwrap());

        let c1 = Arc::clone(&client);
        let first = tokio::spawn(async move { c1.execute("query-status", None).await });
        // make sure query-status hits the wire first
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c2 = Arc::clone(&client);
        let second = tokio::spawn(async move { c2.execute("query-name", None).await });

        assert_eq!(first.await.unwrap().unwrap()["status"], "running");
        assert_eq!(second.await.unwrap().unwrap()["name"], "vm1");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_command_error() {
        let path = spawn_server("error", |stream| async move {
            let (rx, mut tx) = stream.into_split();
            let mut rx = BufReader::new(rx);
            answer_capabilities(&mut rx, &mut tx).await;

            let mut line = String::new();
            rx.read_line(&mut line).await.unwrap();
            let msg: Value = line.parse().unwrap();
            let reply = json!({
                "error": { "class": "DeviceNotFound", "desc": "no such device" },
                "id": msg["id"],
            });
            tx.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        })
        .await;

        let client = QmpClient::connect(&path).await.unwrap();
        let err = client
            .execute("blockdev-del", Some(json!({ "node-name": "nope" })))
            .await
            .unwrap_err();
        let qmp_err = err.downcast_ref::<QmpError>().unwrap();
        assert_eq!(qmp_err.class, "DeviceNotFound");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_event_wait() {
        let path = spawn_server("events", |stream| async move {
            let (rx, mut tx) = stream.into_split();
            let mut rx = BufReader::new(rx);
            answer_capabilities(&mut rx, &mut tx).await;

            // emit events only after the job start command, mirroring a
            // transaction kicking off block jobs
            let mut line = String::new();
            rx.read_line(&mut line).await.unwrap();
            let msg: Value = line.parse().unwrap();
            let reply = json!({ "return": {}, "id": msg["id"] });
            tx.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();

            let unrelated = json!({
                "event": "JOB_STATUS_CHANGE",
                "data": { "id": "qmpbackup-disk1", "status": "running" },
                "timestamp": { "seconds": 1, "microseconds": 0 },
            });
            tx.write_all(format!("{}\n", unrelated).as_bytes()).await.unwrap();
            let completed = json!({
                "event": "BLOCK_JOB_COMPLETED",
                "data": { "device": "qmpbackup-disk1", "len": 1024, "offset": 1024 },
                "timestamp": { "seconds": 2, "microseconds": 0 },
            });
            tx.write_all(format!("{}\n", completed).as_bytes()).await.unwrap();
        })
        .await;

        let client = QmpClient::connect(&path).await.unwrap();
        // subscribe before the triggering command so no event is lost
        let mut events = client.events();
        client
            .execute("transaction", Some(json!({ "actions": [] })))
            .await
            .unwrap();
        let event = events
            .wait(
                &["BLOCK_JOB_COMPLETED"],
                |event| event.data["device"] == "qmpbackup-disk1",
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(event.data["len"], 1024);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_waiters() {
        let path = spawn_server("closed", |stream| async move {
            let (rx, mut tx) = stream.into_split();
            let mut rx = BufReader::new(rx);
            answer_capabilities(&mut rx, &mut tx).await;

            // read the command, then hang up without answering
            let mut line = String::new();
            rx.read_line(&mut line).await.unwrap();
            drop(tx);
            drop(rx);
        })
        .await;

        let client = QmpClient::connect(&path).await.unwrap();
        let err = client.execute("query-block", None).await.unwrap_err();
        assert!(err.to_string().contains("closed"));

        let _ = std::fs::remove_file(&path);
    }
}
