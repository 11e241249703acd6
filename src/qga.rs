//! QEMU guest agent client.
//!
//! Second line-JSON channel used solely for filesystem freeze/thaw around
//! the backup transaction. Everything here is best effort: failure to
//! freeze is a warning, never an abort, and thaw is always attempted
//! during teardown when a freeze was issued.

use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};

/// Client for the guest agent socket.
///
/// The agent processes commands strictly in order and the channel carries
/// no asynchronous events, so a sequential request/response loop over the
/// stream suffices.
pub struct QgaClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QgaClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|err| {
            format_err!("unable to connect to guest agent socket {:?} - {}", path, err)
        })?;
        let (rx, tx) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(rx),
            writer: tx,
        };
        client.sync().await?;
        Ok(client)
    }

    async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, Error> {
        let mut msg = json!({ "execute": command });
        if let Some(arguments) = arguments {
            msg["arguments"] = arguments;
        }
        let mut data = msg.to_string();
        data.push('\n');
        self.writer.write_all(data.as_bytes()).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                bail!("guest agent closed connection");
            }
            if line.trim().is_empty() {
                continue;
            }
            let reply: Value = line
                .parse()
                .map_err(|err| format_err!("unable to parse guest agent reply - {}", err))?;
            if let Some(err) = reply.get("error") {
                bail!(
                    "guest agent command '{}' failed: {}",
                    command,
                    err["desc"].as_str().unwrap_or("unknown error")
                );
            }
            if let Some(value) = reply.get("return") {
                return Ok(value.clone());
            }
        }
    }

    /// Resynchronize the channel. The token must be unpredictable: the
    /// agent echoes it back, which is the only way to tell the reply to
    /// this sync apart from a stale buffered reply of a previous client.
    async fn sync(&mut self) -> Result<(), Error> {
        let token = i64::from(uuid::Uuid::new_v4().as_fields().0);
        let reply = self
            .execute("guest-sync", Some(json!({ "id": token })))
            .await?;
        if reply.as_i64() != Some(token) {
            bail!("guest agent sync token mismatch");
        }
        Ok(())
    }

    pub async fn ping(&mut self, seconds: u64) -> Result<(), Error> {
        match timeout(Duration::from_secs(seconds), self.execute("guest-ping", None)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => bail!("guest agent did not answer ping within {}s", seconds),
        }
    }

    /// Check that the agent build offers the fsfreeze command family.
    pub async fn supports_fsfreeze(&mut self) -> Result<bool, Error> {
        let info = self.execute("guest-info", None).await?;
        let supported = info["supported_commands"]
            .as_array()
            .map(|commands| {
                commands.iter().any(|command| {
                    command["name"] == "guest-fsfreeze-freeze"
                        && command["enabled"].as_bool().unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(supported)
    }

    pub async fn fsfreeze_status(&mut self) -> Result<String, Error> {
        let status = self.execute("guest-fsfreeze-status", None).await?;
        match status.as_str() {
            Some(status) => Ok(status.to_string()),
            None => bail!("malformed fsfreeze status: {}", status),
        }
    }

    pub async fn fsfreeze_freeze(&mut self) -> Result<i64, Error> {
        let frozen = self.execute("guest-fsfreeze-freeze", None).await?;
        Ok(frozen.as_i64().unwrap_or(0))
    }

    pub async fn fsfreeze_thaw(&mut self) -> Result<i64, Error> {
        let thawed = self.execute("guest-fsfreeze-thaw", None).await?;
        Ok(thawed.as_i64().unwrap_or(0))
    }
}

/// Connect and probe the guest agent. Any failure degrades to a warning
/// and the backup continues without quiescing.
pub async fn connect_agent(socket: &str) -> Option<QgaClient> {
    let mut client = match QgaClient::connect(socket).await {
        Ok(client) => {
            log::info!("guest agent socket connected");
            client
        }
        Err(err) => {
            log::warn!("unable to connect guest agent socket: {}", err);
            return None;
        }
    };

    if let Err(err) = client.ping(5).await {
        log::warn!("unable to reach guest agent, can't freeze file systems: {}", err);
        return None;
    }

    match client.supports_fsfreeze().await {
        Ok(true) => (),
        Ok(false) => {
            log::warn!("guest agent does not support required fsfreeze commands");
            return None;
        }
        Err(err) => {
            log::warn!("unable to query guest agent info: {}", err);
            return None;
        }
    }

    log::info!("guest agent is reachable");
    Some(client)
}

/// Freeze guest filesystems. Returns true if the guest is frozen afterwards.
pub async fn quiesce(client: &mut QgaClient) -> bool {
    match client.fsfreeze_status().await {
        Ok(status) if status == "frozen" => {
            log::warn!("filesystem is already frozen");
            return true;
        }
        Ok(_) => (),
        Err(err) => log::warn!("unable to get filesystem status: {}", err),
    }

    match client.fsfreeze_freeze().await {
        Ok(count) => {
            log::info!("\"{}\" filesystem(s) frozen", count);
            true
        }
        Err(err) => {
            log::warn!("unable to freeze: {}", err);
            false
        }
    }
}

/// Thaw guest filesystems, skipping when already thawed.
pub async fn thaw(client: &mut QgaClient) -> bool {
    match client.fsfreeze_status().await {
        Ok(status) if status == "thawed" => {
            log::info!("filesystem is already thawed, skipping");
            return true;
        }
        Ok(_) => (),
        Err(err) => log::warn!("unable to get filesystem status: {}", err),
    }

    match client.fsfreeze_thaw().await {
        Ok(count) => {
            log::info!("\"{}\" filesystem(s) thawed", count);
            true
        }
        Err(err) => {
            log::warn!("unable to thaw filesystem: {}", err);
            false
        }
    }
}
