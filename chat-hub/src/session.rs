//! Per-connection read loop.
//!
//! A session owns the read half of its connection and the client's display
//! name. Everything other clients should see goes through the hub; command
//! replies are written straight back to the connection.

use std::{io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt},
    select,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    config::HubConfig,
    connection::{Connection, ConnectionId, DEFAULT_NICKNAME},
    hub::HubHandle,
};

const GREETING: [&str; 3] = [
    "Hello from server\n",
    "Type /exit to quit\n",
    "Type /nick <name> to change your name\n",
];

/// What a single trimmed input line asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Exit,
    /// `/nick` with its first argument, if any.
    Nick(Option<&'a str>),
    Chat(&'a str),
}

pub fn parse_input(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Input::Empty
    } else if trimmed == "/exit" {
        Input::Exit
    } else if trimmed.starts_with("/nick") {
        Input::Nick(trimmed.split_whitespace().nth(1))
    } else {
        Input::Chat(trimmed)
    }
}

enum Flow {
    Continue,
    Exit,
}

pub struct Session<R> {
    connection: Arc<Connection>,
    reader: R,
    hub: HubHandle,
    nickname: String,
    max_line_bytes: usize,
    write_timeout: Duration,
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(
        connection: Arc<Connection>,
        reader: R,
        hub: HubHandle,
        config: &HubConfig,
    ) -> Self {
        Self {
            connection,
            reader,
            hub,
            nickname: DEFAULT_NICKNAME.to_string(),
            max_line_bytes: config.max_line_bytes.max(1),
            write_timeout: config.write_timeout,
        }
    }

    /// Runs the session to completion.
    ///
    /// The connection leaves the hub on every return path, including errors
    /// and cancellation of this future. Once the hub closes the connection
    /// the session stops reading and returns.
    pub async fn run(mut self) -> Result<()> {
        let id = self.connection.id();
        let _leave = LeaveGuard {
            hub: self.hub.clone(),
            id,
        };

        self.hub.join(Arc::clone(&self.connection)).await?;
        self.hub
            .broadcast(id, format!("{} connected\n", self.nickname))
            .await?;
        for line in GREETING {
            self.reply(line).await?;
        }
        info!(%id, peer = ?self.connection.peer(), "client joined");

        let connection = Arc::clone(&self.connection);
        let closed = connection.closed();
        tokio::pin!(closed);

        loop {
            select! {
                _ = &mut closed => {
                    info!(%id, "connection closed by hub");
                    break;
                }
                line = self.read_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if let Flow::Exit = self.handle_line(&line).await? {
                        break;
                    }
                }
            }
        }

        info!(%id, nickname = %self.nickname, "client session ended");
        Ok(())
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.reader).take(self.max_line_bytes as u64);
        if limited.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        match parse_input(line) {
            Input::Empty => {}
            Input::Exit => {
                self.hub
                    .broadcast(self.id(), format!("{} disconnected\n", self.nickname))
                    .await?;
                self.reply("Goodbye!\n").await?;
                return Ok(Flow::Exit);
            }
            Input::Nick(None) => {
                self.reply("Usage: /nick <name>\n").await?;
            }
            Input::Nick(Some(name)) => self.rename(name.to_string()).await?,
            Input::Chat(text) => {
                self.hub
                    .broadcast(self.id(), format!("{}: {text}\n", self.nickname))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn rename(&mut self, nickname: String) -> Result<()> {
        let old = std::mem::replace(&mut self.nickname, nickname);
        debug!(id = %self.id(), %old, new = %self.nickname, "nickname changed");
        self.reply(&format!(
            "Changed nickname from {old} to {}\n",
            self.nickname
        ))
        .await?;
        self.hub
            .broadcast(
                self.id(),
                format!("{old} changed nickname to {}\n", self.nickname),
            )
            .await
    }

    /// Writes directly to this client, bounded like hub fan-out so a stalled
    /// peer cannot hold the writer lock.
    async fn reply(&self, line: &str) -> Result<()> {
        timeout(self.write_timeout, self.connection.write_line(line))
            .await
            .context("timed out writing reply")??;
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.connection.id()
    }
}

struct LeaveGuard {
    hub: HubHandle,
    id: ConnectionId,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.hub.leave_detached(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;
    use crate::hub::Hub;

    #[test]
    fn parses_commands_and_chat() {
        assert_eq!(parse_input("  \r\n"), Input::Empty);
        assert_eq!(parse_input("/exit\r\n"), Input::Exit);
        assert_eq!(parse_input("/exit now"), Input::Chat("/exit now"));
        assert_eq!(parse_input("/nick"), Input::Nick(None));
        assert_eq!(parse_input("/nick   Alice  Smith"), Input::Nick(Some("Alice")));
        assert_eq!(parse_input("/Nick Bob"), Input::Chat("/Nick Bob"));
        assert_eq!(parse_input("  hello there \n"), Input::Chat("hello there"));
    }

    struct Client {
        to_server: DuplexStream,
        from_server: BufReader<DuplexStream>,
        connection: Arc<Connection>,
        task: JoinHandle<Result<()>>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.to_server
                .write_all(line.as_bytes())
                .await
                .expect("send line");
        }

        async fn recv(&mut self) -> String {
            let mut line = String::new();
            timeout(Duration::from_secs(1), self.from_server.read_line(&mut line))
                .await
                .expect("timed out waiting for line")
                .expect("read line");
            line
        }
    }

    fn start_session(hub: &HubHandle, config: &HubConfig) -> Client {
        start_session_with_buffer(hub, config, 4096)
    }

    /// `output_buffer` bounds how much the server can write before blocking.
    fn start_session_with_buffer(
        hub: &HubHandle,
        config: &HubConfig,
        output_buffer: usize,
    ) -> Client {
        let (server_write, client_read) = tokio::io::duplex(output_buffer);
        let (client_write, server_read) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::new(server_write, None));
        let session = Session::new(
            Arc::clone(&connection),
            BufReader::new(server_read),
            hub.clone(),
            config,
        );
        let task = tokio::spawn(session.run());
        Client {
            to_server: client_write,
            from_server: BufReader::new(client_read),
            connection,
            task,
        }
    }

    async fn greeted(hub: &HubHandle) -> Client {
        let mut client = start_session(hub, &HubConfig::default());
        for expected in GREETING {
            assert_eq!(client.recv().await, expected);
        }
        client
    }

    #[tokio::test]
    async fn nick_without_name_only_prints_usage() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        tokio::spawn(hub.run());
        let mut alice = greeted(&handle).await;
        let mut bob = greeted(&handle).await;
        assert_eq!(alice.recv().await, "Anonymous connected\n");

        bob.send("/nick\n").await;
        assert_eq!(bob.recv().await, "Usage: /nick <name>\n");

        bob.send("still anonymous\n").await;
        assert_eq!(alice.recv().await, "Anonymous: still anonymous\n");
    }

    #[tokio::test]
    async fn end_of_stream_leaves_without_announcement() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        tokio::spawn(hub.run());
        let mut alice = greeted(&handle).await;
        let bob = greeted(&handle).await;
        assert_eq!(alice.recv().await, "Anonymous connected\n");
        let bob_connection = Arc::clone(&bob.connection);
        let bob_id = bob_connection.id();

        drop(bob);

        // The leave is queued after the read fails; poll until it lands.
        timeout(Duration::from_secs(1), async {
            while handle.members().await.expect("members").contains(&bob_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("bob should leave");

        assert_eq!(
            handle.members().await.expect("members"),
            vec![alice.connection.id()]
        );
        assert!(bob_connection.is_closed());
        // Nothing was announced to alice; her next line is a fresh broadcast.
        handle.broadcast(bob_id, "marker\n").await.expect("broadcast");
        assert_eq!(alice.recv().await, "marker\n");
    }

    #[tokio::test]
    async fn long_lines_are_split_into_chunks() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        tokio::spawn(hub.run());
        let mut alice = greeted(&handle).await;
        let config = HubConfig {
            max_line_bytes: 4,
            ..HubConfig::default()
        };
        let mut bob = start_session(&handle, &config);
        for expected in GREETING {
            assert_eq!(bob.recv().await, expected);
        }
        assert_eq!(alice.recv().await, "Anonymous connected\n");

        bob.send("abcdefgh\n").await;
        assert_eq!(alice.recv().await, "Anonymous: abcd\n");
        assert_eq!(alice.recv().await, "Anonymous: efgh\n");
    }

    async fn wait_until_left(hub: &HubHandle, id: ConnectionId) {
        timeout(Duration::from_secs(1), async {
            while hub.members().await.expect("members").contains(&id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection should leave the hub");
    }

    #[tokio::test]
    async fn pruned_client_can_no_longer_broadcast() {
        let config = HubConfig {
            write_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let (hub, handle) = Hub::new(&config);
        tokio::spawn(hub.run());
        let mut alice = start_session(&handle, &config);
        for expected in GREETING {
            assert_eq!(alice.recv().await, expected);
        }
        // Bob's output buffer fits the greeting but nobody drains it later.
        let mut bob = start_session_with_buffer(&handle, &config, 90);
        for expected in GREETING {
            assert_eq!(bob.recv().await, expected);
        }
        assert_eq!(alice.recv().await, "Anonymous connected\n");
        let bob_id = bob.connection.id();

        alice.send(&format!("{}\n", "x".repeat(200))).await;
        wait_until_left(&handle, bob_id).await;
        assert!(bob.connection.is_closed());

        let bob_result = timeout(Duration::from_secs(1), &mut bob.task)
            .await
            .expect("bob's session should end once closed")
            .expect("session task");
        assert!(bob_result.is_ok());

        // The session is gone, so this line is never read.
        let _ = bob.to_server.write_all(b"ghost message\n").await;
        handle.broadcast(bob_id, "marker\n").await.expect("broadcast");
        assert_eq!(alice.recv().await, "marker\n");
    }

    #[tokio::test]
    async fn hub_shutdown_ends_sessions() {
        let (hub, handle) = Hub::new(&HubConfig::default());
        tokio::spawn(hub.run());
        let mut alice = greeted(&handle).await;

        handle.shutdown("closing\n").await.expect("shutdown");

        assert_eq!(alice.recv().await, "closing\n");
        timeout(Duration::from_secs(1), &mut alice.task)
            .await
            .expect("session should end on shutdown")
            .expect("session task")
            .expect("clean exit");
    }

    #[tokio::test]
    async fn stalled_reply_times_out_and_leaves() {
        let config = HubConfig {
            write_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let (hub, handle) = Hub::new(&config);
        tokio::spawn(hub.run());
        // Too small for the greeting, and never read.
        let mut stalled = start_session_with_buffer(&handle, &config, 8);

        let result = timeout(Duration::from_secs(1), &mut stalled.task)
            .await
            .expect("session should give up on the stalled reply")
            .expect("session task");
        assert!(result.is_err());
        wait_until_left(&handle, stalled.connection.id()).await;
        assert!(stalled.connection.is_closed());
    }
}
