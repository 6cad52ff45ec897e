//! Plain-TCP IRC client: registration, keepalive, channel joins and PRIVMSG.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::provider::{ChatProvider, ProviderMessage};
use crate::config::model::IrcConfig;

const DEFAULT_PORT: u16 = 6667;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Leaves room for the prefix servers prepend when relaying.
const MAX_MESSAGE_BYTES: usize = 400;

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        let (prefix, rest) = match line.strip_prefix(':') {
            Some(rest) => {
                let (prefix, rest) = rest.split_once(' ')?;
                (Some(prefix.to_string()), rest)
            }
            None => (None, line),
        };
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut parts = head.split_whitespace();
        let command = parts.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = parts.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }
        Some(Self {
            prefix,
            command,
            params,
        })
    }

    pub(crate) fn nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split_once('!').map_or(p, |(nick, _)| nick))
    }
}

fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

fn pong(ping: &IrcLine) -> String {
    match ping.params.last() {
        Some(token) => format!("PONG :{}", token),
        None => "PONG".to_string(),
    }
}

/// Map a PRIVMSG to a provider message. CTCP requests are dropped.
pub(crate) fn privmsg(line: &IrcLine) -> Option<ProviderMessage> {
    let [target, text] = line.params.as_slice() else {
        return None;
    };
    if text.starts_with('\u{1}') {
        return None;
    }
    let author = line.nick()?.to_string();
    let private = !is_channel(target);
    Some(ProviderMessage {
        channel: if private { author.clone() } else { target.clone() },
        author,
        text: text.clone(),
        private,
    })
}

/// Split outgoing text into protocol-safe chunks on char boundaries.
pub(crate) fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut current = String::new();
        for ch in line.chars() {
            if current.len() + ch.len_utf8() > max {
                chunks.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
    }
    chunks
}

fn server_address(server: &str) -> String {
    if server.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_PORT)
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct IrcProvider {
    id: String,
    config: IrcConfig,
    nickname: Mutex<Option<String>>,
    connected: Arc<AtomicBool>,
    conn: Mutex<Option<Connection>>,
}

impl IrcProvider {
    pub fn new(id: impl Into<String>, config: IrcConfig) -> Self {
        Self {
            id: id.into(),
            config,
            nickname: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            conn: Mutex::new(None),
        }
    }

    fn outgoing(&self) -> anyhow::Result<mpsc::UnboundedSender<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match conn.as_ref() {
            Some(conn) if self.connected() => Ok(conn.outgoing.clone()),
            _ => bail!("IRC provider '{}' is not connected", self.id),
        }
    }

    fn queue(out: &mpsc::UnboundedSender<String>, line: String) -> anyhow::Result<()> {
        out.send(line)
            .map_err(|_| anyhow::anyhow!("IRC connection writer has stopped"))
    }
}

async fn register(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    out: &mpsc::UnboundedSender<String>,
    mut nick: String,
) -> anyhow::Result<(String, Lines<BufReader<OwnedReadHalf>>)> {
    while let Some(line) = lines.next_line().await? {
        let Some(msg) = IrcLine::parse(&line) else {
            continue;
        };
        match msg.command.as_str() {
            "PING" => IrcProvider::queue(out, pong(&msg))?,
            // RPL_WELCOME
            "001" => return Ok((nick, lines)),
            // ERR_NICKNAMEINUSE
            "433" => {
                nick.push('_');
                debug!(nick = %nick, "nickname in use, retrying");
                IrcProvider::queue(out, format!("NICK {}", nick))?;
            }
            "ERROR" => bail!(
                "IRC server refused the connection: {}",
                msg.params.last().map(String::as_str).unwrap_or("")
            ),
            _ => {}
        }
    }
    bail!("IRC server closed the connection during registration")
}

#[async_trait]
impl ChatProvider for IrcProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn bot_mention(&self) -> Option<String> {
        self.nickname
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ProviderMessage>> {
        self.disconnect().await;

        let addr = server_address(&self.config.server);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to IRC server {}", addr))?;
        let (read_half, mut write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write_half
                    .write_all(format!("{}\r\n", line).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        if let Some(password) = &self.config.password {
            Self::queue(&out_tx, format!("PASS {}", password))?;
        }
        Self::queue(&out_tx, format!("NICK {}", self.config.nickname))?;
        Self::queue(
            &out_tx,
            format!("USER {} 0 * :{}", self.config.nickname, self.config.realname),
        )?;

        let lines = BufReader::new(read_half).lines();
        let (nick, mut lines) = match tokio::time::timeout(
            REGISTRATION_TIMEOUT,
            register(lines, &out_tx, self.config.nickname.clone()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => bail!("IRC registration with {} timed out", addr),
        };

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connected = self.connected.clone();
        connected.store(true, Ordering::SeqCst);
        let reader_out = out_tx.clone();
        let provider = self.id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(msg) = IrcLine::parse(&line) else {
                            continue;
                        };
                        match msg.command.as_str() {
                            "PING" => {
                                if reader_out.send(pong(&msg)).is_err() {
                                    break;
                                }
                            }
                            "PRIVMSG" => {
                                if let Some(message) = privmsg(&msg) {
                                    if in_tx.send(message).is_err() {
                                        break;
                                    }
                                }
                            }
                            "ERROR" => break,
                            _ => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "IRC read failed");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!(provider = %provider, "IRC connection closed");
        });

        info!(provider = %self.id, server = %addr, nick = %nick, "IRC registered");
        *self.nickname.lock().unwrap_or_else(|e| e.into_inner()) = Some(nick);
        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(Connection {
            outgoing: out_tx,
            reader,
            writer,
        });
        Ok(in_rx)
    }

    async fn disconnect(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.connected.store(false, Ordering::SeqCst);
        let Some(conn) = conn else {
            return;
        };
        let _ = conn.outgoing.send("QUIT :shutting down".to_string());
        drop(conn.outgoing);
        conn.reader.abort();
        // The writer drains QUIT and exits once the reader's sender is gone.
        let mut writer = conn.writer;
        if tokio::time::timeout(Duration::from_secs(2), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }

    async fn join(&self, channel: &str) -> anyhow::Result<()> {
        let out = self.outgoing()?;
        Self::queue(&out, format!("JOIN {}", channel))
    }

    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        let out = self.outgoing()?;
        for chunk in split_message(text, MAX_MESSAGE_BYTES) {
            Self::queue(&out, format!("PRIVMSG {} :{}", channel, chunk))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_prefix_command_and_trailing() {
        let line = IrcLine::parse(":alice!a@host PRIVMSG #ops :warden: status please\r\n").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(line.nick(), Some("alice"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#ops", "warden: status please"]);

        let ping = IrcLine::parse("PING :irc.example.net").unwrap();
        assert_eq!(ping.prefix, None);
        assert_eq!(pong(&ping), "PONG :irc.example.net");

        assert!(IrcLine::parse("").is_none());
    }

    #[test]
    fn private_messages_reply_to_author() {
        let line = IrcLine::parse(":bob!b@host PRIVMSG warden :hello").unwrap();
        let msg = privmsg(&line).unwrap();
        assert!(msg.private);
        assert_eq!(msg.channel, "bob");

        let ctcp = IrcLine::parse(":bob!b@host PRIVMSG warden :\u{1}VERSION\u{1}").unwrap();
        assert!(privmsg(&ctcp).is_none());
    }

    #[test]
    fn long_messages_are_split() {
        let text = format!("{}\nsecond", "é".repeat(5));
        let chunks = split_message(&text, 4);
        assert_eq!(chunks, vec!["éé", "éé", "é", "seco", "nd"]);
    }

    #[test]
    fn default_port_is_appended() {
        assert_eq!(server_address("irc.example.net"), "irc.example.net:6667");
        assert_eq!(server_address("127.0.0.1:7000"), "127.0.0.1:7000");
    }

    #[tokio::test]
    async fn registers_receives_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while seen.len() < 2 {
                seen.push(lines.next_line().await.unwrap().unwrap());
            }
            write
                .write_all(b":srv 433 * warden :Nickname is already in use\r\n")
                .await
                .unwrap();
            seen.push(lines.next_line().await.unwrap().unwrap());
            write.write_all(b":srv 001 warden_ :Welcome\r\n").await.unwrap();
            write
                .write_all(b":alice!a@h PRIVMSG #ops :warden_: status\r\n")
                .await
                .unwrap();
            loop {
                let line = lines.next_line().await.unwrap().unwrap();
                if line.starts_with("PRIVMSG") {
                    seen.push(line);
                    break;
                }
                seen.push(line);
            }
            seen
        });

        let provider = IrcProvider::new(
            "irc",
            IrcConfig {
                server: addr.to_string(),
                nickname: "warden".to_string(),
                password: None,
                realname: "warden".to_string(),
            },
        );
        let mut inbound = provider.connect().await.unwrap();
        assert!(provider.connected());
        assert_eq!(provider.bot_mention().as_deref(), Some("warden_"));

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.channel, "#ops");
        assert_eq!(msg.author, "alice");
        assert!(!msg.private);

        provider.join("#ops").await.unwrap();
        provider.send("#ops", "all good").await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(seen[0], "NICK warden");
        assert!(seen[1].starts_with("USER warden 0 *"));
        assert_eq!(seen[2], "NICK warden_");
        assert!(seen.contains(&"JOIN #ops".to_string()));
        assert_eq!(seen.last().unwrap(), "PRIVMSG #ops :all good");

        provider.disconnect().await;
        assert!(!provider.connected());
        assert!(provider.send("#ops", "late").await.is_err());
    }
}
