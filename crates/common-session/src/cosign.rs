use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use super::{SessionValidator, ValidatorError};

/// Configuration for the CoSign daemon connection.
#[derive(Debug, Clone)]
pub struct CosignConfig {
    /// `host:port` of the daemon.
    pub daemon_address: String,
    /// Service name; cookies are checked as `cosign-<service>=<value>`.
    pub service: String,
    /// Budget for establishing the TCP connection and reading the banner.
    pub connect_timeout: Duration,
    /// Budget for a single command/reply exchange.
    pub request_timeout: Duration,
}

impl Default for CosignConfig {
    fn default() -> Self {
        Self {
            daemon_address: "127.0.0.1:6663".to_string(),
            service: "dice-api".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl CosignConfig {
    /// Name of the cookie carrying the session identifier for this service.
    pub fn cookie_name(&self) -> String {
        format!("cosign-{}", self.service)
    }
}

/// [`SessionValidator`] backed by a single connection to a CoSign daemon.
///
/// The daemon speaks one command at a time, so exchanges are serialized
/// behind an async mutex. `close` takes the same lock and therefore waits for
/// any in-flight check to finish.
pub struct CosignClient {
    config: CosignConfig,
    conn: Mutex<ConnState>,
}

enum ConnState {
    Connected(Connection),
    /// The last exchange failed; reconnect before the next command.
    Broken,
    Closed,
}

impl CosignClient {
    /// Connect to the daemon and consume its greeting.
    pub async fn connect(config: CosignConfig) -> Result<Self, ValidatorError> {
        let connection = Connection::open(&config).await?;
        tracing::debug!(addr = %config.daemon_address, "cosign connection established");
        Ok(Self {
            config,
            conn: Mutex::new(ConnState::Connected(connection)),
        })
    }
}

#[async_trait]
impl SessionValidator for CosignClient {
    async fn validate(&self, session_id: &str) -> Result<bool, ValidatorError> {
        // The cookie travels inside a command line; anything that could break
        // the line framing cannot be a valid session.
        if session_id.is_empty() || session_id.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Ok(false);
        }

        let mut state = self.conn.lock().await;
        // The connection is held outside the state while in use; a failed or
        // cancelled exchange leaves `Broken` behind.
        let mut conn = match std::mem::replace(&mut *state, ConnState::Broken) {
            ConnState::Connected(conn) => conn,
            ConnState::Broken => {
                tracing::info!(addr = %self.config.daemon_address, "reconnecting to cosign daemon");
                Connection::open(&self.config).await?
            }
            ConnState::Closed => {
                *state = ConnState::Closed;
                return Err(ValidatorError::Closed);
            }
        };

        let command = format!("CHECK {}={}", self.config.cookie_name(), session_id);
        let reply = conn.exchange(&command, self.config.request_timeout).await?;

        let verdict = match reply.class() {
            2 => Ok(true),
            4 => {
                tracing::debug!(code = reply.code, "cosign rejected session");
                Ok(false)
            }
            5 => Err(ValidatorError::Daemon(reply.text)),
            _ => return Err(ValidatorError::Protocol(reply.to_string())),
        };
        *state = ConnState::Connected(conn);
        verdict
    }

    async fn close(&self) -> Result<(), ValidatorError> {
        let mut state = self.conn.lock().await;
        match std::mem::replace(&mut *state, ConnState::Closed) {
            ConnState::Connected(mut conn) => {
                let reply = conn.exchange("QUIT", self.config.request_timeout).await?;
                conn.stream.shutdown().await?;
                if reply.class() != 2 {
                    return Err(ValidatorError::Protocol(reply.to_string()));
                }
                Ok(())
            }
            ConnState::Broken => Ok(()),
            ConnState::Closed => Err(ValidatorError::Closed),
        }
    }
}

struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    async fn open(config: &CosignConfig) -> Result<Self, ValidatorError> {
        let connect_error = |reason: String| ValidatorError::Connect {
            addr: config.daemon_address.clone(),
            reason,
        };

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect(&config.daemon_address),
        )
        .await
        .map_err(|_| connect_error(format!("timed out after {:?}", config.connect_timeout)))?
        .map_err(|err| connect_error(err.to_string()))?;

        let mut conn = Self {
            stream: BufStream::new(stream),
        };
        let banner = timeout(config.connect_timeout, conn.read_reply())
            .await
            .map_err(|_| connect_error("no greeting from daemon".to_string()))??;
        if banner.class() != 2 {
            return Err(connect_error(format!("daemon refused connection: {banner}")));
        }
        Ok(conn)
    }

    async fn exchange(&mut self, command: &str, budget: Duration) -> Result<Reply, ValidatorError> {
        timeout(budget, async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await?;
            self.read_reply().await
        })
        .await
        .map_err(|_| ValidatorError::Timeout(budget))?
    }

    /// Read one reply, skipping `NNN-` continuation lines.
    async fn read_reply(&mut self) -> Result<Reply, ValidatorError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stream.read_line(&mut line).await?;
            if read == 0 {
                return Err(ValidatorError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let reply = Reply::parse(line.trim_end_matches(['\r', '\n']))?;
            if !reply.continued {
                return Ok(reply);
            }
        }
    }
}

#[derive(Debug)]
struct Reply {
    code: u16,
    continued: bool,
    text: String,
}

impl Reply {
    fn parse(line: &str) -> Result<Self, ValidatorError> {
        let code = line
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .filter(|code| (100..600).contains(code))
            .ok_or_else(|| ValidatorError::Protocol(line.to_string()))?;
        let rest = &line[3..];
        let continued = rest.starts_with('-');
        let text = rest.get(1..).unwrap_or_default().trim().to_string();
        Ok(Self {
            code,
            continued,
            text,
        })
    }

    fn class(&self) -> u16 {
        self.code / 100
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinSet;

    /// Minimal daemon: sessions ending in `good` are valid, `boom` is a server
    /// error, `drop` hangs up, `hang` is never answered, anything else is
    /// rejected.
    async fn spawn_daemon() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    write
                        .write_all(b"220-fake cosign\r\n220 ready\r\n")
                        .await
                        .ok();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply: &[u8] = if line == "QUIT" {
                            b"221 bye\r\n"
                        } else if line.ends_with("good") {
                            b"231 127.0.0.1 alice EXAMPLE.ORG\r\n"
                        } else if line.ends_with("boom") {
                            b"503 database unavailable\r\n"
                        } else if line.ends_with("drop") {
                            return;
                        } else if line.ends_with("hang") {
                            continue;
                        } else {
                            b"431 invalid cookie\r\n"
                        };
                        if write.write_all(reply).await.is_err() || line == "QUIT" {
                            return;
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    fn config(addr: String) -> CosignConfig {
        CosignConfig {
            daemon_address: addr,
            service: "test".to_string(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn parses_replies() {
        let reply = Reply::parse("231 127.0.0.1 alice EXAMPLE.ORG").expect("reply");
        assert_eq!(reply.code, 231);
        assert!(!reply.continued);
        assert_eq!(reply.class(), 2);

        let continued = Reply::parse("220-welcome").expect("reply");
        assert!(continued.continued);
        assert_eq!(continued.text, "welcome");

        assert!(Reply::parse("hello").is_err());
        assert!(Reply::parse("99").is_err());
    }

    #[tokio::test]
    async fn checks_sessions_against_daemon() {
        let (addr, _) = spawn_daemon().await;
        let client = CosignClient::connect(config(addr)).await.expect("connect");

        assert!(client.validate("good").await.expect("verdict"));
        assert!(!client.validate("stale").await.expect("verdict"));
        assert!(matches!(
            client.validate("boom").await,
            Err(ValidatorError::Daemon(_))
        ));
        assert!(client.validate("good").await.expect("still connected"));
    }

    #[tokio::test]
    async fn rejects_session_ids_that_break_framing() {
        let (addr, _) = spawn_daemon().await;
        let client = CosignClient::connect(config(addr)).await.expect("connect");

        assert!(!client.validate("good\r\nQUIT").await.expect("verdict"));
        assert!(!client.validate("").await.expect("verdict"));
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let (addr, accepted) = spawn_daemon().await;
        let client = CosignClient::connect(config(addr)).await.expect("connect");

        assert!(client.validate("drop").await.is_err());
        assert!(client.validate("good").await.expect("reconnected"));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_releases_connection_once() {
        let (addr, _) = spawn_daemon().await;
        let client = CosignClient::connect(config(addr)).await.expect("connect");

        client.close().await.expect("close");
        assert!(matches!(
            client.validate("good").await,
            Err(ValidatorError::Closed)
        ));
        assert!(matches!(client.close().await, Err(ValidatorError::Closed)));
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (seen_tx, mut seen) = mpsc::unbounded_channel::<String>();
        let (release, released) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"220 ready\r\n").await.expect("banner");
            let mut released = Some(released);
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = seen_tx.send(line.clone());
                if line == "QUIT" {
                    write.write_all(b"221 bye\r\n").await.ok();
                    return;
                }
                if let Some(released) = released.take() {
                    let _ = released.await;
                }
                write
                    .write_all(b"231 127.0.0.1 alice EXAMPLE.ORG\r\n")
                    .await
                    .ok();
            }
        });

        let client = Arc::new(CosignClient::connect(config(addr)).await.expect("connect"));
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.validate("held").await }
        });
        assert_eq!(seen.recv().await.as_deref(), Some("CHECK cosign-test=held"));

        let closing = tokio::spawn({
            let client = client.clone();
            async move { client.close().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!closing.is_finished());
        assert!(seen.try_recv().is_err(), "QUIT sent while a check was pending");

        release.send(()).expect("release");
        assert!(pending.await.expect("join").expect("verdict"));
        closing.await.expect("join").expect("close");
        assert_eq!(seen.recv().await.as_deref(), Some("QUIT"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_get_their_own_verdicts() {
        let (addr, accepted) = spawn_daemon().await;
        let client = Arc::new(CosignClient::connect(config(addr)).await.expect("connect"));

        let mut checks = JoinSet::new();
        for i in 0..16 {
            let client = client.clone();
            checks.spawn(async move {
                let expected = i % 3 == 0;
                let session = if expected {
                    format!("s{i}-good")
                } else {
                    format!("s{i}-stale")
                };
                (expected, client.validate(&session).await)
            });
        }

        let mut answered = 0;
        while let Some(joined) = checks.join_next().await {
            let (expected, verdict) = joined.expect("join");
            assert_eq!(verdict.expect("verdict"), expected);
            answered += 1;
        }
        assert_eq!(answered, 16);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_check_does_not_poison_the_connection() {
        let (addr, accepted) = spawn_daemon().await;
        let client = CosignClient::connect(config(addr)).await.expect("connect");

        // `hang` never gets a reply; dropping the call mid-exchange must not
        // leave its reply to be read by the next command.
        let abandoned = tokio::time::timeout(Duration::from_millis(50), client.validate("hang")).await;
        assert!(abandoned.is_err());

        assert!(client.validate("good").await.expect("verdict"));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        client.close().await.expect("close");
    }

    #[tokio::test]
    async fn connect_fails_without_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let result = CosignClient::connect(config(addr)).await;
        assert!(matches!(result, Err(ValidatorError::Connect { .. })));
    }
}
