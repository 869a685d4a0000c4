//! TCP listeners and their accept loops.
//!
//! An [`Acceptor`] owns one bound listener socket. `start` arms the
//! accept loop; `stop` disarms it and closes the socket, releasing the
//! fd exactly once. Accepted sockets are handed to the connection
//! pipeline, which dispatches frames through the broker.
//!
//! Accepts are taken in bounded batches so one busy endpoint cannot
//! starve the rest of the loop. Accept errors (EMFILE and friends) are
//! logged and retried after a cooldown.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::Config;
use crate::constants::{ACCEPT_BATCH, ACCEPT_RETRY_DELAY};

use super::connection;

/// A named listener plus its accept loop.
pub struct Acceptor {
    name: String,
    local_addr: SocketAddr,
    auto_start: bool,
    broker: Broker,
    max_frame: usize,
    listener: Mutex<Option<TcpListener>>,
    started: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Bind the listener socket without arming the accept loop.
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        auto_start: bool,
        broker: Broker,
        max_frame: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind listener {name:?} on {addr}"))?;
        let local_addr = listener.local_addr().context("listener local address")?;
        log::info!("[acceptor {name}] bound on {local_addr}");

        Ok(Self {
            name: name.to_string(),
            local_addr,
            auto_start,
            broker,
            max_frame,
            listener: Mutex::new(Some(listener)),
            started: AtomicBool::new(false),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Listener name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound address (with the kernel-assigned port for `:0` binds).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether configuration marks this acceptor as started at boot.
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    /// Arm the accept loop. Idempotent; a no-op after `stop`.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(listener) = self.listener.lock().expect("listener mutex poisoned").take() else {
            return; // stopped before ever starting
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            self.name.clone(),
            listener,
            self.broker.clone(),
            self.max_frame,
            cancel.clone(),
        ));
        *self.cancel.lock().expect("cancel mutex poisoned") = Some(cancel);
        *self.task.lock().expect("task mutex poisoned") = Some(task);
        log::info!("[acceptor {}] started", self.name);
    }

    /// Disarm the accept loop and close the socket.
    ///
    /// Idempotent: the fd is released exactly once, whether by the loop
    /// task winding down or by dropping a never-started listener.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        // Never-started case: drop the bound socket directly.
        drop(self.listener.lock().expect("listener mutex poisoned").take());
        if let Some(cancel) = self.cancel.lock().expect("cancel mutex poisoned").take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().expect("task mutex poisoned").take() {
            drop(task); // detached; it exits on cancellation
        }
    }
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    broker: Broker,
    max_frame: usize,
    cancel: CancellationToken,
) {
    let mut burst = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let conn_id = connection::connection_id();
                    log::debug!("[acceptor {name}] client {peer} connected as {conn_id}");
                    connection::spawn(conn_id, stream, broker.clone(), max_frame);

                    burst += 1;
                    if burst >= ACCEPT_BATCH {
                        burst = 0;
                        tokio::task::yield_now().await;
                    }
                }
                Err(err) => {
                    // Transient accept failure; cool down and re-arm.
                    log::error!("[acceptor {name}] accept error: {err}");
                    burst = 0;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
    // The listener drops here, closing the accept socket.
    log::info!("[acceptor {name}] stopped");
}

// ─── Listener set ──────────────────────────────────────────────────────────

/// All acceptors of one master, in configuration order.
#[derive(Debug)]
pub struct Listeners {
    entries: Vec<Arc<Acceptor>>,
}

impl Listeners {
    /// Bind every configured listener. None of them is started yet.
    pub async fn bind(config: &Config, broker: &Broker) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            let acceptor = Acceptor::bind(
                &listener.name,
                listener.addr,
                listener.started,
                broker.clone(),
                config.max_frame_size,
            )
            .await?;
            entries.push(Arc::new(acceptor));
        }
        Ok(Self { entries })
    }

    /// Iterate the acceptors in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Acceptor>> {
        self.entries.iter()
    }

    /// Listener index → name, as handed to workers.
    pub fn enumerated(&self) -> BTreeMap<u32, String> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, acceptor)| (i as u32, acceptor.name().to_string()))
            .collect()
    }

    /// Arm every acceptor marked started in configuration.
    pub fn start_marked(&self) {
        for acceptor in &self.entries {
            if acceptor.auto_start() {
                acceptor.start();
            }
        }
    }

    /// Disarm all acceptors and close their sockets.
    pub fn stop_all(&self) {
        for acceptor in &self.entries {
            acceptor.stop();
        }
    }

    /// Write `name addr` lines so automation can discover ephemeral ports.
    pub fn write_ports_file(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for acceptor in &self.entries {
            out.push_str(&format!("{} {}\n", acceptor.name(), acceptor.local_addr()));
        }
        std::fs::write(path, out)
            .with_context(|| format!("write ports file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::wire::frame::{encode_frame, read_frame};
    use crate::wire::ipc::{encode_reply, status, RequestDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixStream};
    use tokio::time::{timeout, Duration};

    const WAIT: Duration = Duration::from_secs(5);

    async fn broker_with_echo_worker() -> Broker {
        let broker = Broker::start(8, 1024 * 1024);
        let (incoming_near, mut incoming_far) = UnixStream::pair().unwrap();
        let (outgoing_near, mut outgoing_far) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let mut decoder = RequestDecoder::new(1024 * 1024);
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match incoming_far.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for frame in decoder.feed(&buf[..n]).unwrap() {
                    let reply = encode_reply(status::OK, frame.seq, &frame.payload);
                    outgoing_far.write_all(&reply).await.unwrap();
                }
            }
        });
        broker.register(1, incoming_near, outgoing_near).await;
        broker
    }

    #[tokio::test]
    async fn test_accept_and_round_trip() {
        let broker = broker_with_echo_worker().await;
        let acceptor = Acceptor::bind(
            "echo",
            "127.0.0.1:0".parse().unwrap(),
            true,
            broker,
            1024 * 1024,
        )
        .await
        .unwrap();
        acceptor.start();

        let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        client.write_all(&encode_frame(b"ping")).await.unwrap();
        let reply = timeout(WAIT, read_frame(&mut client, 1024 * 1024))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"ping");

        acceptor.stop();
    }

    #[tokio::test]
    async fn test_stop_twice_releases_fd_once() {
        let broker = Broker::start(8, 1024 * 1024);
        let acceptor = Acceptor::bind(
            "echo",
            "127.0.0.1:0".parse().unwrap(),
            true,
            broker,
            1024 * 1024,
        )
        .await
        .unwrap();
        let addr = acceptor.local_addr();
        acceptor.start();
        acceptor.stop();
        acceptor.stop();

        // The port is released: connecting must eventually fail.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let broker = broker_with_echo_worker().await;
        let acceptor = Acceptor::bind(
            "echo",
            "127.0.0.1:0".parse().unwrap(),
            true,
            broker,
            1024 * 1024,
        )
        .await
        .unwrap();
        acceptor.start();
        acceptor.start();

        let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        client.write_all(&encode_frame(b"x")).await.unwrap();
        let reply = timeout(WAIT, read_frame(&mut client, 1024 * 1024))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"x");
        acceptor.stop();
    }

    #[tokio::test]
    async fn test_listeners_bind_and_enumerate() {
        let broker = Broker::start(8, 1024 * 1024);
        let config = Config {
            listeners: vec![
                ListenerConfig {
                    name: "echo".to_string(),
                    addr: "127.0.0.1:0".parse().unwrap(),
                    started: true,
                },
                ListenerConfig {
                    name: "admin".to_string(),
                    addr: "127.0.0.1:0".parse().unwrap(),
                    started: false,
                },
            ],
            ..Config::default()
        };
        let listeners = Listeners::bind(&config, &broker).await.unwrap();

        let enumerated = listeners.enumerated();
        assert_eq!(enumerated[&0], "echo");
        assert_eq!(enumerated[&1], "admin");

        let tmp = tempfile::TempDir::new().unwrap();
        let ports_path = tmp.path().join("ports");
        listeners.write_ports_file(&ports_path).unwrap();
        let content = std::fs::read_to_string(&ports_path).unwrap();
        assert!(content.lines().any(|l| l.starts_with("echo 127.0.0.1:")));
        assert!(content.lines().any(|l| l.starts_with("admin 127.0.0.1:")));

        listeners.stop_all();
    }
}
