// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Socket listeners and per-connection framing
//!
//! Each connection gets its own [`Session`]; all sessions of a server share
//! one descriptor budget. Frames are cut from the byte
//! stream by their little-endian size prefix and handed to the dispatcher;
//! replies come back through a channel drained by a writer task.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ninep_core::{Backend, Dispatcher, FdBudget, FdLimits, Session, SessionConfig};
use ninep_proto::HEADER_SIZE;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::config::ListenAddr;

/// A Unix listener whose socket file is removed when it goes away
pub struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    /// Bind `path`, replacing a stale socket left by an earlier run.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            debug!(operation = "remove_stale_socket", socket_path = %path.display(), "Removing existing socket file");
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(socket_path = %self.path.display(), error = %err, "Failed to remove socket file");
        }
    }
}

pub enum Listener {
    Unix(DeleteOnDrop),
    Tcp(TcpListener),
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Listener {
    pub async fn bind(addr: &ListenAddr) -> io::Result<Self> {
        match addr {
            ListenAddr::Unix(path) => Ok(Listener::Unix(DeleteOnDrop::bind(path)?)),
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Human-readable address for log lines.
    pub fn describe(&self) -> String {
        match self {
            Listener::Unix(l) => format!("unix:{}", l.path().display()),
            Listener::Tcp(l) => match l.local_addr() {
                Ok(addr) => format!("tcp:{addr}"),
                Err(_) => "tcp:?".to_string(),
            },
        }
    }

    async fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Unix(l) => Ok(Stream::Unix(l.listener.accept().await?.0)),
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
        }
    }
}

/// Accepts connections and serves each with a fresh session
pub struct Server {
    listener: Listener,
    backend: Arc<dyn Backend>,
    budget: Arc<FdBudget>,
    config: SessionConfig,
}

impl Server {
    pub fn new(listener: Listener, backend: Arc<dyn Backend>, config: SessionConfig) -> Self {
        let budget = Arc::new(FdBudget::new(FdLimits::from_config(&config)));
        Self {
            listener,
            backend,
            budget,
            config,
        }
    }

    /// Descriptor budget shared by every connection of this server.
    pub fn budget(&self) -> &Arc<FdBudget> {
        &self.budget
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);
        info!(operation = "server_running", address = %self.listener.describe(), "Listening for 9P connections");

        let mut connection_count: u64 = 0;
        loop {
            let stream = tokio::select! {
                _ = &mut shutdown => {
                    info!(operation = "shutdown", "No longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(operation = "accept_connection", error = %err, "Error accepting connection");
                    continue;
                }
            };
            connection_count += 1;
            debug!(operation = "accept_connection", connection_count, "Accepted connection");

            let session =
                Session::with_budget(self.config.clone(), self.backend.clone(), self.budget.clone());
            tokio::spawn(async move {
                let result = match stream {
                    Stream::Unix(s) => {
                        let (r, w) = s.into_split();
                        serve_connection(r, w, session).await
                    }
                    Stream::Tcp(s) => {
                        let (r, w) = s.into_split();
                        serve_connection(r, w, session).await
                    }
                };
                match result {
                    Ok(()) => debug!(operation = "close_connection", connection_count, "Connection closed"),
                    Err(err) => error!(operation = "handle_client", connection_count, error = %err, "Connection failed"),
                }
            });
        }
        Ok(())
    }
}

fn frame_codec(max_frame: u32) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        // The size field counts itself, and it stays in the frame.
        .length_adjustment(0)
        .num_skip(0)
        .little_endian()
        .max_frame_length(max_frame as usize)
        .new_codec()
}

/// Run one connection to completion. The session is shut down and every fid
/// released before this returns.
pub async fn serve_connection<R, W>(reader: R, writer: W, session: Arc<Session>) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(reader, frame_codec(session.config().msize));
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, BytesCodec::new());
        while let Some(frame) = rx.recv().await {
            sink.send(frame).await?;
        }
        Ok::<_, io::Error>(())
    });

    let dispatcher = Dispatcher::new(session.clone(), Arc::new(tx));
    let read_result = loop {
        match frames.next().await {
            // A size below 4 cannot even cover the size field; nothing was consumed.
            Some(Ok(frame)) if frame.len() < 4 => {
                break Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame size {} is smaller than its size field", frame.len()),
                ));
            }
            Some(Ok(frame)) if frame.len() < HEADER_SIZE => {
                warn!(len = frame.len(), "Frame shorter than its header");
            }
            Some(Ok(frame)) => {
                dispatcher.submit(frame.freeze());
            }
            Some(Err(err)) => break Err(err),
            None => break Ok(()),
        }
    };
    drop(dispatcher);

    session.shutdown().await;
    let write_result = match writer_task.await {
        Ok(result) => result,
        Err(err) => Err(io::Error::other(err)),
    };
    read_result.and(write_result)
}
