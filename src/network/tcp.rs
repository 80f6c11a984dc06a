//! A TCP transport.
//!
//! A frame is one codec buffer: its little-endian `u32` size prefix tells the reader how many
//! bytes follow. A connection carries one request at a time, each followed by one response
//! frame. Idle connections are pooled per peer address.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::codec;
use crate::error::NetworkError;
use crate::messages::Envelope;
use crate::messages::Message;
use crate::network::RaftNetwork;
use crate::raft::Raft;
use crate::MessageSummary;
use crate::NodeId;

/// Read one frame and decode it.
///
/// `Ok(None)` means the peer closed the connection cleanly between frames.
pub(crate) async fn read_frame(stream: &mut TcpStream, max_frame_size: u64) -> Result<Option<Envelope>, NetworkError> {
    let mut prefix = [0u8; codec::SIZE_PREFIX_LEN];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = LittleEndian::read_u32(&prefix) as u64;
    if size > max_frame_size {
        return Err(NetworkError::FrameTooLarge(size));
    }

    let mut buf = vec![0u8; codec::SIZE_PREFIX_LEN + size as usize];
    buf[..codec::SIZE_PREFIX_LEN].copy_from_slice(&prefix);
    stream.read_exact(&mut buf[codec::SIZE_PREFIX_LEN..]).await?;

    let envelope = codec::decode(&buf)?;
    Ok(Some(envelope))
}

pub(crate) async fn write_frame(stream: &mut TcpStream, envelope: &Envelope) -> Result<(), NetworkError> {
    let buf = codec::encode(envelope);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// A `RaftNetwork` over TCP.
pub struct TcpNetwork {
    max_frame_size: u64,
    /// Idle connections by peer address.
    pool: Mutex<HashMap<String, Vec<TcpStream>>>,
}

impl TcpNetwork {
    pub fn new(max_frame_size: u64) -> Self {
        TcpNetwork {
            max_frame_size,
            pool: Mutex::new(HashMap::new()),
        }
    }

    fn take_idle(&self, addr: &str) -> Option<TcpStream> {
        let mut pool = self.pool.lock().ok()?;
        pool.get_mut(addr).and_then(|conns| conns.pop())
    }

    fn put_idle(&self, addr: &str, stream: TcpStream) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.entry(addr.to_string()).or_default().push(stream);
        }
    }

    async fn call(&self, stream: &mut TcpStream, envelope: &Envelope) -> Result<Option<Envelope>, NetworkError> {
        write_frame(stream, envelope).await?;
        read_frame(stream, self.max_frame_size).await
    }
}

#[async_trait]
impl RaftNetwork for TcpNetwork {
    async fn send(&self, target: &NodeId, addr: &str, envelope: Envelope) -> Result<Message, NetworkError> {
        // A pooled connection may have been closed by the peer meanwhile: try a fresh one then.
        if let Some(mut stream) = self.take_idle(addr) {
            if let Ok(Some(resp)) = self.call(&mut stream, &envelope).await {
                self.put_idle(addr, stream);
                return Ok(resp.message);
            }
        }

        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            tracing::debug!(%target, %addr, error = %e, "connect failed");
            NetworkError::Unreachable(target.clone())
        })?;
        stream.set_nodelay(true)?;

        match self.call(&mut stream, &envelope).await? {
            Some(resp) => {
                self.put_idle(addr, stream);
                Ok(resp.message)
            }
            None => Err(NetworkError::Remote(format!("{} closed the connection without a response", target))),
        }
    }
}

/// Accept connections on `listener` and hand every request frame to `raft`.
///
/// Runs until the listener fails. A malformed frame or a request the node can not answer closes
/// the connection it came on; it never affects the node.
pub async fn serve(listener: TcpListener, raft: Raft, max_frame_size: u64) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let raft = raft.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_conn(stream, &raft, max_frame_size).await {
                tracing::warn!(id = %raft.id(), %peer, error = %err, "connection closed");
            }
        });
    }
}

async fn serve_conn(mut stream: TcpStream, raft: &Raft, max_frame_size: u64) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;

    while let Some(req) = read_frame(&mut stream, max_frame_size).await? {
        tracing::trace!(from = %req.from, rpc = %req.message.summary(), "recv frame");

        let resp = raft.handle_rpc(req).await.map_err(|e| NetworkError::Remote(e.to_string()))?;
        write_frame(&mut stream, &Envelope::new(raft.id().clone(), resp)).await?;
    }
    Ok(())
}
