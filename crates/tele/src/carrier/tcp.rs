//! TCP carrier. Each chunk travels as `[Len: 4b LE][Body: Len]`.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;

use crate::carrier::Carrier;
use crate::carrier::CarrierListener;
use crate::carrier::Error;
use crate::carrier::Link;
use crate::carrier::LinkRx;
use crate::carrier::LinkTx;
use crate::carrier::Result;
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct TcpCarrier {
    max_frame_len: usize,
}

impl TcpCarrier {
    pub fn new(config: &Config) -> Self {
        Self { max_frame_len: config.max_frame_len }
    }

    fn link(&self, stream: TcpStream) -> Result<Link> {
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        Ok(Link {
            tx: Box::new(TcpTx { w, max_frame_len: self.max_frame_len }),
            rx: Box::new(TcpRx { r: BufReader::new(r), max_frame_len: self.max_frame_len }),
        })
    }
}

impl Default for TcpCarrier {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

#[async_trait::async_trait]
impl Carrier for TcpCarrier {
    async fn dial(&self, addr: &str) -> Result<Link> {
        let stream = TcpStream::connect(addr).await?;
        self.link(stream)
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn CarrierListener>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpCarrierListener { listener, carrier: self.clone() }))
    }
}

struct TcpCarrierListener {
    listener: TcpListener,
    carrier: TcpCarrier,
}

#[async_trait::async_trait]
impl CarrierListener for TcpCarrierListener {
    async fn accept(&mut self) -> Result<Link> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::trace!(%peer, "tcp carrier accepted");
        self.carrier.link(stream)
    }

    fn addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

struct TcpTx {
    w: OwnedWriteHalf,
    max_frame_len: usize,
}

#[async_trait::async_trait]
impl LinkTx for TcpTx {
    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let len = match u32::try_from(chunk.len()) {
            Ok(len) if chunk.len() <= self.max_frame_len => len,
            _ => return Err(Error::FrameTooLarge(chunk.len())),
        };
        let mut frame = Vec::with_capacity(4 + chunk.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(chunk);
        self.w.write_all(&frame).await?;
        Ok(())
    }
}

struct TcpRx {
    r: BufReader<OwnedReadHalf>,
    max_frame_len: usize,
}

#[async_trait::async_trait]
impl LinkRx for TcpRx {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.r.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len];
        self.r.read_exact(&mut body).await?;
        Ok(Some(body))
    }
}
