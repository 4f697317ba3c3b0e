use super::Channel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// TCP client channel.
pub struct TcpChannel {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpChannel {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::Connect { target: addr, source }),
            Err(_) => {
                return Err(Error::Connect {
                    target: addr,
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        // Small request/response exchanges; do not batch writes.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, error = %e, "Cannot disable Nagle on TCP channel");
        }
        debug!(%addr, "Connected TCP channel");
        Ok(Self {
            addr,
            stream: Some(stream),
        })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        Self {
            addr,
            stream: Some(stream),
        }
    }

    fn fail(&mut self, source: std::io::Error) -> Error {
        warn!(addr = %self.addr, error = %source, "TCP channel failed, closing");
        self.stream = None;
        Error::ChannelIo {
            target: self.addr.clone(),
            source,
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed(self.addr.clone()))?;
        let result = stream.write_all(data).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ChannelClosed(self.addr.clone()))?;
        let mut buf = vec![0u8; max.max(1)];
        let result = tokio::time::timeout(timeout, stream.read(&mut buf)).await;
        match result {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => {
                debug!(addr = %self.addr, "Peer closed TCP channel");
                self.stream = None;
                Err(Error::ChannelClosed(self.addr.clone()))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Ok(Err(e)) => Err(self.fail(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
            buf
        });

        let mut ch = TcpChannel::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ch.stream.as_ref().unwrap().nodelay().unwrap());
        ch.write(b"ping").await.unwrap();
        let reply = ch.read_exact(4, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"pong");
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_peer_close_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });
        let mut ch = TcpChannel::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();
        let err = ch.read(1, Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, Error::ChannelClosed(_)));
        let err = ch.write(b"x").await.err().unwrap();
        assert!(matches!(err, Error::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpChannel::connect("127.0.0.1", port, Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }
}
