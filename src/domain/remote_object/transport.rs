//! Point-to-point request/reply messaging.
//!
//! A server process binds exactly one [`ReplyEndpoint`]; every proxy owns one
//! [`RequestChannel`] connected to it. Each channel strictly alternates:
//! a request must be answered before the next one is sent on that channel.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::domain::remote_object::codec::FrameCodec;

pub struct ReplyEndpoint {
    listener: TcpListener,
    port: u16,
    max_frame_length: usize,
}

impl ReplyEndpoint {
    /// Binds on the loopback interface. `None` or `Some(0)` lets the OS pick a free port.
    pub async fn bind(port: Option<u16>, max_frame_length: usize) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port.unwrap_or(0))).await?;
        let port = listener.local_addr()?.port();
        log::debug!("Reply endpoint bound on port {}", port);
        Ok(Self { listener, port, max_frame_length })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> io::Result<ReplyChannel> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(ReplyChannel { framed: Framed::new(stream, FrameCodec::new(self.max_frame_length)), peer })
    }
}

/// Server side of one channel.
pub struct ReplyChannel {
    framed: Framed<TcpStream, FrameCodec>,
    peer: SocketAddr,
}

impl ReplyChannel {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next request, or `None` once the peer closed the channel.
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.framed.next().await.transpose()
    }

    pub async fn reply(&mut self, payload: Bytes) -> io::Result<()> {
        self.framed.send(payload).await
    }
}

/// Client side of one channel.
pub struct RequestChannel {
    framed: Framed<TcpStream, FrameCodec>,
    awaiting_reply: bool,
}

impl RequestChannel {
    pub async fn connect(port: u16, max_frame_length: usize) -> io::Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self { framed: Framed::new(stream, FrameCodec::new(max_frame_length)), awaiting_reply: false })
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub async fn send(&mut self, payload: Bytes) -> io::Result<()> {
        if self.awaiting_reply {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "previous request on this channel is still unanswered"));
        }
        self.framed.send(payload).await?;
        self.awaiting_reply = true;
        Ok(())
    }

    /// Waits for the reply to the last request. Cancel-safe: dropping the
    /// future keeps any partially received frame buffered.
    pub async fn recv(&mut self) -> io::Result<Bytes> {
        match self.framed.next().await {
            Some(Ok(frame)) => {
                self.awaiting_reply = false;
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the channel")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply_alternation() {
        let endpoint = ReplyEndpoint::bind(None, 1024).await.unwrap();
        let port = endpoint.port();

        let server = tokio::spawn(async move {
            let mut channel = endpoint.accept().await.unwrap();
            while let Some(request) = channel.recv().await.unwrap() {
                let mut answer = b"re:".to_vec();
                answer.extend_from_slice(&request);
                channel.reply(Bytes::from(answer)).await.unwrap();
            }
        });

        let mut channel = RequestChannel::connect(port, 1024).await.unwrap();
        channel.send(Bytes::from_static(b"one")).await.unwrap();
        assert!(channel.awaiting_reply());

        let second = channel.send(Bytes::from_static(b"two")).await;
        assert!(second.is_err(), "a second request before the reply must be refused");

        assert_eq!(&channel.recv().await.unwrap()[..], b"re:one");
        channel.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&channel.recv().await.unwrap()[..], b"re:two");

        drop(channel);
        server.await.unwrap();
    }
}
