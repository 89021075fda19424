//! Channel over one bidirectional QUIC stream

use p2ptunnel_proto::PeerId;
use p2ptunnel_transport::PeerChannel;
use quinn::{RecvStream, SendStream, VarInt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Application error code sent when a channel is reset
const RESET_CODE: u32 = 1;

#[derive(Debug)]
pub struct QuicChannel {
    send: SendStream,
    recv: RecvStream,
    remote: PeerId,
    id: u64,
}

impl QuicChannel {
    pub(crate) fn new(send: SendStream, recv: RecvStream, remote: PeerId, id: u64) -> Self {
        Self {
            send,
            recv,
            remote,
            id,
        }
    }
}

impl PeerChannel for QuicChannel {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn channel_id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self) {
        // Both fail only if that direction is already closed
        let _ = self.send.reset(VarInt::from_u32(RESET_CODE));
        let _ = self.recv.stop(VarInt::from_u32(RESET_CODE));
    }
}

impl AsyncRead for QuicChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf)
    }
}

impl AsyncWrite for QuicChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_flush(Pin::new(&mut this.send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        AsyncWrite::poll_shutdown(Pin::new(&mut this.send), cx)
    }
}
