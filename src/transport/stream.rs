//! Byte-stream transport using newline-delimited JSON framing

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use super::{
    CloseListener, CloseSignal, InboundMessage, ListenerId, ListenerSet, MessageListener, MessageTransport,
    TransferList,
};
use crate::bridge::Envelope;
use crate::utils::{BridgeError, Result};

/// Transport over any async byte stream (pipe, socket, stdio).
///
/// Each envelope is one JSON document followed by `\n`. Transfer hints are
/// ignored: buffers already travel inline in the payload. End of stream or an
/// I/O error on either half closes the transport.
pub struct StreamTransport {
    outbound: UnboundedSender<String>,
    listeners: Arc<ListenerSet>,
    closed: Arc<CloseSignal>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl StreamTransport {
    /// Start reading from `reader` and writing to `writer`.
    ///
    /// `peer_origin` is stamped on every inbound message, since a stream is
    /// point-to-point and carries no origin of its own.
    pub fn new<R, W>(reader: R, writer: W, peer_origin: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let listeners = Arc::new(ListenerSet::default());
        let closed = Arc::new(CloseSignal::default());
        let (outbound, mut queue) = unbounded_channel::<String>();
        let peer_origin = peer_origin.into();

        let reader_task = {
            let listeners = Arc::clone(&listeners);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                let reason = loop {
                    match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match Envelope::from_json(&line) {
                            Ok(envelope) => {
                                listeners.dispatch(InboundMessage {
                                    origin: peer_origin.clone(),
                                    envelope,
                                    transfers: TransferList::new(),
                                });
                            }
                            Err(e) => log::warn!("StreamTransport: dropping malformed frame: {}", e),
                        },
                        Ok(None) => {
                            log::debug!("StreamTransport: peer closed the stream");
                            break "peer closed the stream".to_string();
                        }
                        Err(e) => {
                            log::warn!("StreamTransport: read failed: {}", e);
                            break format!("read failed: {}", e);
                        }
                    }
                };
                closed.fire(&reason);
            })
        };

        let writer_task = {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut writer = writer;
                while let Some(frame) = queue.recv().await {
                    let written = async {
                        writer.write_all(frame.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    };
                    if let Err(e) = written.await {
                        log::warn!("StreamTransport: write failed: {}", e);
                        closed.fire(&format!("write failed: {}", e));
                        return;
                    }
                }
                closed.fire("stream writer stopped");
            })
        };

        Self {
            outbound,
            listeners,
            closed,
            reader_task,
            writer_task,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Stop both pump tasks and notify close listeners
    pub fn close(&self) {
        self.closed.fire("stream closed");
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl MessageTransport for StreamTransport {
    fn send(&self, envelope: Envelope, _transfers: TransferList) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::TransportUnavailable("stream closed".to_string()));
        }
        let frame = envelope.to_json()?;
        self.outbound
            .send(frame)
            .map_err(|_| BridgeError::TransportUnavailable("stream writer stopped".to_string()))
    }

    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn add_close_listener(&self, listener: CloseListener) -> ListenerId {
        self.closed.add(listener)
    }

    fn remove_close_listener(&self, id: ListenerId) {
        self.closed.remove(id);
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EndpointId;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_stream_pair_exchanges_envelopes() {
        let (left, right) = duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);

        let host = StreamTransport::new(left_read, left_write, "https://guest.example.com");
        let guest = StreamTransport::new(right_read, right_write, "chrome://panel");

        let (tx, mut rx) = mpsc::unbounded_channel();
        guest.add_listener(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));

        let env = Envelope::request("echo", 1, EndpointId::new(), json!({"msg": "line\nbreak"}));
        host.send(env.clone(), TransferList::new()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.origin, "chrome://panel");
        assert_eq!(received.envelope, env);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (mut raw, theirs) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(theirs);
        let transport = StreamTransport::new(read_half, write_half, "https://peer.example");

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.add_listener(Arc::new(move |msg| {
            let _ = tx.send(msg.envelope.request_type);
        }));

        let good = Envelope::request("ok", 2, EndpointId::new(), json!(null)).to_json().unwrap();
        raw.write_all(b"{not json}\n\n").await.unwrap();
        raw.write_all(format!("{}\n", good).as_bytes()).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("ok"));

        transport
            .send(Envelope::request("out", 3, EndpointId::new(), json!(1)), TransferList::new())
            .unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        while !collected.ends_with(b"\n") {
            let n = raw.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended before a full frame arrived");
            collected.extend_from_slice(&buf[..n]);
        }
        let line = std::str::from_utf8(&collected).unwrap();
        assert_eq!(Envelope::from_json(line.trim_end()).unwrap().request_type, "out");
    }

    #[tokio::test]
    async fn test_peer_eof_closes_transport() {
        let (left, right) = duplex(256);
        let (r, w) = tokio::io::split(left);
        let transport = StreamTransport::new(r, w, "https://peer.example");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.add_close_listener(Arc::new(move |reason: &str| {
            let _ = tx.send(reason.to_string());
        }));

        drop(right);
        assert_eq!(rx.recv().await.as_deref(), Some("peer closed the stream"));
        assert!(transport.is_closed());
        assert!(matches!(
            transport.send(Envelope::request("x", 1, EndpointId::new(), json!(null)), TransferList::new()),
            Err(BridgeError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (left, _right) = duplex(64);
        let (r, w) = tokio::io::split(left);
        let transport = StreamTransport::new(r, w, "https://peer.example");
        transport.close();
        assert!(transport
            .send(Envelope::request("x", 1, EndpointId::new(), json!(null)), TransferList::new())
            .is_err());
    }
}
