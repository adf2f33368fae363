//! Server-side PTY master pump: reads shell output and forwards it
//! encrypted over the transport. Generic over the reader so that tests
//! can stand a plain pipe in for the real PTY master fd.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::codec::Packet;
use crate::crypto::Cipher;
use crate::error::Result;
use crate::state::server::DATA_CHANNEL;
use crate::transport::{ChannelId, FrameSink, SendFlags};

const READ_BUFFER: usize = 4096;

/// Owns the background task reading from the PTY master. Dropping the
/// pump without calling `stop` leaves the task running until the next
/// read fails (the transport going away eventually does that); `stop` is
/// the clean, awaited shutdown path used on disconnect.
pub struct PtyPump {
    stopped: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PtyPump {
    pub fn spawn<R, S>(mut reader: R, cipher: Arc<Cipher>, transport: Arc<S>, peer: SocketAddr) -> PtyPump
    where
        R: AsyncRead + Unpin + Send + 'static,
        S: FrameSink + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let task_stopped = stopped.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; READ_BUFFER];
            loop {
                if task_stopped.load(Ordering::Acquire) {
                    return;
                }
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if task_stopped.load(Ordering::Acquire) {
                            return;
                        }
                        let packet = Packet::bytes(buf[..n].to_vec());
                        let frame = cipher.encrypt(&packet.serialize());
                        if transport
                            .send_frame(peer, &frame, DATA_CHANNEL, SendFlags::Reliable)
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });
        PtyPump { stopped, handle }
    }

    /// Stops the pump: no read already in flight is allowed to produce a
    /// further send, and the task is aborted and awaited so the caller
    /// knows the PTY master fd is no longer being read from.
    pub async fn stop(self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.abort();
        let _ = self.handle.await;
    }
}
