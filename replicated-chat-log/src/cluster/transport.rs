//! TCP delivery of raft messages between nodes.
//!
//! Every message travels on its own short-lived connection as one frame:
//!
//! - 4 bytes: sender address length (big-endian u32)
//! - N bytes: sender address (UTF-8)
//! - 4 bytes: message length (big-endian u32)
//! - M bytes: protobuf-encoded raft `Message`
//!
//! The sender address lets a node that has not yet applied its own membership
//! answer the leader that is replicating to it.
//!
//! Two kinds of threads keep I/O off the raft worker:
//!
//! - **Listener thread**: accepts connections and spawns a short-lived reader
//!   per connection that forwards the decoded message to the worker
//! - **Sender thread**: drains the [`Outbox`] and writes each frame, so a slow
//!   or unreachable peer never blocks the raft event loop

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

use super::ClusterError;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames larger than this are rejected before allocating.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A raft message together with the address its sender listens on.
#[derive(Debug)]
pub struct Inbound {
    pub from_address: String,
    pub message: Message,
}

/// Running listener; stopping it releases the bound port.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stops accepting and waits for the listener thread to exit.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            let loopback: IpAddr = match wake {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            wake.set_ip(loopback);
        }
        let _ = TcpStream::connect_timeout(&wake, CONNECT_TIMEOUT);
        if thread.join().is_err() {
            warn!(addr = %self.local_addr, "raft listener thread panicked");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns a background thread accepting raft traffic on `listener`.
///
/// Each connection gets its own short-lived reader thread that decodes one
/// frame and forwards it to `tx`.
pub fn spawn_listener(
    listener: TcpListener,
    tx: Sender<Inbound>,
) -> Result<ListenerHandle, ClusterError> {
    let local_addr = listener.local_addr().map_err(ClusterError::Transport)?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread = thread::Builder::new()
        .name(format!("raft-net-listener-{local_addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "raft connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "raft accept error"),
                }
            }
        })?;

    Ok(ListenerHandle {
        local_addr,
        stop,
        thread: Some(thread),
    })
}

fn read_chunk(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a single frame from a connection and forwards it to the worker.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> io::Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let from_address = String::from_utf8(read_chunk(&mut stream)?)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let buf = read_chunk(&mut stream)?;
    let message =
        Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    tx.send(Inbound {
        from_address,
        message,
    })
    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    Ok(())
}

/// Encodes one frame.
pub fn encode_frame(from_address: &str, message: &Message) -> Vec<u8> {
    let body = message.encode_to_vec();
    let mut frame = Vec::with_capacity(8 + from_address.len() + body.len());
    frame.extend_from_slice(&(from_address.len() as u32).to_be_bytes());
    frame.extend_from_slice(from_address.as_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Queue of outbound messages drained by the sender thread.
///
/// Dropping every `Outbox` clone ends the sender thread.
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<(String, Vec<u8>)>,
    from_address: String,
}

impl Outbox {
    /// Queues `message` for `address`. Never blocks.
    pub fn send(&self, address: &str, message: &Message) {
        let frame = encode_frame(&self.from_address, message);
        if self.tx.send((address.to_string(), frame)).is_err() {
            warn!(to = address, "raft sender thread gone, dropping message");
        }
    }
}

/// Spawns the sender thread writing frames on behalf of `from_address`.
pub fn spawn_sender(from_address: String) -> Result<Outbox, ClusterError> {
    let (tx, rx): (_, Receiver<(String, Vec<u8>)>) = unbounded();
    thread::Builder::new()
        .name(format!("raft-net-sender-{from_address}"))
        .spawn(move || {
            for (address, frame) in rx {
                if let Err(err) = try_send(&address, &frame) {
                    debug!(to = %address, error = %err, "failed to send raft message");
                }
            }
        })?;
    Ok(Outbox { tx, from_address })
}

/// Opens a connection, writes one frame, closes the connection.
fn try_send(address: &str, frame: &[u8]) -> io::Result<()> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.write_all(frame)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    #[test]
    fn frame_delivers_message_and_sender_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = unbounded();
        let mut handle = spawn_listener(listener, tx).unwrap();

        let mut message = Message::default();
        message.set_msg_type(MessageType::MsgHeartbeat);
        message.from = 3;
        message.to = 4;
        message.term = 9;
        let outbox = spawn_sender("127.0.0.1:7003".to_string()).unwrap();
        outbox.send(&addr.to_string(), &message);

        let inbound = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(inbound.from_address, "127.0.0.1:7003");
        assert_eq!(inbound.message, message);

        handle.stop();
        // The port is released once stopped.
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = unbounded();
        let _handle = spawn_listener(listener, tx).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&u32::MAX.to_be_bytes()).unwrap();
        drop(stream);

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
