//! Radio transport contract and the two link implementations.
//!
//! The core only ever talks to a [`Transport`]: it hands over opaque frames
//! and polls for received ones. Every transmit goes through [`transmit`],
//! which puts the radio back into receive mode whether or not the send
//! succeeded.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::{debug, warn};

/// Signal quality of the last hop a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkQuality {
    pub rssi: i32,
    pub snr: f32,
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self {
            rssi: -70,
            snr: 9.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub frame: Vec<u8>,
    pub link: LinkQuality,
}

pub trait Transport: Send {
    /// Best-effort transmit. `false` means the local radio refused the frame.
    fn send(&mut self, frame: &[u8]) -> bool;

    /// Non-blocking; `None` when nothing is waiting.
    fn receive(&mut self) -> Option<Received>;

    /// Put the radio back into continuous receive. Idempotent.
    fn set_receive_mode(&mut self);
}

/// Send one frame and return the radio to receive mode.
pub fn transmit<T: Transport + ?Sized>(radio: &mut T, frame: &[u8]) -> bool {
    let ok = radio.send(frame);
    radio.set_receive_mode();
    ok
}

// ---------------------------------------------------------------------------
// In-memory medium
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MediumInner {
    inboxes: HashMap<u8, VecDeque<Received>>,
    links: HashMap<u8, Vec<(u8, LinkQuality)>>,
}

/// Shared in-process "air". Frames sent by a radio reach every radio it
/// has a link to, regardless of the packet's destination.
#[derive(Clone, Default)]
pub struct Medium {
    inner: Arc<Mutex<MediumInner>>,
}

impl Medium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, id: u8) -> MemoryRadio {
        self.inner.lock().inboxes.entry(id).or_default();
        MemoryRadio {
            id,
            medium: self.clone(),
            control: Arc::new(Mutex::new(RadioControl {
                receiving: true,
                ..RadioControl::default()
            })),
        }
    }

    /// Bidirectional link between two radios.
    pub fn link(&self, a: u8, b: u8, quality: LinkQuality) {
        let mut inner = self.inner.lock();
        inner.links.entry(a).or_default().push((b, quality));
        inner.links.entry(b).or_default().push((a, quality));
    }

    /// Drop a frame straight into one radio's inbox.
    pub fn inject(&self, to: u8, frame: Vec<u8>, link: LinkQuality) {
        self.inner
            .lock()
            .inboxes
            .entry(to)
            .or_default()
            .push_back(Received { frame, link });
    }

    pub fn pending(&self, id: u8) -> usize {
        self.inner.lock().inboxes.get(&id).map_or(0, VecDeque::len)
    }

    fn broadcast(&self, from: u8, frame: &[u8]) {
        let mut inner = self.inner.lock();
        let neighbours = inner.links.get(&from).cloned().unwrap_or_default();
        for (to, link) in neighbours {
            inner.inboxes.entry(to).or_default().push_back(Received {
                frame: frame.to_vec(),
                link,
            });
        }
    }

    fn take(&self, id: u8) -> Option<Received> {
        self.inner.lock().inboxes.get_mut(&id)?.pop_front()
    }
}

#[derive(Debug, Default)]
struct RadioControl {
    receiving: bool,
    fail_sends: u32,
    send_attempts: u64,
    frames_sent: Vec<Vec<u8>>,
}

pub struct MemoryRadio {
    id: u8,
    medium: Medium,
    control: Arc<Mutex<RadioControl>>,
}

impl MemoryRadio {
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Observer that stays valid after the radio is moved into a service.
    pub fn tap(&self) -> RadioTap {
        RadioTap {
            control: Arc::clone(&self.control),
        }
    }
}

impl Transport for MemoryRadio {
    fn send(&mut self, frame: &[u8]) -> bool {
        {
            let mut control = self.control.lock();
            control.receiving = false;
            control.send_attempts += 1;
            if control.fail_sends > 0 {
                control.fail_sends -= 1;
                return false;
            }
            control.frames_sent.push(frame.to_vec());
        }
        self.medium.broadcast(self.id, frame);
        true
    }

    fn receive(&mut self) -> Option<Received> {
        self.medium.take(self.id)
    }

    fn set_receive_mode(&mut self) {
        self.control.lock().receiving = true;
    }
}

/// Failure injection and inspection for a [`MemoryRadio`].
#[derive(Clone)]
pub struct RadioTap {
    control: Arc<Mutex<RadioControl>>,
}

impl RadioTap {
    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.control.lock().fail_sends = n;
    }

    pub fn is_receiving(&self) -> bool {
        self.control.lock().receiving
    }

    pub fn send_attempts(&self) -> u64 {
        self.control.lock().send_attempts
    }

    /// Frames that actually left the radio.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.control.lock().frames_sent.clone()
    }
}

// ---------------------------------------------------------------------------
// UDP link
// ---------------------------------------------------------------------------

const UDP_BUF_LEN: usize = 512;

/// Radio stand-in over UDP: every send goes to each configured peer, which
/// models a broadcast medium where the mesh layer does the addressing.
pub struct UdpRadio {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    link: LinkQuality,
    buf: Vec<u8>,
}

impl UdpRadio {
    pub fn bind(addr: SocketAddr, peers: Vec<SocketAddr>, link: LinkQuality) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peers,
            link,
            buf: vec![0; UDP_BUF_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpRadio {
    fn send(&mut self, frame: &[u8]) -> bool {
        let mut ok = true;
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(frame, peer) {
                warn!(peer = %peer, error = %e, "udp send failed");
                ok = false;
            }
        }
        ok
    }

    fn receive(&mut self) -> Option<Received> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((n, from)) => {
                debug!(from = %from, len = n, "udp frame");
                Some(Received {
                    frame: self.buf[..n].to_vec(),
                    link: self.link,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                None
            }
        }
    }

    // Sockets are full duplex.
    fn set_receive_mode(&mut self) {}
}

// ===========================================================================
// Tests
// ===========================================================================
