use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashSet;

use crate::comm::address::MeshAddr;
use crate::comm::frame::{Frame, FrameHeader};
use crate::comm::secure::{Dialer, HandshakePhase, SecureStream};
use crate::gate::Gate;


/// [crate::comm::entropy::MockMeshEntropy] expectations attach to
///  process-wide contexts; a test that pins draws holds this for as long as
///  its expectations are live, so parallel tests cannot see them.
pub static ENTROPY_LOCK: Mutex<()> = Mutex::new(());

/// The read/write pumps trace every frame, which drowns test output fast.
///  Default to info and let RUST_LOG raise it when a failure needs the wire
///  chatter.
#[ctor::ctor]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init()
        .ok();
}


/// For nodes that never dial in a test.
pub struct NoDialer;

#[async_trait::async_trait]
impl Dialer for NoDialer {
    async fn dial(&self, _addr: &str) -> anyhow::Result<Box<dyn SecureStream>> {
        anyhow::bail!("dialing disabled in tests")
    }
}


struct ScriptState {
    input: VecDeque<Vec<u8>>,
    read_closed: bool,
    written: Vec<u8>,
    write_budget: usize,
    handshake_steps: u32,
}

/// An in-memory [SecureStream] driven by a test script: reads deliver one
///  queued chunk per call, writes are captured and can be throttled by a
///  byte budget, and the handshake completes after a configurable number of
///  pump calls.
pub struct ScriptedStream {
    state: Arc<Mutex<ScriptState>>,
}

/// The test's side of a [ScriptedStream].
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedStream {
    pub fn new() -> (ScriptedStream, ScriptHandle) {
        Self::with_handshake_steps(0)
    }

    pub fn with_handshake_steps(handshake_steps: u32) -> (ScriptedStream, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState {
            input: VecDeque::new(),
            read_closed: false,
            written: Vec::new(),
            write_budget: usize::MAX,
            handshake_steps,
        }));
        (
            ScriptedStream { state: state.clone() },
            ScriptHandle { state },
        )
    }
}

impl SecureStream for ScriptedStream {
    fn try_handshake(&mut self) -> io::Result<HandshakePhase> {
        let mut state = self.state.lock().unwrap();
        if state.handshake_steps > 0 {
            state.handshake_steps -= 1;
            Ok(HandshakePhase::Securing)
        } else {
            Ok(HandshakePhase::Ready)
        }
    }

    fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match state.input.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None if state.read_closed => Ok(0),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let n = buf.len().min(state.write_budget);
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.written.extend_from_slice(&buf[..n]);
        state.write_budget = state.write_budget.saturating_sub(n);
        Ok(n)
    }

    fn peer_description(&self) -> String {
        "scripted".to_string()
    }
}

impl ScriptHandle {
    pub fn push_input(&self, chunk: Vec<u8>) {
        self.state.lock().unwrap().input.push_back(chunk);
    }

    pub fn close_read(&self) {
        self.state.lock().unwrap().read_closed = true;
    }

    pub fn set_write_budget(&self, budget: usize) {
        self.state.lock().unwrap().write_budget = budget;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().unwrap().written.clear();
    }
}


/// Decodes a captured wire byte sequence back into frames, panicking on any
///  framing error.
pub fn decode_frames(bytes: &[u8]) -> Vec<Frame> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let mut frames = Vec::new();
    while buf.has_remaining() {
        let header = FrameHeader::try_deser(&mut buf).unwrap();
        let mut payload = buf.split_to(header.size as usize);
        frames.push(Frame::try_deser_payload(&header, &mut payload).unwrap());
    }
    frames
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentFrame {
    pub instance: u32,
    pub dof: u16,
    pub ds: u16,
    pub sof: u16,
    pub ss: u16,
    pub buf: Vec<u8>,
}

/// A gate that records what the forwarder delivers to it.
pub struct TestGate {
    pub ready: bool,
    local: Vec<MeshAddr>,
    instances: FxHashSet<MeshAddr>,
    sent: Arc<Mutex<Vec<SentFrame>>>,
}

/// The test's view of frames a [TestGate] received.
#[derive(Clone)]
pub struct GateSentHandle {
    sent: Arc<Mutex<Vec<SentFrame>>>,
}

impl TestGate {
    pub fn new(local: Vec<MeshAddr>, instances: Vec<MeshAddr>) -> (TestGate, GateSentHandle) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            TestGate {
                ready: true,
                local,
                instances: instances.into_iter().collect(),
                sent: sent.clone(),
            },
            GateSentHandle { sent },
        )
    }
}

impl Gate for TestGate {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn local_addrs(&self) -> &[MeshAddr] {
        &self.local
    }

    fn instances(&self) -> &FxHashSet<MeshAddr> {
        &self.instances
    }

    fn send_frame(&mut self, instance: u32, dof: u16, ds: u16, sof: u16, ss: u16, buf: &[u8]) {
        self.sent.lock().unwrap().push(SentFrame {
            instance,
            dof,
            ds,
            sof,
            ss,
            buf: buf.to_vec(),
        });
    }
}

impl GateSentHandle {
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }
}
