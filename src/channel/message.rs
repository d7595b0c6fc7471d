// Control-message framing. Every frame is a fixed header (magic + body
// size) followed by a typed JSON body. Writes are deadline-bounded and
// retried on EAGAIN/EINTR; receive runs a two-state machine over a growing
// buffer so arbitrarily split reads reassemble into identical frames.

use std::io::Write;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Result, Status};

pub const MAGIC: u32 = 0xA1B2_C3D4;
pub const HEADER_LEN: usize = 4 + 8;
pub const TYPE_TAG_LEN: usize = 4;

/// Writes that hit EAGAIN keep retrying until the caller's deadline; this
/// bounds each sleep between attempts.
const WRITE_RETRY_PAUSE: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsgType {
    HeartBeat = 1,
    BufferReq = 2,
    BufferResp = 3,
    LinkReq = 10,
    LinkResp = 11,
    UnlinkReq = 12,
    UnlinkResp = 13,
}

impl ControlMsgType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::HeartBeat),
            2 => Some(Self::BufferReq),
            3 => Some(Self::BufferResp),
            10 => Some(Self::LinkReq),
            11 => Some(Self::LinkResp),
            12 => Some(Self::UnlinkReq),
            13 => Some(Self::UnlinkResp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub msg: char,
}

impl Default for HeartbeatMsg {
    fn default() -> Self {
        Self { msg: 'H' }
    }
}

/// Direction of a staged transfer, as carried on the wire. `R` marks the
/// remote side: `WriteD2Rh` writes local device memory to remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TransferType {
    WriteH2Rh = 1,
    ReadRh2H = 2,
    WriteH2Rd = 3,
    ReadRh2D = 4,
    WriteD2Rh = 5,
    ReadRd2H = 6,
    WriteD2Rd = 7,
    ReadRd2D = 8,
}

impl From<TransferType> for i32 {
    fn from(value: TransferType) -> Self {
        value as i32
    }
}

impl TryFrom<i32> for TransferType {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::WriteH2Rh),
            2 => Ok(Self::ReadRh2H),
            3 => Ok(Self::WriteH2Rd),
            4 => Ok(Self::ReadRh2D),
            5 => Ok(Self::WriteD2Rh),
            6 => Ok(Self::ReadRd2H),
            7 => Ok(Self::WriteD2Rd),
            8 => Ok(Self::ReadRd2D),
            other => Err(format!("unknown transfer type {other}")),
        }
    }
}

impl TransferType {
    /// The direction the responder runs to serve this request.
    pub fn reverse(&self) -> TransferType {
        match self {
            TransferType::WriteH2Rh => TransferType::ReadRh2H,
            TransferType::ReadRh2H => TransferType::WriteH2Rh,
            TransferType::WriteH2Rd => TransferType::ReadRh2D,
            TransferType::ReadRh2D => TransferType::WriteH2Rd,
            TransferType::WriteD2Rh => TransferType::ReadRd2H,
            TransferType::ReadRd2H => TransferType::WriteD2Rh,
            TransferType::WriteD2Rd => TransferType::ReadRd2D,
            TransferType::ReadRd2D => TransferType::WriteD2Rd,
        }
    }
}

/// Which stage of the staged-transfer protocol a `BufferReq` drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ReqPhase {
    /// Fresh request: allocate staging and start serving.
    First,
    /// Follow-up after the requester filled a staging buffer.
    Second,
    /// Book-keeping not tied to a specific buffer (completion, cancel).
    Ctrl,
}

impl From<ReqPhase> for u32 {
    fn from(value: ReqPhase) -> Self {
        value as u32
    }
}

impl TryFrom<u32> for ReqPhase {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            2 => Ok(Self::Ctrl),
            other => Err(format!("unknown request phase {other}")),
        }
    }
}

/// Staged-transfer request: the requester describes the cache addresses it
/// wants served and where its own staging buffer lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferReq {
    pub transfer_type: TransferType,
    pub phase: ReqPhase,
    pub req_id: u64,
    /// Remaining budget in microseconds.
    pub timeout: u64,
    pub src_addrs: Vec<u64>,
    pub buffer_addr: u64,
    /// Requester-side ready flag the responder signals after filling.
    pub flag_addr: u64,
    pub dst_addrs: Vec<u64>,
    pub buffer_lens: Vec<u64>,
    pub total_buffer_len: u64,
    /// Local bookkeeping, never serialised.
    #[serde(skip)]
    pub local_buffer_addr: u64,
}

/// Responder's answer: which staging buffer the peer may read and the flag
/// byte to toggle when the buffer may be refilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferResp {
    pub transfer_type: TransferType,
    pub req_id: u64,
    pub timeout: u64,
    pub ret_code: u32,
    pub src_addrs: Vec<u64>,
    pub buffer_addr: u64,
    pub flag_addr: u64,
    pub buffer_lens: Vec<u64>,
}

/// Serialises one frame: header, type tag, JSON body.
pub fn encode_frame<T: Serialize>(msg_type: ControlMsgType, msg: &T) -> Result<Bytes> {
    let body =
        serde_json::to_vec(msg).map_err(|e| Status::ParamInvalid(format!("encode body: {e}")))?;
    let body_size = (TYPE_TAG_LEN + body.len()) as u64;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body_size as usize);
    frame.extend_from_slice(&MAGIC.to_le_bytes());
    frame.extend_from_slice(&body_size.to_le_bytes());
    frame.extend_from_slice(&(msg_type as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Status::ParamInvalid(format!("decode body: {e}")))
}

/// Writes the whole frame before `deadline`. EAGAIN and EINTR retry;
/// EPIPE/EBADF-class errors are terminal and map to `NotConnected` so the
/// caller never retries them.
pub fn write_frame(stream: &mut impl Write, frame: &[u8], deadline: Instant) -> Result<()> {
    let mut written = 0usize;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => {
                warn!(
                    expected = frame.len(),
                    actual = written,
                    "socket write incomplete"
                );
                return Err(Status::Failed("socket wrote zero bytes".into()));
            }
            Ok(n) => written += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                if Instant::now() >= deadline {
                    return Err(Status::Timeout);
                }
                std::thread::sleep(WRITE_RETRY_PAUSE);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    || e.kind() == std::io::ErrorKind::NotConnected
                    || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                return Err(Status::NotConnected);
            }
            Err(e) => return Err(Status::Io(e.to_string())),
        }
        if Instant::now() >= deadline && written < frame.len() {
            return Err(Status::Timeout);
        }
    }
    Ok(())
}

/// Convenience: encode and write one message under a deadline.
pub fn send_msg<T: Serialize>(
    stream: &mut impl Write,
    msg_type: ControlMsgType,
    msg: &T,
    deadline: Instant,
) -> Result<()> {
    let frame = encode_frame(msg_type, msg)?;
    write_frame(stream, &frame, deadline)
}

/// Reads exactly one frame from a blocking socket before `deadline`,
/// returning any extra bytes read past the frame so the caller can seed the
/// connection's long-lived framer with them. Used by the link handshake,
/// which runs before a socket joins the poll loop.
pub fn read_frame_blocking(
    stream: &mut std::net::TcpStream,
    deadline: Instant,
) -> Result<(Frame, Bytes)> {
    let mut framer = Framer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Status::Timeout);
        }
        stream.set_read_timeout(Some(remaining))?;
        match std::io::Read::read(stream, &mut chunk) {
            Ok(0) => return Err(Status::NotConnected),
            Ok(n) => {
                framer.extend(&chunk[..n]);
                if let Some(frame) = framer.next_frame()? {
                    let leftover = framer.buf.split().freeze();
                    return Ok((frame, leftover));
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(Status::Io(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    WaitingForHeader,
    WaitingForBody,
}

/// A decoded frame: the raw type tag plus its body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: i32,
    pub body: Bytes,
}

/// Two-state reassembly machine. Feed it every chunk the socket yields;
/// pull frames until it returns `None`.
#[derive(Debug)]
pub struct Framer {
    state: RecvState,
    buf: BytesMut,
    expected_body: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            state: RecvState::WaitingForHeader,
            buf: BytesMut::new(),
            expected_body: 0,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` if more bytes are needed. A magic
    /// mismatch is unrecoverable for this connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                RecvState::WaitingForHeader => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let magic = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
                    if magic != MAGIC {
                        return Err(Status::Failed(format!(
                            "invalid magic {magic:#x} on control stream"
                        )));
                    }
                    let body_size = u64::from_le_bytes(self.buf[4..12].try_into().unwrap());
                    if (body_size as usize) < TYPE_TAG_LEN {
                        return Err(Status::Failed(format!(
                            "control frame body of {body_size} bytes is too small"
                        )));
                    }
                    self.buf.advance(HEADER_LEN);
                    self.expected_body = body_size as usize;
                    self.state = RecvState::WaitingForBody;
                }
                RecvState::WaitingForBody => {
                    if self.buf.len() < self.expected_body {
                        return Ok(None);
                    }
                    let mut body = self.buf.split_to(self.expected_body);
                    let msg_type = i32::from_le_bytes(body[0..4].try_into().unwrap());
                    body.advance(TYPE_TAG_LEN);
                    self.state = RecvState::WaitingForHeader;
                    return Ok(Some(Frame {
                        msg_type,
                        body: body.freeze(),
                    }));
                }
            }
        }
    }
}

/// Messages the channel receive loop understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Heartbeat(HeartbeatMsg),
    BufferReq(BufferReq),
    BufferResp(BufferResp),
    /// Unknown types are tolerated for forward compatibility.
    Unknown(i32),
}

pub fn decode_control(frame: &Frame) -> Result<ControlMessage> {
    match ControlMsgType::from_i32(frame.msg_type) {
        Some(ControlMsgType::HeartBeat) => Ok(ControlMessage::Heartbeat(decode_body(&frame.body)?)),
        Some(ControlMsgType::BufferReq) => Ok(ControlMessage::BufferReq(decode_body(&frame.body)?)),
        Some(ControlMsgType::BufferResp) => {
            Ok(ControlMessage::BufferResp(decode_body(&frame.body)?))
        }
        _ => Ok(ControlMessage::Unknown(frame.msg_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_req() -> BufferReq {
        BufferReq {
            transfer_type: TransferType::ReadRd2H,
            phase: ReqPhase::First,
            req_id: 42,
            timeout: 1_000_000,
            src_addrs: vec![0x1000, 0x2000],
            buffer_addr: 0x9000,
            flag_addr: 0x9F00,
            dst_addrs: vec![0x3000],
            buffer_lens: vec![512, 512],
            total_buffer_len: 1024,
            local_buffer_addr: 0,
        }
    }

    #[test]
    fn frame_round_trips() {
        let req = sample_req();
        let frame = encode_frame(ControlMsgType::BufferReq, &req).unwrap();
        let mut framer = Framer::new();
        framer.extend(&frame);
        let decoded = framer.next_frame().unwrap().unwrap();
        assert_eq!(decoded.msg_type, ControlMsgType::BufferReq as i32);
        match decode_control(&decoded).unwrap() {
            ControlMessage::BufferReq(out) => assert_eq!(out, req),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn reassembles_any_chunk_split() {
        let req = sample_req();
        let hb = HeartbeatMsg::default();
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(ControlMsgType::BufferReq, &req).unwrap());
        stream.extend_from_slice(&encode_frame(ControlMsgType::HeartBeat, &hb).unwrap());

        for chunk_size in [1usize, 2, 3, 5, 7, 11, 64, stream.len()] {
            let mut framer = Framer::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                framer.extend(chunk);
                while let Some(frame) = framer.next_frame().unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 2, "chunk size {chunk_size}");
            assert_eq!(
                decode_control(&frames[0]).unwrap(),
                ControlMessage::BufferReq(req.clone())
            );
            assert_eq!(
                decode_control(&frames[1]).unwrap(),
                ControlMessage::Heartbeat(hb.clone())
            );
        }
    }

    #[test]
    fn invalid_magic_is_terminal() {
        let mut framer = Framer::new();
        framer.extend(&[0u8; HEADER_LEN]);
        assert!(framer.next_frame().is_err());
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let hb = HeartbeatMsg::default();
        let mut frame = BytesMut::from(&encode_frame(ControlMsgType::HeartBeat, &hb).unwrap()[..]);
        // Rewrite the type tag to something undefined.
        frame[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&99i32.to_le_bytes());
        let mut framer = Framer::new();
        framer.extend(&frame);
        let decoded = framer.next_frame().unwrap().unwrap();
        assert_eq!(decode_control(&decoded).unwrap(), ControlMessage::Unknown(99));
    }

    #[test]
    fn write_frame_respects_deadline() {
        struct AlwaysBlocked;
        impl Write for AlwaysBlocked {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = write_frame(&mut AlwaysBlocked, b"abc", deadline).unwrap_err();
        assert_eq!(err, Status::Timeout);
    }

    #[test]
    fn broken_pipe_is_not_retried() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            write_frame(&mut Broken, b"abc", deadline).unwrap_err(),
            Status::NotConnected
        );
    }

    #[test]
    fn transfer_type_reverse_pairs() {
        use TransferType::*;
        for t in [WriteH2Rh, ReadRh2H, WriteH2Rd, ReadRh2D, WriteD2Rh, ReadRd2H, WriteD2Rd, ReadRd2D]
        {
            assert_eq!(t.reverse().reverse(), t);
        }
    }
}
