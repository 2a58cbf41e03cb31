//! tapdisk control messages
//!
//! Every request and response on a tapdisk control socket is one fixed-size
//! frame: a `u16` type, a `u16` cookie (the minor number), and a payload
//! area whose interpretation follows from the type. Scalars are host-native;
//! this is an intra-host contract between processes on the same machine.

use blktap_core::{Error, Result};
use bytes::{Buf, BufMut};

/// Longest path or string carried in a message, NUL terminator included
pub const MAX_PATH_LEN: usize = 256;

/// Payload area size in bytes
pub const PAYLOAD_SIZE: usize = 532;

/// Total frame size on the wire
pub const MESSAGE_SIZE: usize = 4 + PAYLOAD_SIZE;

/// Most minors a LIST_MINORS response can carry
pub const MAX_MINORS: usize = PAYLOAD_SIZE / 4 - 1;

bitflags::bitflags! {
    /// Flags carried in `OPEN` (and `RESUME`) params
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        const SHARED         = 0x001;
        const RDONLY         = 0x002;
        const ADD_CACHE      = 0x004;
        const VHD_INDEX      = 0x008;
        const LOG_DIRTY      = 0x010;
        const ADD_LCACHE     = 0x020;
        const REUSE_PRT      = 0x040;
        const SECONDARY      = 0x080;
        const STANDBY        = 0x100;
        /// A log-layer path trailer follows the frame
        const ADD_LOG        = 0x200;
        /// A key-size byte and key bytes follow the frame
        const OPEN_ENCRYPTED = 0x400;
        /// A valve socket path trailer follows the frame
        const RATED          = 0x800;
    }
}

/// Message type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Error = 1,
    RuntimeError = 2,
    Pid = 3,
    PidRsp = 4,
    Attach = 5,
    AttachRsp = 6,
    Open = 7,
    OpenRsp = 8,
    Pause = 9,
    PauseRsp = 10,
    Resume = 11,
    ResumeRsp = 12,
    Close = 13,
    CloseRsp = 14,
    Detach = 15,
    DetachRsp = 16,
    ListMinors = 17,
    ListMinorsRsp = 18,
    List = 19,
    ListRsp = 20,
    Stats = 21,
    StatsRsp = 22,
    ForceShutdown = 23,
    Exit = 24,
    DiskInfo = 25,
    DiskInfoRsp = 26,
    XenblkifConnect = 27,
    XenblkifConnectRsp = 28,
    XenblkifDisconnect = 29,
    XenblkifDisconnectRsp = 30,
}

impl MessageType {
    pub fn from_u16(v: u16) -> Result<Self> {
        use MessageType::*;
        Ok(match v {
            1 => Error,
            2 => RuntimeError,
            3 => Pid,
            4 => PidRsp,
            5 => Attach,
            6 => AttachRsp,
            7 => Open,
            8 => OpenRsp,
            9 => Pause,
            10 => PauseRsp,
            11 => Resume,
            12 => ResumeRsp,
            13 => Close,
            14 => CloseRsp,
            15 => Detach,
            16 => DetachRsp,
            17 => ListMinors,
            18 => ListMinorsRsp,
            19 => List,
            20 => ListRsp,
            21 => Stats,
            22 => StatsRsp,
            23 => ForceShutdown,
            24 => Exit,
            25 => DiskInfo,
            26 => DiskInfoRsp,
            27 => XenblkifConnect,
            28 => XenblkifConnectRsp,
            29 => XenblkifDisconnect,
            30 => XenblkifDisconnectRsp,
            other => {
                return Err(blktap_core::Error::protocol(format!(
                    "unknown message type {}",
                    other
                )))
            }
        })
    }

    /// Human-readable name for logs
    pub fn name(&self) -> &'static str {
        use MessageType::*;
        match self {
            Error => "error",
            RuntimeError => "runtime error",
            Pid => "pid",
            PidRsp => "pid response",
            Attach => "attach",
            AttachRsp => "attach response",
            Open => "open",
            OpenRsp => "open response",
            Pause => "pause",
            PauseRsp => "pause response",
            Resume => "resume",
            ResumeRsp => "resume response",
            Close => "close",
            CloseRsp => "close response",
            Detach => "detach",
            DetachRsp => "detach response",
            ListMinors => "list minors",
            ListMinorsRsp => "list minors response",
            List => "list",
            ListRsp => "list response",
            Stats => "stats",
            StatsRsp => "stats response",
            ForceShutdown => "force shutdown",
            Exit => "exit",
            DiskInfo => "disk info",
            DiskInfoRsp => "disk info response",
            XenblkifConnect => "blkif connect",
            XenblkifConnectRsp => "blkif connect response",
            XenblkifDisconnect => "blkif disconnect",
            XenblkifDisconnectRsp => "blkif disconnect response",
        }
    }

    /// The payload shape this type carries
    fn payload_shape(&self) -> PayloadShape {
        use MessageType::*;
        match self {
            Pid | Attach | Detach | List | ListMinors | Close | ForceShutdown
            | Exit | Pause | Stats | DiskInfo => PayloadShape::Empty,
            PidRsp => PayloadShape::Pid,
            Open | Resume => PayloadShape::Params,
            DiskInfoRsp => PayloadShape::Image,
            Error | RuntimeError | AttachRsp | OpenRsp | PauseRsp | ResumeRsp
            | CloseRsp | DetachRsp | XenblkifConnectRsp
            | XenblkifDisconnectRsp => PayloadShape::Response,
            ListMinorsRsp => PayloadShape::Minors,
            ListRsp => PayloadShape::List,
            XenblkifConnect | XenblkifDisconnect => PayloadShape::Blkif,
            StatsRsp => PayloadShape::Stat,
        }
    }
}

enum PayloadShape {
    Empty,
    Pid,
    Params,
    Image,
    Response,
    Minors,
    List,
    Blkif,
    Stat,
}

/// `OPEN`/`RESUME` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamsPayload {
    pub flags: MessageFlags,
    pub devnum: u32,
    pub domid: u32,
    /// `type:path` image descriptor
    pub path: String,
    /// Minor of an existing tapdisk to stack on
    pub prt_devnum: u32,
    /// Per-request timeout in seconds
    pub req_timeout: u16,
    pub secondary: String,
}

/// Geometry reported by `DISK_INFO_RSP`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePayload {
    pub sectors: u64,
    pub sector_size: u32,
    pub info: u32,
}

/// Status reply carried by every `_RSP` and by `ERROR`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponsePayload {
    /// 0 on success, positive errno otherwise
    pub error: i32,
    pub message: String,
}

/// One `LIST_RSP` element; a `count` of zero terminates the stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPayload {
    pub count: i32,
    pub minor: i32,
    pub state: i32,
    pub path: String,
}

/// Ring-connection parameters for `XENBLKIF_CONNECT`/`DISCONNECT`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlkifPayload {
    pub domid: u32,
    pub devid: u32,
    pub grefs: [u32; 8],
    pub order: u32,
    pub port: u32,
    pub proto: u32,
    pub pool: String,
    pub poll_duration: u32,
    pub poll_idle_threshold: u32,
}

/// `STATS_RSP` header; `length` bytes of text follow the frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatPayload {
    pub length: u64,
}

/// Typed payload union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Pid(i32),
    Params(ParamsPayload),
    Image(ImagePayload),
    Response(ResponsePayload),
    Minors(Vec<i32>),
    List(ListPayload),
    Blkif(BlkifPayload),
    Stat(StatPayload),
}

/// One control-socket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    /// Minor number the request concerns
    pub cookie: u16,
    pub payload: Payload,
}

impl Message {
    pub fn new(kind: MessageType, cookie: u16, payload: Payload) -> Self {
        Self {
            kind,
            cookie,
            payload,
        }
    }

    /// A payload-less request
    pub fn empty(kind: MessageType, cookie: u16) -> Self {
        Self::new(kind, cookie, Payload::Empty)
    }

    /// Encode to the fixed wire frame
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut frame = [0u8; MESSAGE_SIZE];
        let mut buf = &mut frame[..];
        buf.put_u16_ne(self.kind as u16);
        buf.put_u16_ne(self.cookie);

        match &self.payload {
            Payload::Empty => {}
            Payload::Pid(pid) => buf.put_i32_ne(*pid),
            Payload::Params(p) => {
                buf.put_u32_ne(p.flags.bits());
                buf.put_u32_ne(p.devnum);
                buf.put_u32_ne(p.domid);
                put_str(&mut buf, &p.path);
                buf.put_u32_ne(p.prt_devnum);
                buf.put_u16_ne(p.req_timeout);
                put_str(&mut buf, &p.secondary);
            }
            Payload::Image(p) => {
                buf.put_u64_ne(p.sectors);
                buf.put_u32_ne(p.sector_size);
                buf.put_u32_ne(p.info);
            }
            Payload::Response(p) => {
                buf.put_i32_ne(p.error);
                put_str(&mut buf, &p.message);
            }
            Payload::Minors(list) => {
                buf.put_i32_ne(list.len() as i32);
                for m in list.iter().take(MAX_MINORS) {
                    buf.put_i32_ne(*m);
                }
            }
            Payload::List(p) => {
                buf.put_i32_ne(p.count);
                buf.put_i32_ne(p.minor);
                buf.put_i32_ne(p.state);
                put_str(&mut buf, &p.path);
            }
            Payload::Blkif(p) => {
                buf.put_u32_ne(p.domid);
                buf.put_u32_ne(p.devid);
                for g in &p.grefs {
                    buf.put_u32_ne(*g);
                }
                buf.put_u32_ne(p.order);
                buf.put_u32_ne(p.port);
                buf.put_u32_ne(p.proto);
                put_str(&mut buf, &p.pool);
                buf.put_u32_ne(p.poll_duration);
                buf.put_u32_ne(p.poll_idle_threshold);
            }
            Payload::Stat(p) => {
                buf.put_u64_ne(p.length);
            }
        }
        frame
    }

    /// Decode a wire frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() != MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "frame length {} != {}",
                frame.len(),
                MESSAGE_SIZE
            )));
        }
        let mut buf = frame;
        let kind = MessageType::from_u16(buf.get_u16_ne())?;
        let cookie = buf.get_u16_ne();

        let payload = match kind.payload_shape() {
            PayloadShape::Empty => Payload::Empty,
            PayloadShape::Pid => Payload::Pid(buf.get_i32_ne()),
            PayloadShape::Params => {
                let flags = MessageFlags::from_bits_retain(buf.get_u32_ne());
                let devnum = buf.get_u32_ne();
                let domid = buf.get_u32_ne();
                let path = get_str(&mut buf)?;
                let prt_devnum = buf.get_u32_ne();
                let req_timeout = buf.get_u16_ne();
                let secondary = get_str(&mut buf)?;
                Payload::Params(ParamsPayload {
                    flags,
                    devnum,
                    domid,
                    path,
                    prt_devnum,
                    req_timeout,
                    secondary,
                })
            }
            PayloadShape::Image => Payload::Image(ImagePayload {
                sectors: buf.get_u64_ne(),
                sector_size: buf.get_u32_ne(),
                info: buf.get_u32_ne(),
            }),
            PayloadShape::Response => {
                let error = buf.get_i32_ne();
                let message = get_str(&mut buf)?;
                Payload::Response(ResponsePayload { error, message })
            }
            PayloadShape::Minors => {
                let count = buf.get_i32_ne();
                if count < 0 || count as usize > MAX_MINORS {
                    return Err(Error::protocol("minor count out of range"));
                }
                let list = (0..count).map(|_| buf.get_i32_ne()).collect();
                Payload::Minors(list)
            }
            PayloadShape::List => {
                let count = buf.get_i32_ne();
                let minor = buf.get_i32_ne();
                let state = buf.get_i32_ne();
                let path = get_str(&mut buf)?;
                Payload::List(ListPayload {
                    count,
                    minor,
                    state,
                    path,
                })
            }
            PayloadShape::Blkif => {
                let domid = buf.get_u32_ne();
                let devid = buf.get_u32_ne();
                let mut grefs = [0u32; 8];
                for g in &mut grefs {
                    *g = buf.get_u32_ne();
                }
                let order = buf.get_u32_ne();
                let port = buf.get_u32_ne();
                let proto = buf.get_u32_ne();
                let pool = get_str(&mut buf)?;
                let poll_duration = buf.get_u32_ne();
                let poll_idle_threshold = buf.get_u32_ne();
                Payload::Blkif(BlkifPayload {
                    domid,
                    devid,
                    grefs,
                    order,
                    port,
                    proto,
                    pool,
                    poll_duration,
                    poll_idle_threshold,
                })
            }
            PayloadShape::Stat => Payload::Stat(StatPayload {
                length: buf.get_u64_ne(),
            }),
        };

        Ok(Self {
            kind,
            cookie,
            payload,
        })
    }

    /// The response payload, or a protocol error for anything else
    pub fn response(&self) -> Result<&ResponsePayload> {
        match &self.payload {
            Payload::Response(r) => Ok(r),
            _ => Err(Error::protocol(format!(
                "'{}' carries no response payload",
                self.kind.name()
            ))),
        }
    }
}

/// Write a NUL-terminated string into its fixed 256-byte field
fn put_str(buf: &mut &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    debug_assert!(bytes.len() < MAX_PATH_LEN);
    let mut field = [0u8; MAX_PATH_LEN];
    let n = bytes.len().min(MAX_PATH_LEN - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    buf.put_slice(&field);
}

/// Read a NUL-terminated string from its fixed 256-byte field
fn get_str(buf: &mut &[u8]) -> Result<String> {
    let mut field = [0u8; MAX_PATH_LEN];
    buf.copy_to_slice(&mut field);
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::protocol("unterminated string field"))?;
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| Error::protocol("non-UTF-8 string field"))
}

/// Validate a string destined for a fixed message field
pub fn check_field(s: &str) -> Result<()> {
    if s.len() >= MAX_PATH_LEN {
        return Err(Error::invalid_arg(format!(
            "string of {} bytes exceeds message field",
            s.len()
        )));
    }
    if s.contains('\0') {
        return Err(Error::invalid_arg("embedded NUL in message field"));
    }
    Ok(())
}
