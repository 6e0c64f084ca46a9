//! NBD protocol constants and struct definitions.
//!
//! Every multi-byte integer on the wire is big-endian. Encoders take a
//! validated value and produce exactly the documented layout; decoders either
//! return a complete value or fail with a protocol error naming the field that
//! did not match.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errors::NbdError;

/// Default TCP port for NBD servers.
pub const TCP_PORT: u16 = 10809;

/// `NBD_INIT_MAGIC`, ASCII "NBDMAGIC"
pub const INIT_MAGIC: u64 = 0x4e42444d41474943;
/// `NBD_OPTS_MAGIC`, ASCII "IHAVEOPT"
pub const OPTS_MAGIC: u64 = 0x49484156454F5054;
/// `NBD_CLIENT_MAGIC`, sent by oldstyle servers instead of `OPTS_MAGIC`
pub const CLIENT_MAGIC: u64 = 0x0000420281861253;
/// `NBD_REP_MAGIC`, prefix of every option reply
pub const REP_MAGIC: u64 = 0x0003e889045565a9;

// transmission constants
/// Magic of a compact request.
pub const REQUEST_MAGIC: u32 = 0x25609513;
/// Magic of a request with 64-bit length, once extended headers are on.
pub const EXTENDED_REQUEST_MAGIC: u32 = 0x21e41c71;
/// Magic of the 16-byte simple reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
/// Magic of a structured reply chunk.
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;
/// Magic of an extended reply chunk.
pub const EXTENDED_REPLY_MAGIC: u32 = 0x6e8a278c;

/// Longest name, description or query string accepted.
pub const MAX_STRING_SIZE: usize = 512;
/// Largest payload or data transfer of a single request or option.
pub const MAX_BUFFER_SIZE: u32 = 32 * 1024 * 1024;
/// Cap on extents in one block status chunk.
pub const MAX_BLOCK_STATUS_EXTENTS: usize = 1024 * 1024 / 8;
/// Reserved zero bytes after export information in oldstyle and
/// `NBD_OPT_EXPORT_NAME` negotiation.
pub const RESERVED_ZEROES: usize = 124;

/// Sizes of the fixed headers.
pub const OPT_HEADER_LEN: usize = 16;
/// Option reply header size.
pub const OPT_REPLY_HEADER_LEN: usize = 20;
/// Simple reply size.
pub const SIMPLE_REPLY_LEN: usize = 16;
/// Structured chunk header size.
pub const STRUCTURED_CHUNK_LEN: usize = 20;
/// Extended chunk header size.
pub const EXTENDED_CHUNK_LEN: usize = 32;
/// Compact request size.
pub const REQUEST_LEN: usize = 28;
/// Extended request size.
pub const EXTENDED_REQUEST_LEN: usize = 32;

/// Meta context: `base:allocation`
pub const CONTEXT_BASE_ALLOCATION: &str = "base:allocation";
/// Meta context: `qemu:allocation-depth`
pub const CONTEXT_ALLOCATION_DEPTH: &str = "qemu:allocation-depth";
/// Prefix of per-bitmap meta contexts.
pub const CONTEXT_DIRTY_BITMAP_PREFIX: &str = "qemu:dirty-bitmap:";

/// Context ID of `base:allocation`.
pub const BASE_ALLOCATION_ID: u32 = 0;
/// Context ID of `qemu:allocation-depth`.
pub const ALLOCATION_DEPTH_ID: u32 = 1;
/// Context ID of the first dirty bitmap; bitmap `i` uses `FIRST_BITMAP_ID + i`.
pub const FIRST_BITMAP_ID: u32 = 2;

/// `base:allocation` extent flag: range is not allocated.
pub const STATE_HOLE: u32 = 1 << 0;
/// `base:allocation` extent flag: range reads as zeroes.
pub const STATE_ZERO: u32 = 1 << 1;
/// `qemu:dirty-bitmap:` extent flag: range is dirty.
pub const STATE_DIRTY: u32 = 1 << 0;

const REP_FLAG_ERROR: u32 = 1 << 31;
const CHUNK_FLAG_ERROR: u16 = 1 << 15;

/// Negotiated capability level of a connection, ordered from least to most
/// capable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mode {
    /// Oldstyle negotiation, no options at all.
    OldStyle,
    /// Newstyle without the fixed extension: only `NBD_OPT_EXPORT_NAME`.
    ExportName,
    /// Fixed newstyle, simple replies only.
    Simple,
    /// Structured replies.
    Structured,
    /// Extended headers (implies structured replies).
    Extended,
}

impl Mode {
    /// Whether replies use chunks instead of simple replies.
    pub fn structured(self) -> bool {
        self >= Mode::Structured
    }

    /// Whether requests and reply chunks use the 64-bit layout.
    pub fn extended(self) -> bool {
        self == Mode::Extended
    }
}

bitflags! {
  /// Global flags sent by the server after the magics.
  pub struct HandshakeFlags: u16 {
    /// NBD_FLAG_FIXED_NEWSTYLE
    const FIXED_NEWSTYLE = 0b01;
    /// NBD_FLAG_NO_ZEROES
    const NO_ZEROES = 0b10;
  }

  /// Flags sent by the client in response to the handshake flags.
  pub struct ClientHandshakeFlags: u32 {
    /// NBD_FLAG_C_FIXED_NEWSTYLE
    const C_FIXED_NEWSTYLE = 0b01;
    /// NBD_FLAG_C_NO_ZEROES
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags.
  pub struct TransmitFlags: u16 {
    /// NBD_FLAG_HAS_FLAGS
    const HAS_FLAGS = 1 << 0;
    /// NBD_FLAG_READ_ONLY
    const READ_ONLY = 1 << 1;
    /// NBD_FLAG_SEND_FLUSH
    const SEND_FLUSH = 1 << 2;
    /// NBD_FLAG_SEND_FUA
    const SEND_FUA = 1 << 3;
    /// NBD_FLAG_ROTATIONAL
    const ROTATIONAL = 1 << 4;
    /// NBD_FLAG_SEND_TRIM
    const SEND_TRIM = 1 << 5;
    /// NBD_FLAG_SEND_WRITE_ZEROES
    const SEND_WRITE_ZEROES = 1 << 6;
    /// NBD_FLAG_SEND_DF
    const SEND_DF = 1 << 7;
    /// NBD_FLAG_CAN_MULTI_CONN
    const CAN_MULTI_CONN = 1 << 8;
    /// NBD_FLAG_SEND_RESIZE
    const SEND_RESIZE = 1 << 9;
    /// NBD_FLAG_SEND_CACHE
    const SEND_CACHE = 1 << 10;
    /// NBD_FLAG_SEND_FAST_ZERO
    const SEND_FAST_ZERO = 1 << 11;
    /// NBD_FLAG_BLOCK_STAT_PAYLOAD
    const BLOCK_STAT_PAYLOAD = 1 << 12;
  }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
    EXTENDED_HEADERS = 11,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = REP_FLAG_ERROR + 1,
    ERR_POLICY = REP_FLAG_ERROR + 2,
    ERR_INVALID = REP_FLAG_ERROR + 3,
    ERR_PLATFORM = REP_FLAG_ERROR + 4,
    ERR_TLS_REQD = REP_FLAG_ERROR + 5,
    ERR_UNKNOWN = REP_FLAG_ERROR + 6,
    ERR_SHUTDOWN = REP_FLAG_ERROR + 7,
    ERR_BLOCK_SIZE_REQD = REP_FLAG_ERROR + 8,
    ERR_TOO_BIG = REP_FLAG_ERROR + 9,
    ERR_EXT_HEADER_REQD = REP_FLAG_ERROR + 10,
}

impl ReplyType {
    /// Whether a raw reply type has the error bit set.
    pub fn is_error(raw: u32) -> bool {
        raw & REP_FLAG_ERROR != 0
    }
}

/// Name of an option, for traces.
pub fn opt_name(opt: u32) -> &'static str {
    match OptType::try_from(opt) {
        Ok(OptType::EXPORT_NAME) => "export name",
        Ok(OptType::ABORT) => "abort",
        Ok(OptType::LIST) => "list",
        Ok(OptType::PEEK_EXPORT) => "peek export",
        Ok(OptType::STARTTLS) => "starttls",
        Ok(OptType::INFO) => "info",
        Ok(OptType::GO) => "go",
        Ok(OptType::STRUCTURED_REPLY) => "structured reply",
        Ok(OptType::LIST_META_CONTEXT) => "list meta context",
        Ok(OptType::SET_META_CONTEXT) => "set meta context",
        Ok(OptType::EXTENDED_HEADERS) => "extended headers",
        Err(_) => "<unknown>",
    }
}

/// Name of an option reply type, for traces.
pub fn rep_name(typ: u32) -> &'static str {
    match ReplyType::try_from(typ) {
        Ok(ReplyType::ACK) => "ack",
        Ok(ReplyType::SERVER) => "server",
        Ok(ReplyType::INFO) => "info",
        Ok(ReplyType::META_CONTEXT) => "meta context",
        Ok(ReplyType::ERR_UNSUP) => "unsupported",
        Ok(ReplyType::ERR_POLICY) => "denied by policy",
        Ok(ReplyType::ERR_INVALID) => "invalid",
        Ok(ReplyType::ERR_PLATFORM) => "platform lacks support",
        Ok(ReplyType::ERR_TLS_REQD) => "TLS required",
        Ok(ReplyType::ERR_UNKNOWN) => "export unknown",
        Ok(ReplyType::ERR_SHUTDOWN) => "server shutting down",
        Ok(ReplyType::ERR_BLOCK_SIZE_REQD) => "block size required",
        Ok(ReplyType::ERR_TOO_BIG) => "option too big",
        Ok(ReplyType::ERR_EXT_HEADER_REQD) => "extended headers required",
        Err(_) => "<unknown>",
    }
}

/// Name of an info type, for traces.
pub fn info_name(typ: u16) -> &'static str {
    match InfoType::try_from(typ) {
        Ok(InfoType::EXPORT) => "export",
        Ok(InfoType::NAME) => "name",
        Ok(InfoType::DESCRIPTION) => "description",
        Ok(InfoType::BLOCK_SIZE) => "block size",
        Err(_) => "<unknown>",
    }
}

/// Builder for replying to an option
#[must_use]
#[derive(Debug)]
pub struct OptReply {
    opt: u32,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    pub fn ack(opt: u32) -> Self {
        Self {
            opt,
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    pub fn new(opt: u32, reply_type: ReplyType, data: Vec<u8>) -> Self {
        Self {
            opt,
            reply_type,
            data,
        }
    }

    /// An error reply carrying a human-readable message.
    pub fn err<S: AsRef<str>>(opt: u32, reply_type: ReplyType, msg: S) -> Self {
        debug_assert!(ReplyType::is_error(reply_type.into()));
        Self::new(opt, reply_type, msg.as_ref().as_bytes().to_vec())
    }

    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply
        // S: any data as required by the reply
        let mut buf = Vec::with_capacity(OPT_REPLY_HEADER_LEN + self.data.len());
        buf.write_u64::<BE>(REP_MAGIC)?;
        buf.write_u32::<BE>(self.opt)?;
        buf.write_u32::<BE>(self.reply_type.into())?;
        buf.write_u32::<BE>(self.data.len() as u32)?;
        buf.extend_from_slice(&self.data);
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }
}

/// Header of an option reply, as read by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptReplyHeader {
    pub opt: u32,
    pub reply_type: u32,
    pub len: u32,
}

impl OptReplyHeader {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        ensure!(
            magic == REP_MAGIC,
            NbdError::protocol(format!("unexpected option reply magic {magic:#x}"))
        );
        let opt = stream.read_u32::<BE>()?;
        let reply_type = stream.read_u32::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        Ok(Self {
            opt,
            reply_type,
            len,
        })
    }

    pub fn is_error(&self) -> bool {
        ReplyType::is_error(self.reply_type)
    }
}

/// An option request: header plus its complete payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    pub opt: u32,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn new(typ: OptType, data: Vec<u8>) -> Self {
        Self {
            opt: typ.into(),
            data,
        }
    }

    pub fn typ(&self) -> Option<OptType> {
        OptType::try_from(self.opt).ok()
    }

    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT') (note same newstyle handshake's magic number)
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != OPTS_MAGIC {
            bail!(NbdError::protocol(format!(
                "unexpected option magic {magic:#x}"
            )));
        }
        let opt = stream.read_u32::<BE>()?;
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len <= MAX_BUFFER_SIZE,
            NbdError::protocol(format!(
                "option {} length {option_len} is larger than max length {MAX_BUFFER_SIZE}",
                opt_name(opt)
            ))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {} of size {option_len}", opt_name(opt)))?;
        Ok(Self { opt, data })
    }

    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        let mut buf = Vec::with_capacity(OPT_HEADER_LEN + self.data.len());
        buf.write_u64::<BE>(OPTS_MAGIC)?;
        buf.write_u32::<BE>(self.opt)?;
        buf.write_u32::<BE>(self.data.len() as u32)?;
        buf.extend_from_slice(&self.data);
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }
}

/// Read a `u32`-length-prefixed string from an option payload.
pub(crate) fn get_string(data: &mut &[u8], what: &str) -> core::result::Result<String, NbdError> {
    let len = data
        .read_u32::<BE>()
        .map_err(|_| NbdError::invalid(format!("option payload too short for {what} length")))?
        as usize;
    if len > data.len() {
        return Err(NbdError::invalid(format!(
            "{what} length {len} exceeds remaining payload"
        )));
    }
    if len > MAX_STRING_SIZE {
        return Err(NbdError::invalid(format!(
            "{what} length {len} is larger than max {MAX_STRING_SIZE}"
        )));
    }
    let (s, rest) = data.split_at(len);
    *data = rest;
    String::from_utf8(s.to_vec()).map_err(|_| NbdError::invalid(format!("invalid UTF-8 in {what}")))
}

pub(crate) fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Payload of `NBD_OPT_INFO` and `NBD_OPT_GO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    pub name: String,
    /// Raw info types; unknown ones are ignored by servers.
    pub typs: Vec<u16>,
}

impl InfoRequest {
    pub fn get(mut data: &[u8]) -> core::result::Result<Self, NbdError> {
        let name = get_string(&mut data, "export name")?;
        let num_requests = data
            .read_u16::<BE>()
            .map_err(|_| NbdError::invalid("option payload too short for request count"))?;
        if data.len() != num_requests as usize * 2 {
            return Err(NbdError::invalid(format!(
                "{num_requests} info requests do not match remaining payload of {} bytes",
                data.len()
            )));
        }
        let mut typs = vec![];
        for _ in 0..num_requests {
            // cannot fail: length checked above
            typs.push(data.read_u16::<BE>().map_err(|_| NbdError::invalid("short info"))?);
        }
        Ok(InfoRequest { name, typs })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        put_string(&mut buf, &self.name);
        buf.extend_from_slice(&(self.typs.len() as u16).to_be_bytes());
        for typ in &self.typs {
            buf.extend_from_slice(&typ.to_be_bytes());
        }
        buf
    }

    pub fn wants(&self, typ: InfoType) -> bool {
        self.typs.contains(&typ.into())
    }
}

/// One `NBD_REP_INFO` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    Export { size: u64, flags: TransmitFlags },
    Name(String),
    Description(String),
    BlockSize { min: u32, preferred: u32, max: u32 },
}

impl Info {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        match self {
            // - 16 bits, NBD_INFO_EXPORT
            // - 64 bits, size of the export in bytes (unsigned)
            // - 16 bits, transmission flags
            Info::Export { size, flags } => {
                buf.extend_from_slice(&u16::from(InfoType::EXPORT).to_be_bytes());
                buf.extend_from_slice(&size.to_be_bytes());
                buf.extend_from_slice(&flags.bits().to_be_bytes());
            }
            Info::Name(name) => {
                buf.extend_from_slice(&u16::from(InfoType::NAME).to_be_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
            Info::Description(desc) => {
                buf.extend_from_slice(&u16::from(InfoType::DESCRIPTION).to_be_bytes());
                buf.extend_from_slice(desc.as_bytes());
            }
            //  -  16 bits, NBD_INFO_BLOCK_SIZE
            //  -  32 bits, minimum block size
            //  -  32 bits, preferred block size
            //  -  32 bits, maximum block size
            Info::BlockSize {
                min,
                preferred,
                max,
            } => {
                buf.extend_from_slice(&u16::from(InfoType::BLOCK_SIZE).to_be_bytes());
                buf.extend_from_slice(&min.to_be_bytes());
                buf.extend_from_slice(&preferred.to_be_bytes());
                buf.extend_from_slice(&max.to_be_bytes());
            }
        }
        buf
    }

    /// Decode an info payload; `Ok(None)` for info types this crate does not
    /// know, whose payload the caller skips.
    pub fn decode(mut data: &[u8]) -> Result<Option<Self>> {
        ensure!(
            data.len() >= 2,
            NbdError::protocol(format!("info reply of length {} is too short", data.len()))
        );
        let typ = data.read_u16::<BE>()?;
        let typ = match InfoType::try_from(typ) {
            Ok(typ) => typ,
            Err(_) => return Ok(None),
        };
        let info = match typ {
            InfoType::EXPORT => {
                ensure!(
                    data.len() == 10,
                    NbdError::protocol(format!("export info has wrong length {}", data.len() + 2))
                );
                let size = data.read_u64::<BE>()?;
                let flags = data.read_u16::<BE>()?;
                // bits from newer protocol revisions are ignored
                let flags = TransmitFlags::from_bits_truncate(flags);
                Info::Export { size, flags }
            }
            InfoType::NAME | InfoType::DESCRIPTION => {
                ensure!(
                    data.len() <= MAX_STRING_SIZE,
                    NbdError::protocol(format!("{} info is too long", info_name(typ.into())))
                );
                let s = String::from_utf8(data.to_vec())
                    .map_err(|_| NbdError::protocol("invalid UTF-8 in info string"))?;
                if typ == InfoType::NAME {
                    Info::Name(s)
                } else {
                    Info::Description(s)
                }
            }
            InfoType::BLOCK_SIZE => {
                ensure!(
                    data.len() == 12,
                    NbdError::protocol(format!(
                        "block size info has wrong length {}",
                        data.len() + 2
                    ))
                );
                Info::BlockSize {
                    min: data.read_u32::<BE>()?,
                    preferred: data.read_u32::<BE>()?,
                    max: data.read_u32::<BE>()?,
                }
            }
        };
        Ok(Some(info))
    }
}

/// Payload of `NBD_OPT_LIST_META_CONTEXT` and `NBD_OPT_SET_META_CONTEXT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContextRequest {
    pub export: String,
    pub queries: Vec<String>,
}

impl MetaContextRequest {
    /// Parse the payload. Queries longer than [`MAX_STRING_SIZE`] can never
    /// match and are dropped.
    pub fn get(mut data: &[u8]) -> core::result::Result<Self, NbdError> {
        let export = get_string(&mut data, "export name")?;
        let count = data
            .read_u32::<BE>()
            .map_err(|_| NbdError::invalid("option payload too short for query count"))?;
        let mut queries = vec![];
        for _ in 0..count {
            let len = data
                .read_u32::<BE>()
                .map_err(|_| NbdError::invalid("option payload too short for query length"))?
                as usize;
            if len > data.len() {
                return Err(NbdError::invalid(format!(
                    "query length {len} exceeds remaining payload"
                )));
            }
            let (q, rest) = data.split_at(len);
            data = rest;
            if len > MAX_STRING_SIZE {
                log::debug!("skipping meta context query of length {len}");
                continue;
            }
            queries.push(String::from_utf8_lossy(q).into_owned());
        }
        if !data.is_empty() {
            return Err(NbdError::invalid(format!(
                "{} unexpected trailing bytes in meta context request",
                data.len()
            )));
        }
        Ok(Self { export, queries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        put_string(&mut buf, &self.export);
        buf.extend_from_slice(&(self.queries.len() as u32).to_be_bytes());
        for q in &self.queries {
            put_string(&mut buf, q);
        }
        buf
    }
}

/// Payload of `NBD_REP_META_CONTEXT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContext {
    pub id: u32,
    pub name: String,
}

impl MetaContext {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.name.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= 4 && data.len() - 4 <= MAX_STRING_SIZE,
            NbdError::protocol(format!("meta context reply has bad length {}", data.len()))
        );
        let id = data.read_u32::<BE>()?;
        let name = String::from_utf8(data.to_vec())
            .map_err(|_| NbdError::protocol("invalid UTF-8 in meta context name"))?;
        Ok(Self { id, name })
    }
}

// -------------------
// Transmission phase
// -------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

/// Name of a command, for traces.
pub fn cmd_name(typ: u16) -> &'static str {
    match Cmd::try_from(typ) {
        Ok(Cmd::READ) => "read",
        Ok(Cmd::WRITE) => "write",
        Ok(Cmd::DISCONNECT) => "disconnect",
        Ok(Cmd::FLUSH) => "flush",
        Ok(Cmd::TRIM) => "trim",
        Ok(Cmd::CACHE) => "cache",
        Ok(Cmd::WRITE_ZEROES) => "write zeroes",
        Ok(Cmd::BLOCK_STATUS) => "block status",
        Ok(Cmd::RESIZE) => "resize",
        Err(_) => "<unknown>",
    }
}

bitflags! {
    /// Per-request command flags.
    pub struct CmdFlags: u16 {
        /// NBD_CMD_FLAG_FUA
        const FUA = 1 << 0;
        /// NBD_CMD_FLAG_NO_HOLE
        const NO_HOLE = 1 << 1;
        // "don't fragment"
        /// NBD_CMD_FLAG_DF
        const DF = 1 << 2;
        /// NBD_CMD_FLAG_REQ_ONE
        const REQ_ONE = 1 << 3;
        /// NBD_CMD_FLAG_FAST_ZERO
        const FAST_ZERO = 1 << 4;
        /// NBD_CMD_FLAG_PAYLOAD_LEN
        const PAYLOAD_LEN = 1 << 5;
    }

    /// Flags of a structured or extended reply chunk.
    pub struct ReplyFlags: u16 {
        /// NBD_REPLY_FLAG_DONE
        const DONE = 1 << 0;
    }
}

/// A request header. Flags and type are kept raw so the server can reject
/// unknown values per request instead of dropping the connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    pub flags: u16,
    pub typ: u16,
    pub cookie: u64,
    pub from: u64,
    pub len: u64,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = &mut f.debug_struct("Request");
        if self.flags != 0 {
            match CmdFlags::from_bits(self.flags) {
                Some(flags) => f = f.field("flags", &flags),
                None => f = f.field("flags", &format_args!("{:#x}", self.flags)),
            }
        }
        f = f.field("typ", &cmd_name(self.typ));
        f = f.field("cookie", &self.cookie);
        if self.from != 0 {
            f = f.field("from", &self.from);
        }
        if self.len != 0 {
            f = f.field("len", &self.len);
        }
        f.finish()
    }
}

impl Request {
    pub fn new(typ: Cmd, from: u64, len: u64) -> Self {
        Self {
            flags: 0,
            typ: typ.into(),
            cookie: 0,
            from,
            len,
        }
    }

    pub fn with_flags(mut self, flags: CmdFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn cmd(&self) -> Option<Cmd> {
        Cmd::try_from(self.typ).ok()
    }

    /// Flags that are known to this implementation; `None` if any unknown
    /// bit is set.
    pub fn cmd_flags(&self) -> Option<CmdFlags> {
        CmdFlags::from_bits(self.flags)
    }

    pub fn has_flag(&self, flag: CmdFlags) -> bool {
        self.flags & flag.bits() != 0
    }

    /// Encode the header (without any payload).
    pub fn encode(&self, extended: bool) -> Result<Vec<u8>> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, cookie
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned), or 64 bits with extended headers
        let mut buf = Vec::with_capacity(EXTENDED_REQUEST_LEN);
        buf.write_u32::<BE>(if extended {
            EXTENDED_REQUEST_MAGIC
        } else {
            REQUEST_MAGIC
        })?;
        buf.write_u16::<BE>(self.flags)?;
        buf.write_u16::<BE>(self.typ)?;
        buf.write_u64::<BE>(self.cookie)?;
        buf.write_u64::<BE>(self.from)?;
        if extended {
            buf.write_u64::<BE>(self.len)?;
        } else {
            let len = u32::try_from(self.len).map_err(|_| {
                NbdError::invalid(format!("length {} needs extended headers", self.len))
            })?;
            buf.write_u32::<BE>(len)?;
        }
        Ok(buf)
    }

    pub fn decode(mut buf: &[u8], extended: bool) -> Result<Self> {
        let want = if extended {
            EXTENDED_REQUEST_LEN
        } else {
            REQUEST_LEN
        };
        ensure!(
            buf.len() == want,
            NbdError::protocol(format!("request header of {} bytes, want {want}", buf.len()))
        );
        let magic = buf.read_u32::<BE>()?;
        let expected = if extended {
            EXTENDED_REQUEST_MAGIC
        } else {
            REQUEST_MAGIC
        };
        if magic != expected {
            bail!(NbdError::protocol(format!(
                "wrong request magic {magic:#x}, expected {expected:#x}"
            )));
        }
        let flags = buf.read_u16::<BE>()?;
        let typ = buf.read_u16::<BE>()?;
        let cookie = buf.read_u64::<BE>()?;
        let from = buf.read_u64::<BE>()?;
        let len = if extended {
            buf.read_u64::<BE>()?
        } else {
            buf.read_u32::<BE>()? as u64
        };
        Ok(Self {
            flags,
            typ,
            cookie,
            from,
            len,
        })
    }

    /// Read one request header whose width matches the negotiated mode.
    pub fn get<IO: Read>(mut stream: IO, extended: bool) -> Result<Self> {
        let mut buf = [0u8; EXTENDED_REQUEST_LEN];
        let buf = if extended {
            &mut buf[..]
        } else {
            &mut buf[..REQUEST_LEN]
        };
        stream.read_exact(buf)?;
        Self::decode(buf, extended)
    }
}

/// Payload of an extended `NBD_CMD_BLOCK_STATUS` with `NBD_CMD_FLAG_PAYLOAD_LEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatusFilter {
    pub effect_len: u64,
    pub ids: Vec<u32>,
}

impl BlockStatusFilter {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 * self.ids.len());
        buf.extend_from_slice(&self.effect_len.to_be_bytes());
        for id in &self.ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < 8 || (data.len() - 8) % 4 != 0 {
            return None;
        }
        let effect_len = data.read_u64::<BE>().ok()?;
        let mut ids = Vec::with_capacity(data.len() / 4);
        while !data.is_empty() {
            ids.push(data.read_u32::<BE>().ok()?);
        }
        Some(Self { effect_len, ids })
    }
}

/// The 16-byte simple reply, optionally followed by read data.
#[derive(Debug)]
#[must_use]
pub struct SimpleReply<'a> {
    err: u32,
    cookie: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    pub fn data(cookie: u64, data: &'a [u8]) -> Self {
        SimpleReply {
            err: 0,
            cookie,
            data,
        }
    }

    pub fn ok(cookie: u64) -> Self {
        Self::data(cookie, &[])
    }

    pub fn err(err: u32, cookie: u64) -> Self {
        SimpleReply {
            err,
            cookie,
            data: &[],
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.err.to_be_bytes());
        buf.extend_from_slice(&self.cookie.to_be_bytes());
        buf.extend_from_slice(self.data);
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    NONE = 0,
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 5,
    BLOCK_STATUS_EXT = 6,
    ERROR = CHUNK_FLAG_ERROR + 1,
    ERROR_OFFSET = CHUNK_FLAG_ERROR + 2,
}

impl ChunkType {
    pub fn is_error(raw: u16) -> bool {
        raw & CHUNK_FLAG_ERROR != 0
    }
}

/// Name of a chunk type, for traces.
pub fn chunk_name(typ: u16) -> &'static str {
    match ChunkType::try_from(typ) {
        Ok(ChunkType::NONE) => "none",
        Ok(ChunkType::OFFSET_DATA) => "data",
        Ok(ChunkType::OFFSET_HOLE) => "hole",
        Ok(ChunkType::BLOCK_STATUS) => "block status",
        Ok(ChunkType::BLOCK_STATUS_EXT) => "extended block status",
        Ok(ChunkType::ERROR) => "error",
        Ok(ChunkType::ERROR_OFFSET) => "error at offset",
        Err(_) => "<unknown>",
    }
}

/// Structured or extended chunk header, normalized to 64-bit fields.
///
/// `offset` is only carried on the wire by extended chunks; compact chunks
/// decode with `offset` 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: ReplyFlags,
    pub typ: u16,
    pub cookie: u64,
    pub offset: u64,
    pub length: u64,
}

impl ChunkHeader {
    pub fn new(typ: ChunkType, cookie: u64, offset: u64) -> Self {
        Self {
            flags: ReplyFlags::empty(),
            typ: typ.into(),
            cookie,
            offset,
            length: 0,
        }
    }

    pub fn done(&self) -> bool {
        self.flags.contains(ReplyFlags::DONE)
    }

    /// Append this header, with `length` set to `payload_len`.
    pub fn encode(&self, extended: bool, payload_len: usize, buf: &mut Vec<u8>) {
        // S: 32 bits, magic
        // S: 16 bits, flags
        // S: 16 bits, type
        // S: 64 bits, cookie
        // S: 64 bits, offset (extended only)
        // S: 32 bits (64 bits extended), length of payload
        if extended {
            buf.extend_from_slice(&EXTENDED_REPLY_MAGIC.to_be_bytes());
        } else {
            buf.extend_from_slice(&STRUCTURED_REPLY_MAGIC.to_be_bytes());
        }
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        buf.extend_from_slice(&self.typ.to_be_bytes());
        buf.extend_from_slice(&self.cookie.to_be_bytes());
        if extended {
            buf.extend_from_slice(&self.offset.to_be_bytes());
            buf.extend_from_slice(&(payload_len as u64).to_be_bytes());
        } else {
            buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
        }
    }
}

/// A reply header as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyHeader {
    Simple { error: u32, cookie: u64 },
    Chunk(ChunkHeader),
}

impl ReplyHeader {
    pub fn cookie(&self) -> u64 {
        match self {
            ReplyHeader::Simple { cookie, .. } => *cookie,
            ReplyHeader::Chunk(chunk) => chunk.cookie,
        }
    }

    /// Read a reply header, rejecting magics that the negotiated mode does not
    /// allow.
    pub fn get<IO: Read>(mut stream: IO, mode: Mode) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        match magic {
            SIMPLE_REPLY_MAGIC => {
                ensure!(
                    !mode.extended(),
                    NbdError::protocol("simple reply received with extended headers")
                );
                let error = stream.read_u32::<BE>()?;
                let cookie = stream.read_u64::<BE>()?;
                Ok(ReplyHeader::Simple { error, cookie })
            }
            STRUCTURED_REPLY_MAGIC | EXTENDED_REPLY_MAGIC => {
                let extended = magic == EXTENDED_REPLY_MAGIC;
                if extended != mode.extended() || !mode.structured() {
                    bail!(NbdError::protocol(format!(
                        "unexpected reply magic {magic:#x} in {mode:?} mode"
                    )));
                }
                let flags = stream.read_u16::<BE>()?;
                let flags = ReplyFlags::from_bits(flags).ok_or_else(|| {
                    NbdError::protocol(format!("unexpected reply flags {flags:#x}"))
                })?;
                let typ = stream.read_u16::<BE>()?;
                let cookie = stream.read_u64::<BE>()?;
                let (offset, length) = if extended {
                    (stream.read_u64::<BE>()?, stream.read_u64::<BE>()?)
                } else {
                    (0, stream.read_u32::<BE>()? as u64)
                };
                Ok(ReplyHeader::Chunk(ChunkHeader {
                    flags,
                    typ,
                    cookie,
                    offset,
                    length,
                }))
            }
            _ => bail!(NbdError::protocol(format!("unexpected reply magic {magic:#x}"))),
        }
    }
}

/// Payload of `NBD_REPLY_TYPE_OFFSET_HOLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetHole {
    pub offset: u64,
    pub len: u32,
}

impl OffsetHole {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.len.to_be_bytes());
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == 12,
            NbdError::protocol(format!("hole chunk has wrong length {}", data.len()))
        );
        Ok(Self {
            offset: data.read_u64::<BE>()?,
            len: data.read_u32::<BE>()?,
        })
    }
}

/// Payload of `NBD_REPLY_TYPE_ERROR` and `NBD_REPLY_TYPE_ERROR_OFFSET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: u32,
    pub msg: String,
    /// Only present for `ERROR_OFFSET`.
    pub offset: Option<u64>,
}

impl ErrorPayload {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let msg = &self.msg.as_bytes()[..self.msg.len().min(MAX_STRING_SIZE)];
        buf.extend_from_slice(&self.error.to_be_bytes());
        buf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        buf.extend_from_slice(msg);
        if let Some(offset) = self.offset {
            buf.extend_from_slice(&offset.to_be_bytes());
        }
    }

    pub fn decode(mut data: &[u8], with_offset: bool) -> Result<Self> {
        ensure!(
            data.len() >= 6,
            NbdError::protocol("error chunk is too short")
        );
        let error = data.read_u32::<BE>()?;
        let msg_len = data.read_u16::<BE>()? as usize;
        let trailer = if with_offset { 8 } else { 0 };
        ensure!(
            data.len() == msg_len + trailer,
            NbdError::protocol(format!(
                "error chunk message length {msg_len} does not match payload"
            ))
        );
        let msg = String::from_utf8_lossy(&data[..msg_len]).into_owned();
        data = &data[msg_len..];
        let offset = if with_offset {
            Some(data.read_u64::<BE>()?)
        } else {
            None
        };
        Ok(Self { error, msg, offset })
    }
}

/// A run of bytes sharing the same status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub length: u64,
    pub flags: u32,
}

/// Payload of `NBD_REPLY_TYPE_BLOCK_STATUS` / `BLOCK_STATUS_EXT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatusPayload {
    pub context_id: u32,
    pub extents: Vec<Extent>,
}

impl BlockStatusPayload {
    pub fn encode(&self, extended: bool, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.context_id.to_be_bytes());
        if extended {
            buf.extend_from_slice(&(self.extents.len() as u32).to_be_bytes());
            for e in &self.extents {
                buf.extend_from_slice(&e.length.to_be_bytes());
                buf.extend_from_slice(&(e.flags as u64).to_be_bytes());
            }
        } else {
            for e in &self.extents {
                buf.extend_from_slice(&(e.length as u32).to_be_bytes());
                buf.extend_from_slice(&e.flags.to_be_bytes());
            }
        }
    }

    pub fn decode(mut data: &[u8], extended: bool) -> Result<Self> {
        let header = if extended { 8 } else { 4 };
        ensure!(
            data.len() >= header,
            NbdError::protocol("block status chunk is too short")
        );
        let context_id = data.read_u32::<BE>()?;
        let mut extents = vec![];
        if extended {
            let count = data.read_u32::<BE>()? as usize;
            ensure!(
                data.len() == count * 16,
                NbdError::protocol(format!("{count} extents do not match chunk length"))
            );
            for _ in 0..count {
                let length = data.read_u64::<BE>()?;
                let flags = data.read_u64::<BE>()?;
                let flags = u32::try_from(flags).map_err(|_| {
                    NbdError::protocol(format!("extent flags {flags:#x} out of range"))
                })?;
                extents.push(Extent { length, flags });
            }
        } else {
            ensure!(
                data.len() % 8 == 0,
                NbdError::protocol("block status chunk has a partial extent")
            );
            while !data.is_empty() {
                let length = data.read_u32::<BE>()? as u64;
                let flags = data.read_u32::<BE>()?;
                extents.push(Extent { length, flags });
            }
        }
        ensure!(
            !extents.is_empty(),
            NbdError::protocol("block status chunk without extents")
        );
        Ok(Self {
            context_id,
            extents,
        })
    }
}
