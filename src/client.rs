//! NBD client: option negotiation and a blocking request/reply interface.
//!
//! The client issues one request at a time and reads its complete reply
//! before returning, so replies are matched to requests by cookie only as a
//! sanity check.

use std::fmt;
use std::io::{self, prelude::*};
use std::mem;
use std::net::TcpStream;
use std::sync::Arc;

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure, Report, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};

use crate::channel::{Channel, TlsCreds};
use crate::errors::{ErrorKind, NbdError, WireError};
use crate::proto::*;

/// Largest chunk payload accepted: a full data transfer plus its offset.
const MAX_CHUNK_LEN: u64 = MAX_BUFFER_SIZE as u64 + 8;

/// Step of the client's work that failed; attached as context to fatal
/// errors and retrievable with [`Report::downcast_ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    StartTls,
    ExtendedHeaders,
    StructuredReply,
    MetaContext,
    Go,
    List,
    ExportName,
    Transmission,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Handshake => "handshake failed",
            Stage::StartTls => "STARTTLS failed",
            Stage::ExtendedHeaders => "extended headers negotiation failed",
            Stage::StructuredReply => "structured reply negotiation failed",
            Stage::MetaContext => "meta context negotiation failed",
            Stage::Go => "export info negotiation failed",
            Stage::List => "export listing failed",
            Stage::ExportName => "export name negotiation failed",
            Stage::Transmission => "request failed",
        };
        f.write_str(s)
    }
}

/// What the client asks for during negotiation.
#[derive(Clone)]
pub struct ClientOptions {
    /// Name of the export to use.
    pub export: String,
    /// Upgrade to TLS with these credentials before anything else.
    pub tls: Option<Arc<dyn TlsCreds>>,
    /// Host name passed to the TLS handshake.
    pub tls_hostname: String,
    /// Highest mode to negotiate.
    pub max_mode: Mode,
    /// Ask for `NBD_INFO_BLOCK_SIZE`.
    pub request_sizes: bool,
    /// Meta context to select for block status queries.
    pub meta_context: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            export: String::new(),
            tls: None,
            tls_hostname: String::new(),
            max_mode: Mode::Extended,
            request_sizes: true,
            meta_context: None,
        }
    }
}

impl ClientOptions {
    pub fn new<S: Into<String>>(export: S) -> Self {
        Self {
            export: export.into(),
            ..Default::default()
        }
    }

    pub fn with_max_mode(mut self, mode: Mode) -> Self {
        self.max_mode = mode;
        self
    }

    /// Select a meta context for block status queries.
    pub fn with_meta_context<S: Into<String>>(mut self, context: S) -> Self {
        self.meta_context = Some(context.into());
        self
    }

    pub fn with_block_status(self) -> Self {
        self.with_meta_context(CONTEXT_BASE_ALLOCATION)
    }

    pub fn with_tls<S: Into<String>>(mut self, tls: Arc<dyn TlsCreds>, hostname: S) -> Self {
        self.tls = Some(tls);
        self.tls_hostname = hostname.into();
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("export", &self.export)
            .field("tls", &self.tls.is_some())
            .field("max_mode", &self.max_mode)
            .field("request_sizes", &self.request_sizes)
            .field("meta_context", &self.meta_context)
            .finish()
    }
}

/// What the server told us about an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub description: Option<String>,
    pub size: u64,
    pub flags: TransmitFlags,
    pub min_block: u32,
    pub preferred_block: u32,
    pub max_block: u32,
    /// ID of the negotiated meta context, if any.
    pub context_id: Option<u32>,
}

impl ExportInfo {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            size: 0,
            flags: TransmitFlags::empty(),
            min_block: 1,
            preferred_block: 4096,
            max_block: MAX_BUFFER_SIZE,
            context_id: None,
        }
    }
}

/// One entry of [`list_exports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportListing {
    pub name: String,
    pub description: Option<String>,
    /// `None` if the server refused `NBD_OPT_INFO` for this export.
    pub info: Option<ExportInfo>,
    /// Every meta context the server offers on the export.
    pub contexts: Vec<String>,
}

fn check_block_sizes(min: u32, preferred: u32, max: u32) -> core::result::Result<(), NbdError> {
    for (what, size) in [("minimum", min), ("preferred", preferred), ("maximum", max)] {
        if !size.is_power_of_two() {
            return Err(NbdError::protocol(format!(
                "server {what} block size {size} is not a power of two"
            )));
        }
    }
    if min > preferred || preferred > max {
        return Err(NbdError::protocol(format!(
            "server block sizes out of order: min {min}, preferred {preferred}, max {max}"
        )));
    }
    Ok(())
}

fn reply_error_kind(reply_type: u32) -> ErrorKind {
    match ReplyType::try_from(reply_type) {
        Ok(ReplyType::ERR_UNSUP) | Ok(ReplyType::ERR_PLATFORM) => ErrorKind::Unsupported,
        Ok(ReplyType::ERR_POLICY) | Ok(ReplyType::ERR_TLS_REQD) => ErrorKind::PermissionDenied,
        Ok(ReplyType::ERR_UNKNOWN) => ErrorKind::NotFound,
        Ok(ReplyType::ERR_SHUTDOWN) => ErrorKind::ShuttingDown,
        Ok(ReplyType::ERR_TOO_BIG) => ErrorKind::Overflow,
        _ => ErrorKind::InvalidArgument,
    }
}

/// Parse an `NBD_REP_SERVER` payload into name and description.
fn parse_server_reply(mut data: &[u8]) -> Result<(String, Option<String>)> {
    let len = data.read_u32::<BE>()? as usize;
    ensure!(
        len <= data.len() && len <= MAX_STRING_SIZE,
        NbdError::protocol(format!("export name length {len} is invalid"))
    );
    let name = String::from_utf8(data[..len].to_vec())
        .map_err(|_| NbdError::protocol("invalid UTF-8 in export name"))?;
    let desc = &data[len..];
    let desc = if desc.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(desc).into_owned())
    };
    Ok((name, desc))
}

/// Option-phase state of the client.
struct Negotiator {
    stream: Channel,
    fixed: bool,
    no_zeroes: bool,
    mode: Mode,
    /// Export info of an oldstyle server, which sends it right away.
    oldstyle: Option<ExportInfo>,
}

impl Negotiator {
    fn start(mut stream: Channel, opts: &ClientOptions) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        ensure!(
            magic == INIT_MAGIC,
            NbdError::protocol(format!("unexpected magic {magic:#x}"))
        );
        let magic = stream.read_u64::<BE>()?;
        match magic {
            CLIENT_MAGIC => {
                ensure!(
                    opts.tls.is_none(),
                    NbdError::new(
                        ErrorKind::PermissionDenied,
                        "server does not support TLS (oldstyle negotiation)"
                    )
                );
                // S: 64 bits, size of the export
                // S: 32 bits, flags
                // S: 124 bytes, zeroes
                let size = stream.read_u64::<BE>()?;
                let flags = stream.read_u32::<BE>()?;
                let mut zeroes = [0u8; RESERVED_ZEROES];
                stream.read_exact(&mut zeroes)?;
                let flags = TransmitFlags::from_bits_truncate((flags & 0xffff) as u16);
                info!("server uses oldstyle negotiation");
                let mut info = ExportInfo::new(&opts.export);
                info.size = size;
                info.flags = flags;
                Ok(Self {
                    stream,
                    fixed: false,
                    no_zeroes: false,
                    mode: Mode::OldStyle,
                    oldstyle: Some(info),
                })
            }
            OPTS_MAGIC => {
                let server_flags = HandshakeFlags::from_bits_truncate(stream.read_u16::<BE>()?);
                let fixed = server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE);
                let no_zeroes = server_flags.contains(HandshakeFlags::NO_ZEROES);
                let mut client_flags = ClientHandshakeFlags::empty();
                if fixed {
                    client_flags |= ClientHandshakeFlags::C_FIXED_NEWSTYLE;
                } else {
                    warn!("server does not support fixed newstyle negotiation");
                }
                if no_zeroes {
                    client_flags |= ClientHandshakeFlags::C_NO_ZEROES;
                }
                stream.write_u32::<BE>(client_flags.bits())?;
                stream.flush()?;
                Ok(Self {
                    stream,
                    fixed,
                    no_zeroes,
                    mode: if fixed { Mode::Simple } else { Mode::ExportName },
                    oldstyle: None,
                })
            }
            _ => bail!(NbdError::protocol(format!(
                "unexpected second magic {magic:#x}"
            ))),
        }
    }

    fn option(&mut self, typ: OptType, data: Vec<u8>) -> Result<()> {
        debug!("sending option {} with {} bytes", opt_name(typ.into()), data.len());
        Opt::new(typ, data).put(&mut self.stream)?;
        Ok(())
    }

    fn reply(&mut self, typ: OptType) -> Result<(OptReplyHeader, Vec<u8>)> {
        let hdr = OptReplyHeader::get(&mut self.stream)?;
        ensure!(
            hdr.opt == u32::from(typ),
            NbdError::protocol(format!(
                "unexpected option {} in reply to {}",
                opt_name(hdr.opt),
                opt_name(typ.into())
            ))
        );
        ensure!(
            hdr.len <= MAX_BUFFER_SIZE,
            NbdError::protocol(format!("option reply of {} bytes is too large", hdr.len))
        );
        let mut data = vec![0u8; hdr.len as usize];
        self.stream.read_exact(&mut data)?;
        debug!(
            "received {} reply to {} with {} bytes",
            rep_name(hdr.reply_type),
            opt_name(hdr.opt),
            hdr.len
        );
        Ok((hdr, data))
    }

    /// Tell the server we are leaving; nothing can be done if that fails.
    fn abort(&mut self) {
        if let Err(err) = Opt::new(OptType::ABORT, vec![]).put(&mut self.stream) {
            debug!("sending abort: {err}");
        }
    }

    /// Deal with an error reply. Returns true for a non-error reply, false for
    /// an error the caller can recover from; other errors are fatal.
    fn check_reply(&mut self, hdr: &OptReplyHeader, data: &[u8], strict: bool) -> Result<bool> {
        if !hdr.is_error() {
            return Ok(true);
        }
        let msg = String::from_utf8_lossy(data);
        if hdr.reply_type == u32::from(ReplyType::ERR_UNSUP) {
            debug!("server does not support option {}", opt_name(hdr.opt));
            return Ok(false);
        }
        if !strict {
            debug!(
                "server rejected option {}: {} {msg}",
                opt_name(hdr.opt),
                rep_name(hdr.reply_type)
            );
            return Ok(false);
        }
        self.abort();
        let mut err = format!(
            "server rejected option {}: {}",
            opt_name(hdr.opt),
            rep_name(hdr.reply_type)
        );
        if !msg.is_empty() {
            err.push_str(&format!(" ({msg})"));
        }
        bail!(NbdError::new(reply_error_kind(hdr.reply_type), err))
    }

    /// Send an option without payload that expects a bare ACK.
    fn simple_option(&mut self, typ: OptType, strict: bool) -> Result<bool> {
        self.option(typ, vec![])?;
        let (hdr, data) = self.reply(typ)?;
        if !self.check_reply(&hdr, &data, strict)? {
            return Ok(false);
        }
        if hdr.reply_type != u32::from(ReplyType::ACK) {
            self.abort();
            bail!(NbdError::protocol(format!(
                "unexpected reply {} to {}",
                rep_name(hdr.reply_type),
                opt_name(typ.into())
            )));
        }
        Ok(true)
    }

    fn starttls(&mut self, creds: &dyn TlsCreds, hostname: &str) -> Result<()> {
        ensure!(
            self.fixed,
            NbdError::new(
                ErrorKind::Unsupported,
                "server does not support fixed newstyle, cannot use TLS"
            )
        );
        if !self.simple_option(OptType::STARTTLS, true)? {
            self.abort();
            bail!(NbdError::new(
                ErrorKind::Unsupported,
                "server does not support STARTTLS"
            ));
        }
        debug!("starting TLS handshake with {hostname}");
        let plain = mem::replace(&mut self.stream, Channel::new(io::empty(), io::sink()));
        self.stream = creds.client_handshake(plain, hostname)?;
        Ok(())
    }

    fn negotiate_modes(&mut self, max: Mode) -> Result<()> {
        if max >= Mode::Extended
            && self
                .simple_option(OptType::EXTENDED_HEADERS, false)
                .wrap_err(Stage::ExtendedHeaders)?
        {
            self.mode = Mode::Extended;
        }
        if self.mode < Mode::Structured
            && max >= Mode::Structured
            && self
                .simple_option(OptType::STRUCTURED_REPLY, false)
                .wrap_err(Stage::StructuredReply)?
        {
            self.mode = Mode::Structured;
        }
        debug!("negotiated {:?} mode", self.mode);
        Ok(())
    }

    fn set_meta_context(&mut self, export: &str, query: &str) -> Result<Option<u32>> {
        let req = MetaContextRequest {
            export: export.to_string(),
            queries: vec![query.to_string()],
        };
        self.option(OptType::SET_META_CONTEXT, req.encode())?;
        let mut found = None;
        loop {
            let (hdr, data) = self.reply(OptType::SET_META_CONTEXT)?;
            if !self.check_reply(&hdr, &data, false)? {
                return Ok(None);
            }
            match ReplyType::try_from(hdr.reply_type) {
                Ok(ReplyType::ACK) => {
                    if found.is_none() {
                        info!("server does not support meta context {query}");
                    }
                    return Ok(found);
                }
                Ok(ReplyType::META_CONTEXT) => {
                    let ctx = MetaContext::decode(&data)?;
                    if ctx.name != query {
                        self.abort();
                        bail!(NbdError::protocol(format!(
                            "server replied with unexpected meta context {}",
                            ctx.name
                        )));
                    }
                    if found.is_some() {
                        self.abort();
                        bail!(NbdError::protocol("server sent more than one meta context"));
                    }
                    debug!("meta context {} has id {}", ctx.name, ctx.id);
                    found = Some(ctx.id);
                }
                _ => {
                    self.abort();
                    bail!(NbdError::protocol(format!(
                        "unexpected reply {} to set meta context",
                        rep_name(hdr.reply_type)
                    )));
                }
            }
        }
    }

    fn list_meta_contexts(&mut self, export: &str) -> Result<Vec<String>> {
        let req = MetaContextRequest {
            export: export.to_string(),
            queries: vec![],
        };
        self.option(OptType::LIST_META_CONTEXT, req.encode())?;
        let mut contexts = vec![];
        loop {
            let (hdr, data) = self.reply(OptType::LIST_META_CONTEXT)?;
            if !self.check_reply(&hdr, &data, false)? {
                return Ok(contexts);
            }
            match ReplyType::try_from(hdr.reply_type) {
                Ok(ReplyType::ACK) => return Ok(contexts),
                Ok(ReplyType::META_CONTEXT) => contexts.push(MetaContext::decode(&data)?.name),
                _ => bail!(NbdError::protocol(format!(
                    "unexpected reply {} to list meta context",
                    rep_name(hdr.reply_type)
                ))),
            }
        }
    }

    fn parse_info(info: &mut ExportInfo, data: &[u8], seen_export: &mut bool) -> Result<()> {
        match Info::decode(data)? {
            Some(Info::Export { size, flags }) => {
                debug!("export size {size}, flags {flags:?}");
                info.size = size;
                info.flags = flags;
                *seen_export = true;
            }
            Some(Info::BlockSize {
                min,
                preferred,
                max,
            }) => {
                check_block_sizes(min, preferred, max)?;
                info.min_block = min;
                info.preferred_block = preferred;
                info.max_block = max;
            }
            Some(Info::Name(name)) => info.name = name,
            Some(Info::Description(desc)) => info.description = Some(desc),
            None => debug!("skipping unknown info reply"),
        }
        Ok(())
    }

    /// Send NBD_OPT_INFO or NBD_OPT_GO. `None` means the server refused in a
    /// way the caller may recover from.
    fn info(&mut self, typ: OptType, name: &str, wants: Vec<u16>, strict: bool) -> Result<Option<ExportInfo>> {
        let req = InfoRequest {
            name: name.to_string(),
            typs: wants,
        };
        self.option(typ, req.encode())?;
        let mut info = ExportInfo::new(name);
        let mut seen_export = false;
        loop {
            let (hdr, data) = self.reply(typ)?;
            if !self.check_reply(&hdr, &data, strict)? {
                return Ok(None);
            }
            match ReplyType::try_from(hdr.reply_type) {
                Ok(ReplyType::INFO) => Self::parse_info(&mut info, &data, &mut seen_export)?,
                Ok(ReplyType::ACK) => {
                    ensure!(
                        seen_export,
                        NbdError::protocol("server did not send export info")
                    );
                    return Ok(Some(info));
                }
                _ => {
                    self.abort();
                    bail!(NbdError::protocol(format!(
                        "unexpected reply {} to {}",
                        rep_name(hdr.reply_type),
                        opt_name(typ.into())
                    )));
                }
            }
        }
    }

    /// Export names and descriptions; `None` if the server refused.
    fn list(&mut self, strict: bool) -> Result<Option<Vec<(String, Option<String>)>>> {
        self.option(OptType::LIST, vec![])?;
        let mut exports = vec![];
        loop {
            let (hdr, data) = self.reply(OptType::LIST)?;
            if !self.check_reply(&hdr, &data, strict)? {
                return Ok(None);
            }
            match ReplyType::try_from(hdr.reply_type) {
                Ok(ReplyType::SERVER) => exports.push(parse_server_reply(&data)?),
                Ok(ReplyType::ACK) => return Ok(Some(exports)),
                _ => bail!(NbdError::protocol(format!(
                    "unexpected reply {} to list",
                    rep_name(hdr.reply_type)
                ))),
            }
        }
    }

    fn export_name(&mut self, name: &str) -> Result<ExportInfo> {
        self.option(OptType::EXPORT_NAME, name.as_bytes().to_vec())?;
        // S: 64 bits, size of the export in bytes (unsigned)
        // S: 16 bits, transmission flags
        // S: 124 bytes, zeroes (reserved) (unless `NBD_FLAG_C_NO_ZEROES` was negotiated)
        let size = match self.stream.read_u64::<BE>() {
            Ok(size) => size,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                bail!(NbdError::new(
                    ErrorKind::NotFound,
                    format!("server closed the connection; export '{name}' may not exist")
                ))
            }
            Err(err) => return Err(err.into()),
        };
        let flags = self.stream.read_u16::<BE>()?;
        let flags = TransmitFlags::from_bits_truncate(flags);
        if !self.no_zeroes {
            let mut zeroes = [0u8; RESERVED_ZEROES];
            self.stream.read_exact(&mut zeroes)?;
        }
        let mut info = ExportInfo::new(name);
        info.size = size;
        info.flags = flags;
        Ok(info)
    }
}

/// Client provides an interface to an export from a remote NBD server.
pub struct Client {
    conn: Channel,
    mode: Mode,
    info: ExportInfo,
    cookie: u64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.mode)
            .field("info", &self.info)
            .field("cookie", &self.cookie)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to a server over TCP.
    pub fn connect(host: &str, port: u16, opts: &ClientOptions) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .wrap_err_with(|| format!("connecting to {host}:{port}"))?;
        Self::new(Channel::tcp(stream)?, opts)
    }

    /// Negotiate on `channel` and return a Client ready for use.
    pub fn new(channel: Channel, opts: &ClientOptions) -> Result<Self> {
        let mut neg = Negotiator::start(channel, opts).wrap_err(Stage::Handshake)?;
        if let Some(info) = neg.oldstyle.take() {
            return Ok(Self::established(neg.stream, Mode::OldStyle, info));
        }
        if let Some(creds) = &opts.tls {
            neg.starttls(creds.as_ref(), &opts.tls_hostname)
                .wrap_err(Stage::StartTls)?;
        }
        if neg.fixed {
            neg.negotiate_modes(opts.max_mode)?;
        }

        let context_id = match &opts.meta_context {
            Some(query) if neg.mode.structured() => neg
                .set_meta_context(&opts.export, query)
                .wrap_err(Stage::MetaContext)?,
            Some(query) => {
                debug!("not requesting meta context {query} without structured replies");
                None
            }
            None => None,
        };

        let mut info = None;
        if neg.fixed {
            let wants = if opts.request_sizes {
                vec![InfoType::BLOCK_SIZE.into()]
            } else {
                vec![]
            };
            info = neg
                .info(OptType::GO, &opts.export, wants, true)
                .wrap_err(Stage::Go)?;
            if info.is_none() {
                // old server: LIST only for a friendlier error message
                if let Some(exports) = neg.list(false).wrap_err(Stage::List)? {
                    if !exports.iter().any(|(name, _)| name == &opts.export) {
                        neg.abort();
                        return Err(Report::new(NbdError::new(
                            ErrorKind::NotFound,
                            format!("export '{}' not present", opts.export),
                        ))
                        .wrap_err(Stage::List));
                    }
                }
            }
        }
        let mut info = match info {
            Some(info) => info,
            None => neg.export_name(&opts.export).wrap_err(Stage::ExportName)?,
        };
        info.context_id = context_id;
        Ok(Self::established(neg.stream, neg.mode, info))
    }

    fn established(conn: Channel, mode: Mode, info: ExportInfo) -> Self {
        info!(
            "connected to export '{}' ({} bytes) in {mode:?} mode",
            info.name, info.size
        );
        Self {
            conn,
            mode,
            info,
            cookie: 1,
        }
    }

    /// Return the size of this export, as reported by the server during the
    /// handshake.
    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn info(&self) -> &ExportInfo {
        &self.info
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn send(&mut self, cmd: Cmd, flags: CmdFlags, from: u64, len: u64, payload: &[u8]) -> Result<u64> {
        let cookie = self.cookie;
        self.cookie += 1;
        let req = Request::new(cmd, from, len)
            .with_flags(flags)
            .with_cookie(cookie);
        debug!(target: "nbd", "sending {:?}", req);
        let mut buf = req.encode(self.mode.extended())?;
        buf.extend_from_slice(payload);
        self.conn.write_all(&buf)?;
        self.conn.flush()?;
        Ok(cookie)
    }

    fn header(&mut self, cookie: u64) -> Result<ReplyHeader> {
        let hdr = ReplyHeader::get(&mut self.conn, self.mode)?;
        ensure!(
            hdr.cookie() == cookie,
            NbdError::protocol(format!(
                "reply cookie {:#x} does not match request {cookie:#x}",
                hdr.cookie()
            ))
        );
        Ok(hdr)
    }

    fn command_error(what: &str, code: u32, msg: &str) -> NbdError {
        let kind = WireError::to_kind(code).unwrap_or(ErrorKind::Protocol);
        if msg.is_empty() {
            NbdError::new(kind, format!("{what} failed"))
        } else {
            NbdError::new(kind, format!("{what} failed: {msg}"))
        }
    }

    fn chunk_payload(&mut self, chunk: &ChunkHeader) -> Result<Vec<u8>> {
        ensure!(
            chunk.length <= MAX_CHUNK_LEN,
            NbdError::protocol(format!("{}-byte reply chunk is too large", chunk.length))
        );
        let mut data = vec![0u8; chunk.length as usize];
        self.conn.read_exact(&mut data)?;
        Ok(data)
    }

    /// Read chunks until one carries the DONE flag, handing data-bearing
    /// chunks to `f`. The first error chunk becomes the result.
    fn structured_reply<F>(&mut self, cookie: u64, what: &str, first: ChunkHeader, mut f: F) -> Result<()>
    where
        F: FnMut(&ChunkHeader, &[u8]) -> Result<()>,
    {
        let mut error: Option<NbdError> = None;
        let mut chunk = first;
        loop {
            let data = self.chunk_payload(&chunk)?;
            if ChunkType::is_error(chunk.typ) {
                let with_offset = chunk.typ == u16::from(ChunkType::ERROR_OFFSET);
                let payload = ErrorPayload::decode(&data, with_offset)?;
                debug!(target: "nbd", "{what} error chunk: {} {}", payload.error, payload.msg);
                if error.is_none() {
                    error = Some(Self::command_error(what, payload.error, &payload.msg));
                }
            } else if chunk.typ == u16::from(ChunkType::NONE) {
                ensure!(
                    chunk.done() && data.is_empty(),
                    NbdError::protocol("none chunk must be empty and final")
                );
            } else {
                f(&chunk, &data)?;
            }
            if chunk.done() {
                break;
            }
            chunk = match self.header(cookie)? {
                ReplyHeader::Chunk(chunk) => chunk,
                ReplyHeader::Simple { .. } => bail!(NbdError::protocol(
                    "simple reply in the middle of a structured reply"
                )),
            };
        }
        match error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn get_ack(&mut self, cookie: u64, what: &str) -> Result<()> {
        match self.header(cookie)? {
            ReplyHeader::Simple { error: 0, .. } => Ok(()),
            ReplyHeader::Simple { error, .. } => Err(Self::command_error(what, error, "").into()),
            ReplyHeader::Chunk(chunk) => self.structured_reply(cookie, what, chunk, |chunk, _| {
                bail!(NbdError::protocol(format!(
                    "unexpected {} chunk",
                    chunk_name(chunk.typ)
                )))
            }),
        }
    }

    fn do_read(&mut self, offset: u64, len: u32, flags: CmdFlags) -> Result<Vec<u8>> {
        let cookie = self.send(Cmd::READ, flags, offset, len as u64, &[])?;
        let mut buf = vec![0u8; len as usize];
        match self.header(cookie)? {
            ReplyHeader::Simple { error: 0, .. } => self.conn.read_exact(&mut buf)?,
            ReplyHeader::Simple { error, .. } => {
                return Err(Self::command_error("read", error, "").into())
            }
            ReplyHeader::Chunk(chunk) => {
                let end = offset + len as u64;
                let mut covered = 0u64;
                let mut place = |start: u64, n: u64| -> Result<std::ops::Range<usize>> {
                    ensure!(
                        start >= offset && start.checked_add(n).map_or(false, |e| e <= end),
                        NbdError::protocol(format!(
                            "chunk [{start}, +{n}) outside of requested range"
                        ))
                    );
                    covered += n;
                    let at = (start - offset) as usize;
                    Ok(at..at + n as usize)
                };
                let buf_ref = &mut buf;
                self.structured_reply(cookie, "read", chunk, |chunk, data| {
                    match ChunkType::try_from(chunk.typ) {
                        Ok(ChunkType::OFFSET_DATA) => {
                            ensure!(
                                data.len() > 8,
                                NbdError::protocol("data chunk is too short")
                            );
                            let start = BE::read_u64(&data[..8]);
                            let range = place(start, (data.len() - 8) as u64)?;
                            buf_ref[range].copy_from_slice(&data[8..]);
                        }
                        Ok(ChunkType::OFFSET_HOLE) => {
                            let hole = OffsetHole::decode(data)?;
                            let range = place(hole.offset, hole.len as u64)?;
                            buf_ref[range].fill(0);
                        }
                        _ => bail!(NbdError::protocol(format!(
                            "unexpected {} chunk in read reply",
                            chunk_name(chunk.typ)
                        ))),
                    }
                    Ok(())
                })?;
                ensure!(
                    covered == len as u64,
                    NbdError::protocol(format!("read reply covered {covered} of {len} bytes"))
                );
            }
        }
        Ok(buf)
    }

    /// Send a read command to the NBD server.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.read_with_flags(offset, len, CmdFlags::empty())
    }

    /// Read with command flags (eg, [`CmdFlags::DF`]).
    pub fn read_with_flags(&mut self, offset: u64, len: u32, flags: CmdFlags) -> Result<Vec<u8>> {
        self.do_read(offset, len, flags)
            .wrap_err(Stage::Transmission)
    }

    /// Send a write command to the NBD server.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_with_flags(offset, data, CmdFlags::empty())
    }

    pub fn write_with_flags(&mut self, offset: u64, data: &[u8], flags: CmdFlags) -> Result<()> {
        let cookie = self
            .send(Cmd::WRITE, flags, offset, data.len() as u64, data)
            .wrap_err(Stage::Transmission)?;
        self.get_ack(cookie, "write").wrap_err(Stage::Transmission)
    }

    /// Send a flush command to the NBD server.
    pub fn flush(&mut self) -> Result<()> {
        self.simple_command(Cmd::FLUSH, CmdFlags::empty(), 0, 0)
    }

    pub fn trim(&mut self, offset: u64, len: u64) -> Result<()> {
        self.simple_command(Cmd::TRIM, CmdFlags::empty(), offset, len)
    }

    pub fn write_zeroes(&mut self, offset: u64, len: u64, flags: CmdFlags) -> Result<()> {
        self.simple_command(Cmd::WRITE_ZEROES, flags, offset, len)
    }

    pub fn cache(&mut self, offset: u64, len: u64) -> Result<()> {
        self.simple_command(Cmd::CACHE, CmdFlags::empty(), offset, len)
    }

    fn simple_command(&mut self, cmd: Cmd, flags: CmdFlags, offset: u64, len: u64) -> Result<()> {
        let what = cmd_name(cmd.into());
        let cookie = self
            .send(cmd, flags, offset, len, &[])
            .wrap_err(Stage::Transmission)?;
        self.get_ack(cookie, what).wrap_err(Stage::Transmission)
    }

    fn do_block_status(&mut self, offset: u64, len: u64, flags: CmdFlags) -> Result<Vec<Extent>> {
        let id = self.info.context_id.ok_or_else(|| {
            NbdError::new(ErrorKind::Unsupported, "no meta context negotiated")
        })?;
        let cookie = self.send(Cmd::BLOCK_STATUS, flags, offset, len, &[])?;
        let extended = self.mode.extended();
        let want = if extended {
            ChunkType::BLOCK_STATUS_EXT
        } else {
            ChunkType::BLOCK_STATUS
        };
        let mut extents = None;
        match self.header(cookie)? {
            ReplyHeader::Simple { error: 0, .. } => bail!(NbdError::protocol(
                "successful simple reply to block status"
            )),
            ReplyHeader::Simple { error, .. } => {
                return Err(Self::command_error("block status", error, "").into())
            }
            ReplyHeader::Chunk(chunk) => {
                self.structured_reply(cookie, "block status", chunk, |chunk, data| {
                    ensure!(
                        chunk.typ == u16::from(want),
                        NbdError::protocol(format!(
                            "unexpected {} chunk in block status reply",
                            chunk_name(chunk.typ)
                        ))
                    );
                    let payload = BlockStatusPayload::decode(data, extended)?;
                    ensure!(
                        payload.context_id == id,
                        NbdError::protocol(format!(
                            "block status for unexpected context {}",
                            payload.context_id
                        ))
                    );
                    ensure!(
                        extents.is_none(),
                        NbdError::protocol("more block status chunks than negotiated contexts")
                    );
                    ensure!(
                        payload.extents.iter().all(|e| e.length > 0),
                        NbdError::protocol("zero-length extent")
                    );
                    extents = Some(payload.extents);
                    Ok(())
                })?;
            }
        }
        Ok(extents.ok_or_else(|| NbdError::protocol("no block status chunk for the negotiated context"))?)
    }

    /// Query the negotiated meta context over `[offset, offset+len)`.
    pub fn block_status(&mut self, offset: u64, len: u64, flags: CmdFlags) -> Result<Vec<Extent>> {
        self.do_block_status(offset, len, flags)
            .wrap_err(Stage::Transmission)
    }

    /// Send a disconnect command; the server closes the connection without
    /// replying.
    pub fn disconnect(mut self) -> Result<()> {
        self.send(Cmd::DISCONNECT, CmdFlags::empty(), 0, 0, &[])?;
        Ok(())
    }
}

/// List the exports of a server, with whatever each one reports through
/// `NBD_OPT_INFO` and `NBD_OPT_LIST_META_CONTEXT`, then abort negotiation.
pub fn list_exports(channel: Channel, opts: &ClientOptions) -> Result<Vec<ExportListing>> {
    let mut neg = Negotiator::start(channel, opts).wrap_err(Stage::Handshake)?;
    if !neg.fixed {
        bail!(NbdError::new(
            ErrorKind::Unsupported,
            "server does not support listing exports"
        ));
    }
    if let Some(creds) = &opts.tls {
        neg.starttls(creds.as_ref(), &opts.tls_hostname)
            .wrap_err(Stage::StartTls)?;
    }
    if opts.max_mode >= Mode::Structured
        && neg
            .simple_option(OptType::STRUCTURED_REPLY, false)
            .wrap_err(Stage::StructuredReply)?
    {
        neg.mode = Mode::Structured;
    }

    let exports = neg
        .list(true)
        .wrap_err(Stage::List)?
        .ok_or_else(|| NbdError::new(ErrorKind::Unsupported, "server does not support NBD_OPT_LIST"))
        .wrap_err(Stage::List)?;
    let mut listings = vec![];
    for (name, description) in exports {
        let wants = vec![
            InfoType::NAME.into(),
            InfoType::DESCRIPTION.into(),
            InfoType::BLOCK_SIZE.into(),
        ];
        let info = neg
            .info(OptType::INFO, &name, wants, false)
            .wrap_err(Stage::Go)?;
        let contexts = if neg.mode.structured() {
            neg.list_meta_contexts(&name).wrap_err(Stage::MetaContext)?
        } else {
            vec![]
        };
        listings.push(ExportListing {
            name,
            description,
            info,
            contexts,
        });
    }
    neg.abort();
    Ok(listings)
}
