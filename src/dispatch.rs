//! Transmission phase on the server: read requests, validate them against the
//! export, run them on the backing store and build the reply.
//!
//! Each reply is assembled into one buffer and written under the session's
//! send lock, so chunks of different requests never interleave on the wire.
use std::io::{self, prelude::*};
use std::sync::{Arc, Mutex};
use std::thread;

use color_eyre::eyre::{ensure, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};

use crate::conn::ConnRef;
use crate::errors::{ErrorKind, NbdError, WireError};
use crate::export::Export;
use crate::proto::*;

/// Everything the transmission phase needs to know about a connection.
pub(crate) struct Session {
    export: Arc<Export>,
    mode: Mode,
    /// Negotiated meta context IDs, ascending.
    contexts: Vec<u32>,
    /// Minimum block size the client agreed to, if any; only traced.
    check_align: u32,
    writer: Mutex<Box<dyn Write + Send>>,
}

/// A request that passed (or failed) validation, with its payload consumed.
pub(crate) struct Incoming {
    req: Request,
    payload: Vec<u8>,
    /// Length the command acts on; differs from `req.len` for block status
    /// requests carrying a payload.
    effect_len: u64,
    /// Contexts a block status request asks for.
    contexts: Vec<u32>,
    error: Option<NbdError>,
}

pub(crate) enum Received {
    Disconnect,
    Request(Incoming),
}

type OpResult = core::result::Result<(), NbdError>;

impl Session {
    pub fn new(
        export: Arc<Export>,
        mode: Mode,
        contexts: Vec<u32>,
        check_align: u32,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            export,
            mode,
            contexts,
            check_align,
            writer: Mutex::new(writer),
        }
    }

    /// Read one request and its payload, and validate it.
    pub fn receive<R: Read>(&self, mut reader: R) -> Result<Received> {
        let extended = self.mode.extended();
        let req = Request::get(&mut reader, extended)?;
        debug!(target: "nbd", "{:?}", req);
        let cmd = req.cmd();
        if cmd == Some(Cmd::DISCONNECT) {
            return Ok(Received::Disconnect);
        }

        let mut incoming = Incoming {
            effect_len: req.len,
            payload: vec![],
            contexts: vec![],
            error: None,
            req,
        };
        let req = &incoming.req;
        let has_payload =
            cmd == Some(Cmd::WRITE) || (extended && req.has_flag(CmdFlags::PAYLOAD_LEN));
        if has_payload {
            let len = req.len;
            ensure!(
                len <= MAX_BUFFER_SIZE as u64,
                NbdError::protocol(format!(
                    "{} payload of {len} bytes is larger than max {MAX_BUFFER_SIZE}",
                    cmd_name(req.typ)
                ))
            );
            let mut payload = vec![0u8; len as usize];
            reader
                .read_exact(&mut payload)
                .wrap_err_with(|| format!("reading {len}-byte {} payload", cmd_name(req.typ)))?;
            match cmd {
                Some(Cmd::WRITE) => incoming.payload = payload,
                Some(Cmd::BLOCK_STATUS) => self.parse_filter(&mut incoming, &payload),
                _ => warn!(
                    target: "nbd",
                    "discarding unexpected {len}-byte payload of {} request",
                    cmd_name(incoming.req.typ)
                ),
            }
        } else if cmd == Some(Cmd::BLOCK_STATUS) {
            incoming.contexts = self.contexts.clone();
        }

        if incoming.error.is_none() {
            incoming.error = self.validate(&incoming).err();
        }
        Ok(Received::Request(incoming))
    }

    fn parse_filter(&self, incoming: &mut Incoming, payload: &[u8]) {
        if self.contexts.is_empty() {
            incoming.error = Some(NbdError::invalid("no meta contexts negotiated"));
            return;
        }
        let filter = match BlockStatusFilter::decode(payload) {
            Some(filter) if !filter.ids.is_empty() => filter,
            _ => {
                incoming.error = Some(NbdError::invalid("block status payload not valid"));
                return;
            }
        };
        if let Some(id) = filter.ids.iter().find(|id| !self.contexts.contains(id)) {
            warn!(target: "nbd", "block status payload names context {id}, which was not negotiated");
            incoming.error = Some(NbdError::invalid("block status payload not valid"));
            return;
        }
        incoming.effect_len = filter.effect_len;
        incoming.contexts = self
            .contexts
            .iter()
            .copied()
            .filter(|id| filter.ids.contains(id))
            .collect();
    }

    fn validate(&self, incoming: &Incoming) -> OpResult {
        let req = &incoming.req;
        let cmd = match req.cmd() {
            Some(Cmd::RESIZE) | None => {
                return Err(NbdError::invalid(format!(
                    "unsupported command {} ({})",
                    req.typ,
                    cmd_name(req.typ)
                )))
            }
            Some(cmd) => cmd,
        };

        match cmd {
            Cmd::READ | Cmd::CACHE if req.len > MAX_BUFFER_SIZE as u64 => {
                return Err(NbdError::invalid(format!(
                    "len ({}) is larger than max len ({MAX_BUFFER_SIZE})",
                    req.len
                )));
            }
            Cmd::BLOCK_STATUS if incoming.effect_len == 0 => {
                return Err(NbdError::invalid("block status of zero length"));
            }
            Cmd::BLOCK_STATUS if incoming.contexts.is_empty() => {
                return Err(NbdError::invalid("no meta contexts negotiated"));
            }
            _ => {}
        }

        if self.export.read_only() && matches!(cmd, Cmd::WRITE | Cmd::WRITE_ZEROES | Cmd::TRIM) {
            return Err(NbdError::new(
                ErrorKind::PermissionDenied,
                "export is read-only",
            ));
        }

        // FLUSH applies to the whole export and ignores its offset and
        // length, so they are not checked against the size.
        if cmd != Cmd::FLUSH {
            let in_bounds = matches!(
                req.from.checked_add(incoming.effect_len),
                Some(end) if end <= self.export.size()
            );
            if !in_bounds {
                let kind = match cmd {
                    Cmd::WRITE | Cmd::WRITE_ZEROES => ErrorKind::NoSpace,
                    _ => ErrorKind::InvalidArgument,
                };
                return Err(NbdError::new(
                    kind,
                    format!(
                        "operation past EOF; from={}, len={}, size={}",
                        req.from,
                        incoming.effect_len,
                        self.export.size()
                    ),
                ));
            }
        }

        let mut valid = CmdFlags::FUA;
        match cmd {
            Cmd::READ if self.mode.structured() => valid |= CmdFlags::DF,
            Cmd::WRITE_ZEROES => valid |= CmdFlags::NO_HOLE | CmdFlags::FAST_ZERO,
            Cmd::BLOCK_STATUS => {
                valid |= CmdFlags::REQ_ONE;
                if self.mode.extended() {
                    valid |= CmdFlags::PAYLOAD_LEN;
                }
            }
            _ => {}
        }
        if req.flags & !valid.bits() != 0 {
            return Err(NbdError::invalid(format!(
                "unsupported flags for {} (got {:#x})",
                cmd_name(req.typ),
                req.flags
            )));
        }

        if cmd != Cmd::READ && self.export.blocks().is_inactive() {
            return Err(NbdError::new(
                ErrorKind::PermissionDenied,
                "export is inactive",
            ));
        }

        let align = self.check_align as u64;
        if align > 1 && cmd != Cmd::FLUSH && (req.from % align != 0 || incoming.effect_len % align != 0) {
            warn!(
                target: "nbd",
                "client sent non-compliant unaligned {} request: from={:#x}, len={:#x}, align={align:#x}",
                cmd_name(req.typ),
                req.from,
                incoming.effect_len
            );
        }
        Ok(())
    }

    /// Run a request and build its complete reply.
    pub fn execute(&self, incoming: Incoming) -> Vec<u8> {
        let mut buf = vec![];
        let req = &incoming.req;
        if let Some(err) = &incoming.error {
            self.error_reply(req, err, &mut buf);
            return buf;
        }
        let blocks = self.export.blocks();
        let fua = req.has_flag(CmdFlags::FUA);
        let io_err = |err: io::Error| NbdError::from_io(&err);
        let result = match req.cmd() {
            Some(Cmd::READ) => {
                self.read(req, &mut buf);
                return buf;
            }
            Some(Cmd::BLOCK_STATUS) => {
                self.block_status(&incoming, &mut buf);
                return buf;
            }
            Some(Cmd::WRITE) => blocks
                .write_at(&incoming.payload, req.from, fua || self.export.writethrough())
                .map_err(io_err),
            Some(Cmd::WRITE_ZEROES) => blocks
                .write_zeroes(
                    req.from,
                    req.len,
                    !req.has_flag(CmdFlags::NO_HOLE),
                    req.has_flag(CmdFlags::FAST_ZERO),
                )
                .and_then(|_| if fua { blocks.flush() } else { Ok(()) })
                .map_err(io_err),
            Some(Cmd::TRIM) => blocks
                .trim(req.from, req.len)
                .and_then(|_| if fua { blocks.flush() } else { Ok(()) })
                .map_err(io_err),
            Some(Cmd::FLUSH) => blocks.flush().map_err(io_err),
            Some(Cmd::CACHE) => blocks.cache(req.from, req.len).map_err(io_err),
            // rejected by validation
            _ => Err(NbdError::invalid(format!("unsupported command {}", req.typ))),
        };
        self.generic_reply(req, result, &mut buf);
        buf
    }

    fn put_chunk(&self, buf: &mut Vec<u8>, typ: ChunkType, req: &Request, done: bool, payload: &[u8]) {
        let mut header = ChunkHeader::new(typ, req.cookie, req.from);
        if done {
            header.flags |= ReplyFlags::DONE;
        }
        header.encode(self.mode.extended(), payload.len(), buf);
        buf.extend_from_slice(payload);
    }

    fn generic_reply(&self, req: &Request, result: OpResult, buf: &mut Vec<u8>) {
        match result {
            Err(err) => self.error_reply(req, &err, buf),
            Ok(()) if self.mode.structured() => self.put_chunk(buf, ChunkType::NONE, req, true, &[]),
            Ok(()) => SimpleReply::ok(req.cookie).encode(buf),
        }
    }

    fn error_reply(&self, req: &Request, err: &NbdError, buf: &mut Vec<u8>) {
        let wire = WireError::from(err.kind());
        warn!(
            target: "nbd",
            "{} request {:#x} failed with {}: {}",
            cmd_name(req.typ),
            req.cookie,
            wire.name(),
            err.message()
        );
        if self.mode.structured() {
            let mut payload = vec![];
            ErrorPayload {
                error: wire.into(),
                msg: err.message().to_string(),
                offset: None,
            }
            .encode(&mut payload);
            self.put_chunk(buf, ChunkType::ERROR, req, true, &payload);
        } else {
            SimpleReply::err(wire.into(), req.cookie).encode(buf);
        }
    }

    fn read(&self, req: &Request, buf: &mut Vec<u8>) {
        if self.mode.structured() && !req.has_flag(CmdFlags::DF) && req.len > 0 {
            match self.sparse_read(req) {
                Ok(reply) => *buf = reply,
                Err(err) => self.error_reply(req, &err, buf),
            }
            return;
        }
        let mut data = vec![0u8; req.len as usize];
        if let Err(err) = self.export.blocks().read_at(&mut data, req.from) {
            self.error_reply(req, &NbdError::from_io(&err), buf);
            return;
        }
        if !self.mode.structured() {
            SimpleReply::data(req.cookie, &data).encode(buf);
        } else if data.is_empty() {
            self.generic_reply(req, Ok(()), buf);
        } else {
            let mut payload = Vec::with_capacity(8 + data.len());
            payload.extend_from_slice(&req.from.to_be_bytes());
            payload.extend_from_slice(&data);
            self.put_chunk(buf, ChunkType::OFFSET_DATA, req, true, &payload);
        }
    }

    /// Read with holes: unallocated zero ranges become hole chunks, the rest
    /// is sent as data.
    fn sparse_read(&self, req: &Request) -> core::result::Result<Vec<u8>, NbdError> {
        let blocks = self.export.blocks();
        let end = req.from + req.len;
        let mut chunks: Vec<(ChunkType, Vec<u8>)> = vec![];
        let mut off = req.from;
        while off < end {
            let runs = blocks
                .block_status(off, end - off)
                .map_err(|err| NbdError::from_io(&err))?;
            let start = off;
            for run in runs {
                let len = run.len.min(end - off);
                if len == 0 {
                    break;
                }
                if !run.allocated && run.zero {
                    let mut payload = vec![];
                    OffsetHole {
                        offset: off,
                        len: len as u32,
                    }
                    .encode(&mut payload);
                    chunks.push((ChunkType::OFFSET_HOLE, payload));
                } else {
                    let mut data = vec![0u8; len as usize];
                    blocks
                        .read_at(&mut data, off)
                        .map_err(|err| NbdError::from_io(&err))?;
                    match chunks.last_mut() {
                        // data chunk payloads start with their offset
                        Some((ChunkType::OFFSET_DATA, payload)) => payload.extend_from_slice(&data),
                        _ => {
                            let mut payload = Vec::with_capacity(8 + data.len());
                            payload.extend_from_slice(&off.to_be_bytes());
                            payload.extend_from_slice(&data);
                            chunks.push((ChunkType::OFFSET_DATA, payload));
                        }
                    }
                }
                off += len;
                if off >= end {
                    break;
                }
            }
            if off == start {
                return Err(NbdError::new(
                    ErrorKind::Io,
                    format!("no allocation status at offset {off}"),
                ));
            }
        }

        let mut buf = vec![];
        let last = chunks.len().saturating_sub(1);
        for (i, (typ, payload)) in chunks.iter().enumerate() {
            self.put_chunk(&mut buf, *typ, req, i == last, payload);
        }
        Ok(buf)
    }

    fn block_status(&self, incoming: &Incoming, buf: &mut Vec<u8>) {
        let req = &incoming.req;
        let max_extents = if req.has_flag(CmdFlags::REQ_ONE) {
            1
        } else {
            MAX_BLOCK_STATUS_EXTENTS
        };
        let mut payloads = vec![];
        for &id in &incoming.contexts {
            match self.extents(id, req.from, incoming.effect_len, max_extents) {
                Ok(extents) => payloads.push(BlockStatusPayload {
                    context_id: id,
                    extents,
                }),
                Err(err) => {
                    self.error_reply(req, &err, buf);
                    return;
                }
            }
        }
        let typ = if self.mode.extended() {
            ChunkType::BLOCK_STATUS_EXT
        } else {
            ChunkType::BLOCK_STATUS
        };
        let last = payloads.len().saturating_sub(1);
        for (i, payload) in payloads.iter().enumerate() {
            let mut data = vec![];
            payload.encode(self.mode.extended(), &mut data);
            self.put_chunk(buf, typ, req, i == last, &data);
        }
    }

    fn status_runs(&self, id: u32, off: u64, len: u64) -> core::result::Result<Vec<(u64, u32)>, NbdError> {
        let blocks = self.export.blocks();
        let io_err = |err: io::Error| NbdError::from_io(&err);
        match id {
            BASE_ALLOCATION_ID => Ok(blocks
                .block_status(off, len)
                .map_err(io_err)?
                .into_iter()
                .map(|a| {
                    let mut flags = 0;
                    if !a.allocated {
                        flags |= STATE_HOLE;
                    }
                    if a.zero {
                        flags |= STATE_ZERO;
                    }
                    (a.len, flags)
                })
                .collect()),
            ALLOCATION_DEPTH_ID => blocks.allocation_depth(off, len).map_err(io_err),
            id => {
                let bitmap = self
                    .export
                    .bitmaps()
                    .get((id - FIRST_BITMAP_ID) as usize)
                    .ok_or_else(|| NbdError::invalid(format!("unknown meta context {id}")))?;
                Ok(bitmap
                    .dirty_ranges(off, len)
                    .into_iter()
                    .map(|(len, dirty)| (len, if dirty { STATE_DIRTY } else { 0 }))
                    .collect())
            }
        }
    }

    /// Extents of one context over `[from, from+len)`, coalesced and capped
    /// at `max` entries.
    fn extents(&self, id: u32, from: u64, len: u64, max: usize) -> core::result::Result<Vec<Extent>, NbdError> {
        let end = from + len;
        let mut extents: Vec<Extent> = vec![];
        let mut off = from;
        while off < end {
            let start = off;
            for (len, flags) in self.status_runs(id, off, end - off)? {
                let len = len.min(end - off);
                if len == 0 {
                    break;
                }
                let merged = match extents.last_mut() {
                    Some(last) if last.flags == flags => {
                        last.length += len;
                        true
                    }
                    _ => false,
                };
                if !merged {
                    if extents.len() == max {
                        return Ok(extents);
                    }
                    extents.push(Extent { length: len, flags });
                }
                off += len;
                if off >= end {
                    break;
                }
            }
            if off == start {
                return Err(NbdError::new(
                    ErrorKind::Io,
                    format!("no status for context {id} at offset {off}"),
                ));
            }
        }
        Ok(extents)
    }

    /// Write a complete reply under the send lock.
    pub fn send(&self, reply: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(reply)?;
        writer.flush()
    }

    pub fn structured(&self) -> bool {
        self.mode.structured()
    }
}

/// Read and run requests until the client disconnects or the connection
/// fails. With structured replies every request runs on its own thread, up
/// to the connection's in-flight limit; otherwise requests run one at a time.
pub(crate) fn serve<R: Read>(session: Arc<Session>, mut reader: R, control: &ConnRef) -> Result<()> {
    let conn = control.conn();
    loop {
        if !conn.wait_capacity() {
            return Ok(());
        }
        let incoming = match session.receive(&mut reader)? {
            Received::Disconnect => {
                info!(target: "nbd", "client requested disconnect");
                return Ok(());
            }
            Received::Request(incoming) => incoming,
        };
        if !conn.begin_request() {
            debug!(target: "nbd", "dropping request {:?} on closing connection", incoming.req);
            return Ok(());
        }
        if session.structured() {
            let session = session.clone();
            let guard = control.clone();
            thread::spawn(move || {
                let reply = session.execute(incoming);
                if let Err(err) = session.send(&reply) {
                    warn!(target: "nbd", "sending reply failed: {err}");
                    guard.conn().close();
                }
                guard.conn().end_request();
            });
        } else {
            let reply = session.execute(incoming);
            let sent = session.send(&reply);
            conn.end_request();
            sent.wrap_err("sending reply")?;
        }
    }
}
