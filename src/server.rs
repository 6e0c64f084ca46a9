//! Network Block Device server, exporting the contents of an
//! [`ExportRegistry`].
//!
//! Negotiation runs on the connection's own thread: fixed newstyle with
//! `NBD_OPT_INFO`/`NBD_OPT_GO`, export listing, structured replies, extended
//! headers, meta contexts and optional TLS. Non-fixed newstyle clients are
//! limited to `NBD_OPT_EXPORT_NAME`.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.

#![deny(missing_docs)]
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, prelude::*};
use std::mem;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::{debug, error, info, warn};

use crate::channel::{Channel, HandshakeTimer, TlsCreds};
use crate::conn::ConnShared;
use crate::dispatch::{self, Session};
use crate::errors::{ErrorKind, NbdError};
use crate::export::{Export, ExportRegistry};
use crate::proto::*;

/// Longest export name echoed back in error messages.
const SANITIZED_NAME_LEN: usize = 80;

/// Server-wide settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Limit on the whole negotiation phase; `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Requests a single connection may have executing at once.
    pub max_in_flight: usize,
    /// Credentials for `NBD_OPT_STARTTLS`; when set, TLS is mandatory.
    pub tls: Option<Arc<dyn TlsCreds>>,
    /// How long replies still in flight after a disconnect may take to
    /// reach the client before the transport is shut down under them.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(10)),
            max_in_flight: 16,
            tls: None,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Set the negotiation timeout.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-connection in-flight limit.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set the grace period for pending replies after a disconnect.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Require TLS, using these credentials.
    pub fn with_tls(mut self, tls: Arc<dyn TlsCreds>) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("tls", &self.tls.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Contexts selected with `NBD_OPT_SET_META_CONTEXT`, and the export they
/// were selected for.
struct MetaContexts {
    export: Arc<Export>,
    ids: Vec<u32>,
}

/// Option-phase state of one connection.
struct Negotiation {
    channel: Channel,
    fixed: bool,
    no_zeroes: bool,
    mode: Mode,
    tls_active: bool,
    contexts: Option<MetaContexts>,
    check_align: u32,
}

/// Result of a successful negotiation.
struct Negotiated {
    channel: Channel,
    export: Arc<Export>,
    mode: Mode,
    contexts: Vec<u32>,
    check_align: u32,
}

fn sanitize(name: &str) -> String {
    if name.chars().count() <= SANITIZED_NAME_LEN {
        return name.to_string();
    }
    let mut s: String = name.chars().take(SANITIZED_NAME_LEN).collect();
    s.push_str("...");
    s
}

/// Flags advertised for `export` on a connection in `mode`.
fn transmit_flags(export: &Export, mode: Mode) -> TransmitFlags {
    let mut flags = export.flags();
    if mode.structured() {
        flags |= TransmitFlags::SEND_DF;
    }
    if mode.extended() {
        flags |= TransmitFlags::BLOCK_STAT_PAYLOAD;
    }
    flags
}

/// Canonical name of a context ID on `export`.
fn context_name(export: &Export, id: u32) -> String {
    match id {
        BASE_ALLOCATION_ID => CONTEXT_BASE_ALLOCATION.to_string(),
        ALLOCATION_DEPTH_ID => CONTEXT_ALLOCATION_DEPTH.to_string(),
        id => {
            let bitmap = &export.bitmaps()[(id - FIRST_BITMAP_ID) as usize];
            format!("{CONTEXT_DIRTY_BITMAP_PREFIX}{}", bitmap.name())
        }
    }
}

/// Context IDs on `export` matched by one query.
fn match_query(export: &Export, query: &str, list: bool, ids: &mut BTreeSet<u32>) {
    let bitmap_ids = (0..export.bitmaps().len() as u32).map(|i| FIRST_BITMAP_ID + i);
    if let Some(rest) = query.strip_prefix("base:") {
        if rest == "allocation" || (list && rest.is_empty()) {
            ids.insert(BASE_ALLOCATION_ID);
        }
    } else if let Some(rest) = query.strip_prefix("qemu:") {
        if list && rest.is_empty() {
            if export.allocation_depth() {
                ids.insert(ALLOCATION_DEPTH_ID);
            }
            ids.extend(bitmap_ids);
        } else if rest == "allocation-depth" {
            if export.allocation_depth() {
                ids.insert(ALLOCATION_DEPTH_ID);
            }
        } else if let Some(name) = rest.strip_prefix("dirty-bitmap:") {
            if list && name.is_empty() {
                ids.extend(bitmap_ids);
            } else if let Some(i) = export.bitmaps().iter().position(|b| b.name() == name) {
                ids.insert(FIRST_BITMAP_ID + i as u32);
            }
        }
    }
    // anything else is silently not matched
}

#[derive(Debug)]
struct ServerInner {
    registry: Arc<ExportRegistry>,
    config: ServerConfig,
}

impl ServerInner {
    // Agree on basic negotiation flags.
    fn initial_handshake(stream: &mut Channel) -> Result<(bool, bool)> {
        let mut buf = Vec::with_capacity(18);
        buf.write_u64::<BE>(INIT_MAGIC)?;
        buf.write_u64::<BE>(OPTS_MAGIC)?;
        buf.write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
        stream.write_all(&buf)?;
        stream.flush()?;
        let client_flags = stream.read_u32::<BE>()?;
        let client_flags = ClientHandshakeFlags::from_bits(client_flags).ok_or_else(|| {
            NbdError::protocol(format!("unexpected client flags {client_flags:#x}"))
        })?;
        let fixed = client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE);
        if !fixed {
            debug!("client does not support fixed newstyle negotiation");
        }
        Ok((fixed, client_flags.contains(ClientHandshakeFlags::C_NO_ZEROES)))
    }

    fn send_export_list(&self, neg: &mut Negotiation, opt: &Opt) -> Result<()> {
        if !opt.data.is_empty() {
            OptReply::err(opt.opt, ReplyType::ERR_INVALID, "no payload expected")
                .put(&mut neg.channel)?;
            return Ok(());
        }
        for export in self.registry.list() {
            // S: 32 bits, length of name, followed by the name and an
            // optional description
            let mut buf = vec![];
            put_string(&mut buf, export.name());
            if let Some(desc) = export.description() {
                buf.extend_from_slice(desc.as_bytes());
            }
            OptReply::new(opt.opt, ReplyType::SERVER, buf).put(&mut neg.channel)?;
        }
        OptReply::ack(opt.opt).put(&mut neg.channel)?;
        Ok(())
    }

    /// Send export info at the end of newstyle negotiation, when client sends
    /// NBD_OPT_EXPORT_NAME. There is no way to report errors here; a failed
    /// lookup drops the connection.
    fn export_name(&self, neg: &mut Negotiation, opt: Opt) -> Result<Arc<Export>> {
        // The mode is not lowered here: a client that negotiated structured
        // replies keeps them after EXPORT_NAME, and only one that asked for
        // nothing more ends up in ExportName mode. Extended headers cannot be
        // honored without GO.
        if neg.mode.extended() {
            bail!(NbdError::protocol(
                "extended headers already negotiated, use NBD_OPT_GO"
            ));
        }
        if opt.data.len() > MAX_STRING_SIZE {
            bail!(NbdError::invalid(format!(
                "export name of {} bytes is too long",
                opt.data.len()
            )));
        }
        let name = String::from_utf8(opt.data)
            .map_err(|_| NbdError::protocol("non-UTF8 export name"))?;
        let export = self.registry.lookup(&name).ok_or_else(|| {
            NbdError::new(
                ErrorKind::NotFound,
                format!("export '{}' not present", sanitize(&name)),
            )
        })?;

        // S: 64 bits, size of the export in bytes (unsigned)
        // S: 16 bits, transmission flags
        // S: 124 bytes, zeroes (reserved) (unless `NBD_FLAG_C_NO_ZEROES` was negotiated by the client)
        let mut buf = Vec::with_capacity(10 + RESERVED_ZEROES);
        buf.write_u64::<BE>(export.size())?;
        buf.write_u16::<BE>(transmit_flags(&export, neg.mode).bits())?;
        if !neg.no_zeroes {
            buf.extend_from_slice(&[0u8; RESERVED_ZEROES]);
        }
        neg.channel.write_all(&buf)?;
        neg.channel.flush()?;
        Ok(export)
    }

    /// Handle NBD_OPT_INFO and NBD_OPT_GO. Returns the export when GO
    /// succeeded and transmission should start.
    fn info_responses(&self, neg: &mut Negotiation, opt: &Opt) -> Result<Option<Arc<Export>>> {
        let go = opt.typ() == Some(OptType::GO);
        let info_req = match InfoRequest::get(&opt.data) {
            Ok(req) => req,
            Err(err) => {
                OptReply::err(opt.opt, ReplyType::ERR_INVALID, err.message()).put(&mut neg.channel)?;
                return Ok(None);
            }
        };
        for &typ in &info_req.typs {
            debug!("client requested info {} ({typ})", info_name(typ));
        }
        let export = match self.registry.lookup(&info_req.name) {
            Some(export) => export,
            None => {
                OptReply::err(
                    opt.opt,
                    ReplyType::ERR_UNKNOWN,
                    format!("export '{}' not present", sanitize(&info_req.name)),
                )
                .put(&mut neg.channel)?;
                return Ok(None);
            }
        };

        let blocksize = info_req.wants(InfoType::BLOCK_SIZE);
        let mut replies = vec![];
        if info_req.wants(InfoType::NAME) {
            replies.push(Info::Name(export.name().to_string()));
        }
        if let Some(desc) = export.description() {
            replies.push(Info::Description(desc.to_string()));
        }

        let alignment = export.blocks().request_alignment();
        // Clients that did not ask for block sizes cannot be assumed to honor
        // them, except with GO where the export is used right away.
        let min = if blocksize || go { alignment } else { 1 };
        let preferred = min.max(4096);
        let max = export.blocks().max_transfer().min(MAX_BUFFER_SIZE).max(preferred);
        replies.push(Info::BlockSize {
            min,
            preferred,
            max,
        });
        replies.push(Info::Export {
            size: export.size(),
            flags: transmit_flags(&export, neg.mode),
        });

        for info in replies {
            OptReply::new(opt.opt, ReplyType::INFO, info.encode()).put(&mut neg.channel)?;
        }

        if !go && !blocksize && alignment > 1 {
            OptReply::err(
                opt.opt,
                ReplyType::ERR_BLOCK_SIZE_REQD,
                "request NBD_INFO_BLOCK_SIZE to use this export",
            )
            .put(&mut neg.channel)?;
            return Ok(None);
        }
        OptReply::ack(opt.opt).put(&mut neg.channel)?;
        if !go {
            return Ok(None);
        }
        if blocksize {
            neg.check_align = min;
        }
        Ok(Some(export))
    }

    fn starttls(&self, neg: &mut Negotiation, opt: &Opt) -> Result<()> {
        if !opt.data.is_empty() {
            OptReply::err(opt.opt, ReplyType::ERR_INVALID, "no payload expected")
                .put(&mut neg.channel)?;
            return Ok(());
        }
        if neg.tls_active {
            OptReply::err(opt.opt, ReplyType::ERR_INVALID, "TLS already enabled")
                .put(&mut neg.channel)?;
            return Ok(());
        }
        let creds = match &self.config.tls {
            Some(creds) => creds.clone(),
            None => {
                OptReply::err(opt.opt, ReplyType::ERR_POLICY, "TLS not configured")
                    .put(&mut neg.channel)?;
                return Ok(());
            }
        };
        OptReply::ack(opt.opt).put(&mut neg.channel)?;
        debug!("starting TLS handshake");
        let plain = mem::replace(&mut neg.channel, Channel::new(io::empty(), io::sink()));
        neg.channel = creds
            .server_handshake(plain)
            .wrap_err("TLS handshake failed")?;
        neg.tls_active = true;
        Ok(())
    }

    fn structured_reply(neg: &mut Negotiation, opt: &Opt) -> Result<()> {
        let reply = if !opt.data.is_empty() {
            OptReply::err(opt.opt, ReplyType::ERR_INVALID, "no payload expected")
        } else if neg.mode.extended() {
            OptReply::err(
                opt.opt,
                ReplyType::ERR_EXT_HEADER_REQD,
                "extended headers already negotiated",
            )
        } else if neg.mode.structured() {
            OptReply::err(
                opt.opt,
                ReplyType::ERR_INVALID,
                "structured reply already negotiated",
            )
        } else {
            neg.mode = Mode::Structured;
            OptReply::ack(opt.opt)
        };
        reply.put(&mut neg.channel)?;
        Ok(())
    }

    fn extended_headers(neg: &mut Negotiation, opt: &Opt) -> Result<()> {
        let reply = if !opt.data.is_empty() {
            OptReply::err(opt.opt, ReplyType::ERR_INVALID, "no payload expected")
        } else if neg.mode.extended() {
            OptReply::err(
                opt.opt,
                ReplyType::ERR_INVALID,
                "extended headers already negotiated",
            )
        } else {
            neg.mode = Mode::Extended;
            OptReply::ack(opt.opt)
        };
        reply.put(&mut neg.channel)?;
        Ok(())
    }

    fn meta_context(&self, neg: &mut Negotiation, opt: &Opt) -> Result<()> {
        let set = opt.typ() == Some(OptType::SET_META_CONTEXT);
        let req = match MetaContextRequest::get(&opt.data) {
            Ok(req) => req,
            Err(err) => {
                OptReply::err(opt.opt, ReplyType::ERR_INVALID, err.message()).put(&mut neg.channel)?;
                return Ok(());
            }
        };
        if set && !neg.mode.structured() {
            OptReply::err(
                opt.opt,
                ReplyType::ERR_INVALID,
                "request structured replies before setting meta contexts",
            )
            .put(&mut neg.channel)?;
            return Ok(());
        }
        let export = match self.registry.lookup(&req.export) {
            Some(export) => export,
            None => {
                OptReply::err(
                    opt.opt,
                    ReplyType::ERR_UNKNOWN,
                    format!("export '{}' not present", sanitize(&req.export)),
                )
                .put(&mut neg.channel)?;
                return Ok(());
            }
        };

        let mut ids = BTreeSet::new();
        if req.queries.is_empty() && !set {
            match_query(&export, "base:", true, &mut ids);
            match_query(&export, "qemu:", true, &mut ids);
        }
        for query in &req.queries {
            debug!("meta context query '{query}'");
            match_query(&export, query, !set, &mut ids);
        }
        for &id in &ids {
            let ctx = MetaContext {
                id,
                name: context_name(&export, id),
            };
            debug!("matched meta context {} ({})", ctx.name, ctx.id);
            OptReply::new(opt.opt, ReplyType::META_CONTEXT, ctx.encode()).put(&mut neg.channel)?;
        }
        OptReply::ack(opt.opt).put(&mut neg.channel)?;
        if set {
            neg.contexts = Some(MetaContexts {
                export,
                ids: ids.into_iter().collect(),
            });
        }
        Ok(())
    }

    /// After the initial handshake, "haggle" to agree on connection parameters.
    ///
    /// If this returns Ok(None), then the client wants to disconnect
    fn handshake_haggle(&self, neg: &mut Negotiation) -> Result<Option<Arc<Export>>> {
        loop {
            let opt = Opt::get(&mut neg.channel)?;
            debug!(
                "received option {} ({}) of length {}",
                opt_name(opt.opt),
                opt.opt,
                opt.data.len()
            );
            let typ = opt.typ();

            if !neg.fixed && typ != Some(OptType::EXPORT_NAME) {
                bail!(NbdError::protocol(format!(
                    "option {} ({}) requires fixed newstyle negotiation",
                    opt_name(opt.opt),
                    opt.opt
                )));
            }

            if self.config.tls.is_some() && !neg.tls_active {
                match typ {
                    Some(OptType::STARTTLS) => self.starttls(neg, &opt)?,
                    Some(OptType::EXPORT_NAME) => bail!(NbdError::new(
                        ErrorKind::PermissionDenied,
                        "export name option received before TLS"
                    )),
                    Some(OptType::ABORT) => {
                        let _ = OptReply::ack(opt.opt).put(&mut neg.channel);
                        return Ok(None);
                    }
                    _ => OptReply::err(
                        opt.opt,
                        ReplyType::ERR_TLS_REQD,
                        format!("option {} not permitted before TLS", opt_name(opt.opt)),
                    )
                    .put(&mut neg.channel)?,
                }
                continue;
            }

            match typ {
                Some(OptType::LIST) => self.send_export_list(neg, &opt)?,
                Some(OptType::ABORT) => {
                    // the client may already have closed its end
                    if let Err(err) = OptReply::ack(opt.opt).put(&mut neg.channel) {
                        debug!("acknowledging abort: {err}");
                    }
                    return Ok(None);
                }
                Some(OptType::EXPORT_NAME) => return self.export_name(neg, opt).map(Some),
                // the only difference between INFO and GO is that on success,
                // GO starts the transmission phase
                Some(OptType::INFO) | Some(OptType::GO) => {
                    if let Some(export) = self.info_responses(neg, &opt)? {
                        return Ok(Some(export));
                    }
                }
                Some(OptType::STARTTLS) => self.starttls(neg, &opt)?,
                Some(OptType::STRUCTURED_REPLY) => Self::structured_reply(neg, &opt)?,
                Some(OptType::EXTENDED_HEADERS) => Self::extended_headers(neg, &opt)?,
                Some(OptType::LIST_META_CONTEXT) | Some(OptType::SET_META_CONTEXT) => {
                    self.meta_context(neg, &opt)?
                }
                Some(OptType::PEEK_EXPORT) | None => {
                    warn!("got unsupported option {} ({})", opt_name(opt.opt), opt.opt);
                    OptReply::err(
                        opt.opt,
                        ReplyType::ERR_UNSUP,
                        format!("unsupported option {} ({})", opt.opt, opt_name(opt.opt)),
                    )
                    .put(&mut neg.channel)?;
                }
            }
        }
    }

    fn negotiate(&self, mut channel: Channel) -> Result<Option<Negotiated>> {
        let (fixed, no_zeroes) =
            Self::initial_handshake(&mut channel).wrap_err("initial handshake failed")?;
        let mut neg = Negotiation {
            channel,
            fixed,
            no_zeroes,
            mode: if fixed { Mode::Simple } else { Mode::ExportName },
            tls_active: false,
            contexts: None,
            check_align: 0,
        };
        let export = match self.handshake_haggle(&mut neg)? {
            Some(export) => export,
            None => return Ok(None),
        };
        let contexts = match neg.contexts {
            Some(ctx) if Arc::ptr_eq(&ctx.export, &export) => ctx.ids,
            Some(_) => {
                debug!("meta contexts were negotiated for another export, resetting");
                vec![]
            }
            None => vec![],
        };
        Ok(Some(Negotiated {
            channel: neg.channel,
            export,
            mode: neg.mode,
            contexts,
            check_align: neg.check_align,
        }))
    }

    fn transmit(&self, negotiated: Negotiated) -> Result<()> {
        let Negotiated {
            channel,
            export,
            mode,
            contexts,
            check_align,
        } = negotiated;
        let (reader, writer, closer) = channel.into_split();
        let (conn, events) = ConnShared::new(closer, self.config.max_in_flight);
        let control = conn.acquire();
        export.attach(conn.clone());
        info!(
            "connection {} using export '{}' in {mode:?} mode",
            conn.id(),
            export.name()
        );

        let session = Arc::new(Session::new(export.clone(), mode, contexts, check_align, writer));
        let r = dispatch::serve(session, reader, &control);

        let closed_by_server = conn.is_closing();
        conn.mark_closing();
        drop(control);
        if r.is_err() {
            // workers may be stuck writing to a broken peer
            conn.closer().shutdown();
            let _ = events.recv();
        } else if let Err(RecvTimeoutError::Timeout) = events.recv_timeout(self.config.drain_timeout) {
            warn!(
                "connection {}: replies still pending after {:?}, closing transport",
                conn.id(),
                self.config.drain_timeout
            );
            conn.closer().shutdown();
            let _ = events.recv();
        }
        export.detach(conn.id());
        conn.closer().shutdown();

        match r {
            Err(_) if closed_by_server => {
                info!("connection {} closed by server", conn.id());
                Ok(())
            }
            r => r.wrap_err("handling client operations"),
        }
    }

    /// Handle a single client, and return on disconnect.
    fn handle_client(&self, channel: Channel) -> Result<()> {
        let timer = self
            .config
            .handshake_timeout
            .map(|timeout| HandshakeTimer::start(channel.shutdown_handle(), timeout));
        let r = self.negotiate(channel);
        let timed_out = timer.map(|timer| !timer.cancel()).unwrap_or(false);
        let negotiated = match r {
            _ if timed_out => bail!(NbdError::protocol("handshake timed out")),
            Err(err) => return Err(err.wrap_err("option negotiation failed")),
            Ok(None) => {
                info!("client aborted negotiation");
                return Ok(());
            }
            Ok(Some(negotiated)) => negotiated,
        };
        info!("handshake finished in {:?} mode", negotiated.mode);

        let r = self.transmit(negotiated);
        if let Err(err) = r {
            // if the error is due to UnexpectedEof, then the client closed
            // the connection, which the server should allow gracefully
            if let Some(err) = err.root_cause().downcast_ref::<io::Error>() {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    return Ok(());
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Server implements the NBD protocol for every export in a registry.
#[derive(Debug, Clone)]
pub struct Server(Arc<ServerInner>);

impl Server {
    /// Create a Server that serves the exports in `registry`.
    pub fn new(registry: Arc<ExportRegistry>, config: ServerConfig) -> Self {
        Self(Arc::new(ServerInner { registry, config }))
    }

    /// The registry exports are looked up in.
    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.0.registry
    }

    /// Handshake and communicate with a client on a single connection.
    ///
    /// Returns Ok(()) when client gracefully disconnects.
    pub fn handle_client(&self, channel: Channel) -> Result<()> {
        self.0.handle_client(channel)
    }

    /// Accept connections from `listener`, each on its own thread.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        for stream in listener.incoming() {
            let stream = stream?;
            let peer = stream.peer_addr().ok();
            let channel = match Channel::tcp(stream) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!("setting up connection from {peer:?}: {err}");
                    continue;
                }
            };
            info!("client connected from {peer:?}");
            let server = self.0.clone();
            thread::spawn(move || match server.handle_client(channel) {
                Ok(_) => info!("client {peer:?} disconnected"),
                Err(err) => error!("error handling client {peer:?}:\n{:?}", err),
            });
        }
        Ok(())
    }

    /// Start accepting connections from clients and processing commands.
    pub fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr).wrap_err("binding listener")?;
        let local = listener.local_addr()?;
        info!("listening on {local}");
        self.serve(listener)
    }
}
