//! Network Block Device protocol engine: server-side negotiation and request
//! dispatch over a registry of exports, and a client for the same protocol.
pub mod channel;
pub mod client;
mod conn;
mod dispatch;
pub mod errors;
pub mod export;
pub mod proto;
pub mod server;

pub use channel::{Channel, TlsCreds};
pub use client::{list_exports, Client, ClientOptions, ExportInfo, ExportListing, Stage};
pub use errors::{error_kind, ErrorKind, NbdError};
pub use export::{Blocks, Export, ExportConfig, ExportRegistry, MemBitmap, MemBlocks, RemoveMode};
pub use server::{Server, ServerConfig};

#[cfg(test)]
mod tests {
    use std::io::{self, prelude::*};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use byteorder::{ReadBytesExt, WriteBytesExt, BE};
    use color_eyre::Result;

    use super::*;
    use crate::errors::WireError;
    use crate::proto::*;

    const MIB: u64 = 1024 * 1024;

    fn pipe_pair() -> (Channel, Channel) {
        let (r1, w1) = pipe::pipe();
        let (r2, w2) = pipe::pipe();
        (Channel::new(r1, w2), Channel::new(r2, w1))
    }

    /// Serve one connection over a pipe; returns the client's end.
    fn start(registry: Arc<ExportRegistry>, config: ServerConfig) -> (Channel, JoinHandle<Result<()>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (server_side, client_side) = pipe_pair();
        let server = Server::new(registry, config);
        let handle = thread::spawn(move || server.handle_client(server_side));
        (client_side, handle)
    }

    fn registry_with(name: &str, blocks: MemBlocks, config: ExportConfig) -> Arc<ExportRegistry> {
        let registry = Arc::new(ExportRegistry::new());
        registry
            .create(
                ExportConfig {
                    name: name.to_string(),
                    ..config
                },
                Arc::new(blocks),
            )
            .unwrap();
        registry
    }

    #[test]
    fn run_client_server_handshake() -> Result<()> {
        let registry = registry_with(
            "default",
            MemBlocks::new(vec![1u8; 1024 * 10]),
            ExportConfig::default(),
        );
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions::new("default").with_max_mode(Mode::Simple);
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.mode(), Mode::Simple);
        assert_eq!(client.size(), 1024 * 10);

        let buf = client.read(3, 5)?;
        assert_eq!(buf, [1u8; 5]);
        client.write(4, &[9u8; 7])?;
        client.flush()?;
        let buf = client.read(2, 4)?;
        assert_eq!(buf, [1, 1, 9, 9]);

        client.disconnect()?;

        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn extended_sparse_read_and_block_status() -> Result<()> {
        let registry = registry_with("sparse", MemBlocks::sparse(MIB), ExportConfig::default());
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions::new("sparse").with_block_status();
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.mode(), Mode::Extended);
        assert_eq!(client.info().context_id, Some(BASE_ALLOCATION_ID));
        assert!(client.info().flags.contains(TransmitFlags::BLOCK_STAT_PAYLOAD));

        client.write(8192, &[7u8; 4096])?;
        let buf = client.read(4096, 8192)?;
        assert_eq!(&buf[..4096], &[0u8; 4096][..]);
        assert_eq!(&buf[4096..], &[7u8; 4096][..]);

        let extents = client.block_status(0, client.size(), CmdFlags::empty())?;
        assert_eq!(
            extents,
            vec![
                Extent {
                    length: 8192,
                    flags: STATE_HOLE | STATE_ZERO
                },
                Extent {
                    length: 4096,
                    flags: 0
                },
                Extent {
                    length: MIB - 12288,
                    flags: STATE_HOLE | STATE_ZERO
                },
            ]
        );
        let extents = client.block_status(0, client.size(), CmdFlags::REQ_ONE)?;
        assert_eq!(extents.len(), 1);

        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn zeroes_and_trim_update_allocation() -> Result<()> {
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions::new("disk")
            .with_max_mode(Mode::Structured)
            .with_block_status();
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.mode(), Mode::Structured);

        client.write(0, &[5u8; 8192])?;
        client.write_zeroes(0, 4096, CmdFlags::NO_HOLE)?;
        client.trim(4096, 4096)?;
        let extents = client.block_status(0, MIB, CmdFlags::empty())?;
        assert_eq!(
            extents,
            vec![
                Extent {
                    length: 4096,
                    flags: STATE_ZERO
                },
                Extent {
                    length: MIB - 4096,
                    flags: STATE_HOLE | STATE_ZERO
                },
            ]
        );
        // a DF read comes back as one data chunk
        let buf = client.read_with_flags(0, 8192, CmdFlags::DF)?;
        assert_eq!(buf, vec![0u8; 8192]);
        client.cache(0, 4096)?;

        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn allocation_depth_context() -> Result<()> {
        let registry = registry_with(
            "depth",
            MemBlocks::sparse(64 * 1024),
            ExportConfig {
                allocation_depth: true,
                ..Default::default()
            },
        );
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions::new("depth").with_meta_context(CONTEXT_ALLOCATION_DEPTH);
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.info().context_id, Some(ALLOCATION_DEPTH_ID));
        client.write(0, &[1u8; 512])?;
        let extents = client.block_status(0, 64 * 1024, CmdFlags::empty())?;
        assert_eq!(
            extents,
            vec![
                Extent {
                    length: 512,
                    flags: 1
                },
                Extent {
                    length: 64 * 1024 - 512,
                    flags: 0
                },
            ]
        );
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn unknown_meta_context_leaves_block_status_unavailable() -> Result<()> {
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions::new("disk").with_meta_context(CONTEXT_ALLOCATION_DEPTH);
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.info().context_id, None);
        let err = client.block_status(0, 4096, CmdFlags::empty()).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Unsupported));
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn read_only_export_refuses_writes() -> Result<()> {
        let registry = registry_with(
            "ro",
            MemBlocks::new(vec![3u8; 4096]),
            ExportConfig {
                read_only: true,
                ..Default::default()
            },
        );
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let mut client = Client::new(channel, &ClientOptions::new("ro"))?;
        assert!(client.info().flags.contains(TransmitFlags::READ_ONLY));

        let err = client.write(0, &[0u8; 512]).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::PermissionDenied));
        assert_eq!(err.downcast_ref::<Stage>(), Some(&Stage::Transmission));
        let err = client.trim(0, 512).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::PermissionDenied));
        // the connection is still usable
        assert_eq!(client.read(0, 4)?, vec![3u8; 4]);

        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn out_of_range_requests_fail_without_closing() -> Result<()> {
        let registry = registry_with("disk", MemBlocks::new(vec![0u8; 4096]), ExportConfig::default());
        for mode in [Mode::Simple, Mode::Structured, Mode::Extended] {
            let (channel, s_handle) = start(registry.clone(), ServerConfig::default());
            let opts = ClientOptions::new("disk").with_max_mode(mode);
            let mut client = Client::new(channel, &opts)?;

            let err = client.read(4000, 512).unwrap_err();
            assert_eq!(error_kind(&err), Some(ErrorKind::InvalidArgument));
            let err = client.write(4096, &[1u8; 16]).unwrap_err();
            assert_eq!(error_kind(&err), Some(ErrorKind::NoSpace));
            let err = client.write_zeroes(0, 8192, CmdFlags::empty()).unwrap_err();
            assert_eq!(error_kind(&err), Some(ErrorKind::NoSpace));

            client.write(0, &[2u8; 16])?;
            assert_eq!(client.read(0, 16)?, vec![2u8; 16]);
            // flushing twice is harmless
            client.flush()?;
            client.flush()?;

            client.disconnect()?;
            s_handle.join().unwrap()?;
        }
        Ok(())
    }

    #[test]
    fn missing_export_fails_go() -> Result<()> {
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let err = Client::new(channel, &ClientOptions::new("nope")).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
        assert_eq!(err.downcast_ref::<Stage>(), Some(&Stage::Go));
        // the client aborted, so the server finishes cleanly
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn go_reports_block_sizes() -> Result<()> {
        let registry = registry_with(
            "aligned",
            MemBlocks::new(vec![0u8; 64 * 1024]).with_alignment(4096),
            ExportConfig {
                description: Some("scratch disk".to_string()),
                ..Default::default()
            },
        );
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let client = Client::new(channel, &ClientOptions::new("aligned"))?;
        let info = client.info();
        assert_eq!(info.min_block, 4096);
        assert_eq!(info.preferred_block, 4096);
        assert_eq!(info.max_block, MAX_BUFFER_SIZE);
        assert_eq!(info.description.as_deref(), Some("scratch disk"));
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn listing_exports() -> Result<()> {
        let registry = Arc::new(ExportRegistry::new());
        registry.create(
            ExportConfig {
                name: "a".to_string(),
                description: Some("first".to_string()),
                allocation_depth: true,
                ..Default::default()
            },
            Arc::new(MemBlocks::sparse(MIB)),
        )?;
        registry.create(ExportConfig::new("b"), Arc::new(MemBlocks::sparse(2 * MIB)))?;

        let (channel, s_handle) = start(registry, ServerConfig::default());
        let listings = list_exports(channel, &ClientOptions::default())?;
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].name, "a");
        assert_eq!(listings[0].description.as_deref(), Some("first"));
        assert_eq!(listings[0].info.as_ref().map(|i| i.size), Some(MIB));
        assert_eq!(
            listings[0].contexts,
            vec![
                CONTEXT_BASE_ALLOCATION.to_string(),
                CONTEXT_ALLOCATION_DEPTH.to_string()
            ]
        );
        assert_eq!(listings[1].name, "b");
        assert_eq!(listings[1].description, None);
        assert_eq!(listings[1].info.as_ref().map(|i| i.size), Some(2 * MIB));
        assert_eq!(listings[1].contexts, vec![CONTEXT_BASE_ALLOCATION.to_string()]);
        s_handle.join().unwrap()?;
        Ok(())
    }

    /// "TLS" that leaves the stream as is, counting handshakes.
    #[derive(Default)]
    struct Passthrough(AtomicUsize);

    impl TlsCreds for Passthrough {
        fn server_handshake(&self, channel: Channel) -> io::Result<Channel> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(channel)
        }

        fn client_handshake(&self, channel: Channel, _hostname: &str) -> io::Result<Channel> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(channel)
        }
    }

    #[test]
    fn tls_is_required_when_configured() -> Result<()> {
        let registry = registry_with("secure", MemBlocks::sparse(MIB), ExportConfig::default());
        let server_creds = Arc::new(Passthrough::default());
        let config = ServerConfig::default().with_tls(server_creds.clone());

        let (channel, s_handle) = start(registry.clone(), config.clone());
        let err = Client::new(channel, &ClientOptions::new("secure")).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::PermissionDenied));
        s_handle.join().unwrap()?;
        assert_eq!(server_creds.0.load(Ordering::SeqCst), 0);

        let client_creds = Arc::new(Passthrough::default());
        let (channel, s_handle) = start(registry, config);
        let opts = ClientOptions::new("secure").with_tls(client_creds.clone(), "localhost");
        let mut client = Client::new(channel, &opts)?;
        client.write(0, b"secret")?;
        assert_eq!(client.read(0, 6)?, b"secret".to_vec());
        client.disconnect()?;
        s_handle.join().unwrap()?;
        assert_eq!(server_creds.0.load(Ordering::SeqCst), 1);
        assert_eq!(client_creds.0.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn oldstyle_server() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut server_side, channel) = pipe_pair();
        let s_handle = thread::spawn(move || -> Result<()> {
            let s = &mut server_side;
            s.write_u64::<BE>(INIT_MAGIC)?;
            s.write_u64::<BE>(CLIENT_MAGIC)?;
            s.write_u64::<BE>(4096)?;
            s.write_u32::<BE>((TransmitFlags::HAS_FLAGS | TransmitFlags::READ_ONLY).bits() as u32)?;
            s.write_all(&[0u8; RESERVED_ZEROES])?;
            s.flush()?;

            let req = Request::get(&mut *s, false)?;
            assert_eq!(req.cmd(), Some(Cmd::READ));
            let data = vec![0xab; req.len as usize];
            let mut buf = vec![];
            SimpleReply::data(req.cookie, &data).encode(&mut buf);
            s.write_all(&buf)?;
            s.flush()?;

            let req = Request::get(&mut *s, false)?;
            assert_eq!(req.cmd(), Some(Cmd::DISCONNECT));
            Ok(())
        });

        let mut client = Client::new(channel, &ClientOptions::default())?;
        assert_eq!(client.mode(), Mode::OldStyle);
        assert_eq!(client.size(), 4096);
        assert!(client.info().flags.contains(TransmitFlags::READ_ONLY));
        assert_eq!(client.read(0, 3)?, vec![0xab; 3]);
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn oldstyle_server_cannot_do_tls() -> Result<()> {
        let (mut server_side, channel) = pipe_pair();
        let s_handle = thread::spawn(move || -> Result<()> {
            server_side.write_u64::<BE>(INIT_MAGIC)?;
            server_side.write_u64::<BE>(CLIENT_MAGIC)?;
            Ok(())
        });
        let opts = ClientOptions::default().with_tls(Arc::new(Passthrough::default()), "localhost");
        let err = Client::new(channel, &opts).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::PermissionDenied));
        assert_eq!(err.downcast_ref::<Stage>(), Some(&Stage::Handshake));
        s_handle.join().unwrap()?;
        Ok(())
    }

    /// Newstyle greeting done by hand; returns the server's global flags.
    fn raw_greeting(s: &mut Channel, client_flags: u32) -> Result<HandshakeFlags> {
        assert_eq!(s.read_u64::<BE>()?, INIT_MAGIC);
        assert_eq!(s.read_u64::<BE>()?, OPTS_MAGIC);
        let flags = HandshakeFlags::from_bits_truncate(s.read_u16::<BE>()?);
        s.write_u32::<BE>(client_flags)?;
        s.flush()?;
        Ok(flags)
    }

    fn raw_reply(s: &mut Channel) -> Result<(OptReplyHeader, Vec<u8>)> {
        let hdr = OptReplyHeader::get(&mut *s)?;
        let mut data = vec![0u8; hdr.len as usize];
        s.read_exact(&mut data)?;
        Ok((hdr, data))
    }

    fn fixed_flags() -> u32 {
        (ClientHandshakeFlags::C_FIXED_NEWSTYLE | ClientHandshakeFlags::C_NO_ZEROES).bits()
    }

    #[test]
    fn go_without_info_requests() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let opts = ClientOptions {
            request_sizes: false,
            ..ClientOptions::new("disk0")
        };
        let client = Client::new(channel, &opts)?;
        let flags = client.info().flags;
        assert!(flags.contains(
            TransmitFlags::HAS_FLAGS
                | TransmitFlags::SEND_FLUSH
                | TransmitFlags::SEND_FUA
                | TransmitFlags::SEND_CACHE
        ));
        assert!(!flags.contains(TransmitFlags::READ_ONLY));
        assert_eq!(client.size(), MIB);
        assert!(client.info().min_block <= client.info().preferred_block);
        assert!(client.info().preferred_block <= client.info().max_block);
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn unmatched_meta_context_query_is_skipped() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        let flags = raw_greeting(&mut s, fixed_flags())?;
        assert!(flags.contains(HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES));

        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));

        let req = MetaContextRequest {
            export: "disk0".to_string(),
            queries: vec!["base:nonsense".to_string()],
        };
        Opt::new(OptType::SET_META_CONTEXT, req.encode()).put(&mut s)?;
        let (hdr, data) = raw_reply(&mut s)?;
        assert_eq!(hdr.opt, u32::from(OptType::SET_META_CONTEXT));
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        assert!(data.is_empty());

        Opt::new(OptType::ABORT, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn long_export_name_drops_connection() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::EXPORT_NAME, vec![b'x'; MAX_STRING_SIZE + 88]).put(&mut s)?;
        assert!(s_handle.join().unwrap().is_err());
        // nothing was sent before the connection closed
        let mut buf = [0u8; 1];
        assert_eq!(s.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn non_fixed_newstyle_client() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::new(vec![4u8; 4096]), ExportConfig::default());

        // anything but EXPORT_NAME is fatal without fixed newstyle
        let (mut s, s_handle) = start(registry.clone(), ServerConfig::default());
        raw_greeting(&mut s, 0)?;
        Opt::new(OptType::LIST, vec![]).put(&mut s)?;
        assert!(s_handle.join().unwrap().is_err());

        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, 0)?;
        Opt::new(OptType::EXPORT_NAME, b"disk0".to_vec()).put(&mut s)?;
        assert_eq!(s.read_u64::<BE>()?, 4096);
        let flags = TransmitFlags::from_bits_truncate(s.read_u16::<BE>()?);
        assert!(!flags.contains(TransmitFlags::SEND_DF));
        let mut zeroes = [1u8; RESERVED_ZEROES];
        s.read_exact(&mut zeroes)?;
        assert_eq!(zeroes, [0u8; RESERVED_ZEROES]);

        let req = Request::new(Cmd::READ, 0, 8).with_cookie(77);
        s.write_all(&req.encode(false)?)?;
        s.flush()?;
        match ReplyHeader::get(&mut s, Mode::ExportName)? {
            ReplyHeader::Simple { error, cookie } => {
                assert_eq!(error, 0);
                assert_eq!(cookie, 77);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let mut data = [0u8; 8];
        s.read_exact(&mut data)?;
        assert_eq!(data, [4u8; 8]);

        s.write_all(&Request::new(Cmd::DISCONNECT, 0, 0).encode(false)?)?;
        s.flush()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn export_name_keeps_structured_replies() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::new(vec![4u8; 4096]), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));

        Opt::new(OptType::EXPORT_NAME, b"disk0".to_vec()).put(&mut s)?;
        assert_eq!(s.read_u64::<BE>()?, 4096);
        let flags = TransmitFlags::from_bits_truncate(s.read_u16::<BE>()?);
        assert!(flags.contains(TransmitFlags::SEND_DF));

        let req = Request::new(Cmd::READ, 0, 8)
            .with_flags(CmdFlags::DF)
            .with_cookie(3);
        s.write_all(&req.encode(false)?)?;
        s.flush()?;
        let chunk = match ReplyHeader::get(&mut s, Mode::Structured)? {
            ReplyHeader::Chunk(chunk) => chunk,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(chunk.typ, u16::from(ChunkType::OFFSET_DATA));
        assert!(chunk.done());
        let mut data = vec![0u8; chunk.length as usize];
        s.read_exact(&mut data)?;
        assert_eq!(&data[8..], &[4u8; 8][..]);

        s.write_all(&Request::new(Cmd::DISCONNECT, 0, 0).encode(false)?)?;
        s.flush()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn unknown_client_flags_are_fatal() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags() | 0x8000_0000)?;
        assert!(s_handle.join().unwrap().is_err());
        Ok(())
    }

    #[test]
    fn hard_remove_disconnects_clients() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = Server::new(registry.clone(), ServerConfig::default());
        thread::spawn(move || server.serve(listener));

        let mut client = Client::connect("127.0.0.1", port, &ClientOptions::new("disk"))?;
        // a round trip guarantees the connection is attached to the export
        client.write(0, &[1u8; 512])?;

        let err = registry.remove("disk", RemoveMode::Safe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
        assert!(registry.lookup("disk").is_some());

        registry.remove("disk", RemoveMode::Hard)?;
        assert!(registry.lookup("disk").is_none());
        assert!(client.read(0, 512).is_err());
        Ok(())
    }

    #[test]
    fn slow_handshake_times_out() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let _silent = TcpStream::connect(listener.local_addr()?)?;
        let (stream, _) = listener.accept()?;
        let config = ServerConfig::default().with_handshake_timeout(Some(Duration::from_millis(100)));
        let server = Server::new(registry, config);
        let err = server.handle_client(Channel::tcp(stream)?).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Protocol));
        assert!(err.to_string().contains("timed out"));
        Ok(())
    }

    /// GO by hand, skipping the info replies.
    fn raw_go(s: &mut Channel, name: &str) -> Result<()> {
        let req = InfoRequest {
            name: name.to_string(),
            typs: vec![],
        };
        Opt::new(OptType::GO, req.encode()).put(&mut *s)?;
        loop {
            let (hdr, _) = raw_reply(s)?;
            if hdr.reply_type == u32::from(ReplyType::ACK) {
                return Ok(());
            }
            assert_eq!(hdr.reply_type, u32::from(ReplyType::INFO));
        }
    }

    fn raw_abort(s: &mut Channel) -> Result<()> {
        Opt::new(OptType::ABORT, vec![]).put(&mut *s)?;
        let (hdr, _) = raw_reply(s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        Ok(())
    }

    #[test]
    fn starttls_rejections() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());

        // no credentials configured
        let (mut s, s_handle) = start(registry.clone(), ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::STARTTLS, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_POLICY));
        raw_abort(&mut s)?;
        s_handle.join().unwrap()?;

        let creds = Arc::new(Passthrough::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default().with_tls(creds.clone()));
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::STARTTLS, vec![0]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_INVALID));
        assert_eq!(creds.0.load(Ordering::SeqCst), 0);

        Opt::new(OptType::STARTTLS, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        assert_eq!(creds.0.load(Ordering::SeqCst), 1);

        // a second upgrade is refused
        Opt::new(OptType::STARTTLS, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_INVALID));
        assert_eq!(creds.0.load(Ordering::SeqCst), 1);
        raw_abort(&mut s)?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn info_requires_block_sizes_for_aligned_exports() -> Result<()> {
        let registry = registry_with(
            "aligned",
            MemBlocks::new(vec![0u8; 64 * 1024]).with_alignment(4096),
            ExportConfig::default(),
        );
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;

        let mut replies = vec![];
        let req = InfoRequest {
            name: "aligned".to_string(),
            typs: vec![],
        };
        Opt::new(OptType::INFO, req.encode()).put(&mut s)?;
        loop {
            let (hdr, _) = raw_reply(&mut s)?;
            replies.push(hdr.reply_type);
            if hdr.reply_type != u32::from(ReplyType::INFO) {
                break;
            }
        }
        assert!(replies.len() > 1);
        assert_eq!(replies.last(), Some(&u32::from(ReplyType::ERR_BLOCK_SIZE_REQD)));

        let req = InfoRequest {
            name: "aligned".to_string(),
            typs: vec![InfoType::BLOCK_SIZE.into()],
        };
        Opt::new(OptType::INFO, req.encode()).put(&mut s)?;
        let mut min_block = None;
        loop {
            let (hdr, data) = raw_reply(&mut s)?;
            if hdr.reply_type == u32::from(ReplyType::ACK) {
                break;
            }
            assert_eq!(hdr.reply_type, u32::from(ReplyType::INFO));
            if let Some(Info::BlockSize { min, .. }) = Info::decode(&data)? {
                min_block = Some(min);
            }
        }
        assert_eq!(min_block, Some(4096));
        raw_abort(&mut s)?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn structured_reply_after_extended_headers() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::EXTENDED_HEADERS, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));

        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_EXT_HEADER_REQD));

        Opt::new(OptType::EXTENDED_HEADERS, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_INVALID));
        raw_abort(&mut s)?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn meta_contexts_reset_when_another_export_is_selected() -> Result<()> {
        let registry = Arc::new(ExportRegistry::new());
        registry.create(ExportConfig::new("a"), Arc::new(MemBlocks::sparse(MIB)))?;
        registry.create(ExportConfig::new("b"), Arc::new(MemBlocks::sparse(MIB)))?;
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));

        let req = MetaContextRequest {
            export: "a".to_string(),
            queries: vec![CONTEXT_BASE_ALLOCATION.to_string()],
        };
        Opt::new(OptType::SET_META_CONTEXT, req.encode()).put(&mut s)?;
        let (hdr, data) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::META_CONTEXT));
        assert_eq!(MetaContext::decode(&data)?.id, BASE_ALLOCATION_ID);
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));

        raw_go(&mut s, "b")?;
        let req = Request::new(Cmd::BLOCK_STATUS, 0, 4096).with_cookie(5);
        s.write_all(&req.encode(false)?)?;
        s.flush()?;
        let chunk = match ReplyHeader::get(&mut s, Mode::Structured)? {
            ReplyHeader::Chunk(chunk) => chunk,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(chunk.cookie, 5);
        assert_eq!(chunk.typ, u16::from(ChunkType::ERROR));
        assert!(chunk.done());
        let mut data = vec![0u8; chunk.length as usize];
        s.read_exact(&mut data)?;
        let payload = ErrorPayload::decode(&data, false)?;
        assert_eq!(payload.error, u32::from(WireError::EINVAL));

        s.write_all(&Request::new(Cmd::DISCONNECT, 0, 0).encode(false)?)?;
        s.flush()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn client_falls_back_to_export_name() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut server_side, channel) = pipe_pair();
        let s_handle = thread::spawn(move || -> Result<()> {
            let s = &mut server_side;
            s.write_u64::<BE>(INIT_MAGIC)?;
            s.write_u64::<BE>(OPTS_MAGIC)?;
            s.write_u16::<BE>((HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES).bits())?;
            s.flush()?;
            assert_eq!(s.read_u32::<BE>()?, fixed_flags());

            // a server predating every option the client tries first
            for expected in [OptType::EXTENDED_HEADERS, OptType::STRUCTURED_REPLY, OptType::GO] {
                let opt = Opt::get(&mut *s)?;
                assert_eq!(opt.typ(), Some(expected));
                OptReply::err(opt.opt, ReplyType::ERR_UNSUP, "").put(&mut *s)?;
            }
            let opt = Opt::get(&mut *s)?;
            assert_eq!(opt.typ(), Some(OptType::LIST));
            let mut entry = vec![];
            put_string(&mut entry, "legacy");
            OptReply::new(opt.opt, ReplyType::SERVER, entry).put(&mut *s)?;
            OptReply::ack(opt.opt).put(&mut *s)?;

            let opt = Opt::get(&mut *s)?;
            assert_eq!(opt.typ(), Some(OptType::EXPORT_NAME));
            assert_eq!(opt.data, b"legacy".to_vec());
            s.write_u64::<BE>(8192)?;
            s.write_u16::<BE>((TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_FLUSH).bits())?;
            s.flush()?;

            let req = Request::get(&mut *s, false)?;
            assert_eq!(req.cmd(), Some(Cmd::FLUSH));
            let mut buf = vec![];
            SimpleReply::ok(req.cookie).encode(&mut buf);
            s.write_all(&buf)?;
            s.flush()?;

            let req = Request::get(&mut *s, false)?;
            assert_eq!(req.cmd(), Some(Cmd::DISCONNECT));
            Ok(())
        });

        let mut client = Client::new(channel, &ClientOptions::new("legacy"))?;
        assert_eq!(client.mode(), Mode::Simple);
        assert_eq!(client.size(), 8192);
        assert!(client.info().flags.contains(TransmitFlags::SEND_FLUSH));
        client.flush()?;
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn dirty_bitmap_block_status() -> Result<()> {
        let bitmap = Arc::new(MemBitmap::new("backup", MIB, 4096));
        let blocks = MemBlocks::sparse(MIB);
        blocks.add_bitmap(bitmap);
        let registry = registry_with(
            "disk",
            blocks,
            ExportConfig {
                bitmaps: vec!["backup".to_string()],
                ..Default::default()
            },
        );
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let query = format!("{CONTEXT_DIRTY_BITMAP_PREFIX}backup");
        let opts = ClientOptions::new("disk").with_meta_context(query);
        let mut client = Client::new(channel, &opts)?;
        assert_eq!(client.info().context_id, Some(FIRST_BITMAP_ID));

        client.write(8192, &[1u8; 512])?;
        let extents = client.block_status(0, 16384, CmdFlags::empty())?;
        assert_eq!(
            extents,
            vec![
                Extent {
                    length: 8192,
                    flags: 0
                },
                Extent {
                    length: 4096,
                    flags: STATE_DIRTY
                },
                Extent {
                    length: 4096,
                    flags: 0
                },
            ]
        );
        client.disconnect()?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn unknown_option_payload_is_skipped() -> Result<()> {
        let registry = registry_with("disk0", MemBlocks::sparse(MIB), ExportConfig::default());
        let (mut s, s_handle) = start(registry, ServerConfig::default());
        raw_greeting(&mut s, fixed_flags())?;
        let unknown = Opt {
            opt: 0x4242,
            data: vec![7u8; 300],
        };
        unknown.put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.opt, 0x4242);
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ERR_UNSUP));

        // the stream is still in sync
        Opt::new(OptType::LIST, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::SERVER));
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        raw_abort(&mut s)?;
        s_handle.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn quiesced_export_holds_requests_until_resumed() -> Result<()> {
        let registry = registry_with("disk", MemBlocks::sparse(MIB), ExportConfig::default());
        let export = registry.lookup("disk").unwrap();
        let (channel, s_handle) = start(registry, ServerConfig::default());
        let mut client = Client::new(channel, &ClientOptions::new("disk"))?;
        client.write(0, &[1u8; 512])?;
        assert_eq!(export.client_count(), 1);

        // the server is idle, waiting for the next request
        let started = Instant::now();
        export.quiesce_clients();
        assert!(started.elapsed() < Duration::from_secs(1));

        let writer = thread::spawn(move || -> Result<Client> {
            client.write(512, &[2u8; 512])?;
            Ok(client)
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        let mut buf = [9u8; 512];
        export.blocks().read_at(&mut buf, 512)?;
        assert_eq!(buf, [0u8; 512]);

        export.resume_clients();
        let mut client = writer.join().unwrap()?;
        assert_eq!(client.read(512, 512)?, vec![2u8; 512]);
        client.disconnect()?;
        s_handle.join().unwrap()?;
        assert_eq!(export.client_count(), 0);
        Ok(())
    }

    #[test]
    fn disconnect_with_unread_replies_finishes() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let size = 8 * MIB;
        let registry = registry_with(
            "big",
            MemBlocks::new(vec![6u8; size as usize]),
            ExportConfig::default(),
        );
        let export = registry.lookup("big").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let mut s = Channel::tcp(TcpStream::connect(listener.local_addr()?)?)?;
        let (stream, _) = listener.accept()?;
        let config = ServerConfig::default().with_drain_timeout(Duration::from_millis(100));
        let server = Server::new(registry.clone(), config);
        let s_handle = thread::spawn(move || -> Result<()> { server.handle_client(Channel::tcp(stream)?) });

        raw_greeting(&mut s, fixed_flags())?;
        Opt::new(OptType::STRUCTURED_REPLY, vec![]).put(&mut s)?;
        let (hdr, _) = raw_reply(&mut s)?;
        assert_eq!(hdr.reply_type, u32::from(ReplyType::ACK));
        raw_go(&mut s, "big")?;

        // far more reply data than the socket buffers hold, and none of it
        // is ever read
        for cookie in 1..=4 {
            let req = Request::new(Cmd::READ, 0, size)
                .with_flags(CmdFlags::DF)
                .with_cookie(cookie);
            s.write_all(&req.encode(false)?)?;
        }
        s.write_all(&Request::new(Cmd::DISCONNECT, 0, 0).encode(false)?)?;
        s.flush()?;

        let deadline = Instant::now() + Duration::from_secs(10);
        while !s_handle.is_finished() {
            assert!(Instant::now() < deadline, "connection teardown is stuck");
            thread::sleep(Duration::from_millis(10));
        }
        s_handle.join().unwrap()?;
        assert_eq!(export.client_count(), 0);
        registry.remove("big", RemoveMode::Safe)?;
        Ok(())
    }
}
