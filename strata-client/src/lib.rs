//! Client side of the strata window server.
//!
//! A [`Connection`] joins one layer on connect and keeps the layer's
//! registry mapped for the life of the session.  The mapping is shared
//! with the server; clients read it (stacking order, hit testing) but
//! mutate only through requests, the server being the sole writer.

use std::os::fd::IntoRawFd;
use std::path::Path;

use strata_channel::{Channel, ChannelError, Frame};
use strata_registry::{Registry, RegistryError};
use strata_shm::{ShmError, ShmObject, Surface};
use strata_wire::{
    pack_name, unpack_name, AllocPopup, AllocRecord, FreePopup, FreeRecord, JoinLayer,
    JoinedInfo, LayerInfoReply, LayerInfoRequest, LayerOp, Level, PopupAllocated,
    RecordAllocated, Rect, SetMaskRects, SurfaceReply, SurfaceRequest, ZOrderOp, ERR_OK,
    LAYER_OP_DELETE, LAYER_OP_SET_TOPMOST, LEN_CLIENT_NAME, LEN_LAYER_NAME, MAX_MASK_RECTS,
    NR_LEVELS, REQ_ALLOC_POPUP, REQ_ALLOC_RECORD, REQ_FREE_POPUP, REQ_FREE_RECORD,
    REQ_JOIN_LAYER, REQ_LAYER_INFO, REQ_LAYER_OP, REQ_PING, REQ_SET_MASK_RECTS, REQ_SURFACE,
    REQ_ZORDER_OP, SERVER_SOCKET_PATH, ZOP_HIDE, ZOP_MOVE_TO_TOP, ZOP_SET_ACTIVE, ZOP_SHOW,
};

/// How long to wait for a reply, in 10 ms ticks.
const REPLY_TIMEOUT_TICKS: u32 = 500;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("transport: {0}")]
    Channel(#[from] ChannelError),
    /// Mapping the registry or a surface failed.
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    /// Reading the mapped registry failed.
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    /// The server answered with an error code.
    #[error("server refused the request (code {0})")]
    Server(i32),
    /// The server's reply made no sense.
    #[error("malformed reply: {0}")]
    Reply(&'static str),
}

/// Options for [`Connection::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions<'a> {
    /// Layer to join; empty joins the default layer.
    pub layer: &'a str,
    /// Client name reported to the server, for diagnostics.
    pub name: &'a str,
    /// Per-level record capacities if the join creates the layer.  Zero
    /// entries take the server defaults.
    pub capacities: [u32; NR_LEVELS],
}

impl Default for ConnectOptions<'_> {
    fn default() -> Self {
        ConnectOptions {
            layer: "",
            name: "",
            capacities: [0; NR_LEVELS],
        }
    }
}

/// One joined session.
pub struct Connection {
    channel: Channel,
    client_id: i32,
    // Mapping order matters on drop: the registry handle is plain
    // pointers into the shm mapping and holds no teardown of its own.
    registry: Registry,
    _registry_shm: ShmObject,
}

impl Connection {
    /// Connects to the server at `path` and joins a layer.
    pub fn connect<P: AsRef<Path>>(
        path: P,
        options: &ConnectOptions<'_>,
    ) -> Result<Connection, ClientError> {
        let channel = Channel::connect(path)?;
        let join = JoinLayer {
            layer_name: pack_name::<{ LEN_LAYER_NAME + 1 }>(options.layer),
            client_name: pack_name::<{ LEN_CLIENT_NAME + 1 }>(options.name),
            capacities: options.capacities,
        };
        channel.send_request(REQ_JOIN_LAYER, bytemuck::bytes_of(&join), None)?;
        let info: JoinedInfo = parse_reply(&channel.recv_reply(REPLY_TIMEOUT_TICKS)?)?;

        let name = unpack_name(&info.shm_name).ok_or(ClientError::Reply("bad shm name"))?;
        let shm = ShmObject::open(name, info.region_size as usize)?;
        let registry = unsafe { Registry::open_at(shm.as_ptr(), shm.len()) }?;
        log::debug!(
            "joined layer {:?} as client {} ({} byte registry)",
            options.layer,
            info.client_id,
            info.region_size
        );
        Ok(Connection {
            channel,
            client_id: info.client_id,
            registry,
            _registry_shm: shm,
        })
    }

    /// Connects to the well-known server socket.
    pub fn connect_default(options: &ConnectOptions<'_>) -> Result<Connection, ClientError> {
        Connection::connect(SERVER_SOCKET_PATH, options)
    }

    /// The server-assigned client id.
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// The joined layer's registry.  Read-only by contract; the mapping
    /// is shared with every other client of the layer.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn roundtrip(&self, id: u32, body: &[u8]) -> Result<Frame, ClientError> {
        self.channel.send_request(id, body, None)?;
        let frame = self.channel.recv_reply(REPLY_TIMEOUT_TICKS)?;
        let code = frame.word0 as i32;
        if code != ERR_OK {
            return Err(ClientError::Server(code));
        }
        Ok(frame)
    }

    /// Allocates a window record, returning its registry index.
    pub fn alloc_record(
        &self,
        level: Level,
        flags: u32,
        rect: Rect,
        window: u32,
        main_window: u32,
    ) -> Result<i32, ClientError> {
        let msg = AllocRecord {
            level: level as u32,
            flags,
            rect,
            window,
            main_window,
        };
        let frame = self.roundtrip(REQ_ALLOC_RECORD, bytemuck::bytes_of(&msg))?;
        let out: RecordAllocated = parse_body(&frame.body)?;
        Ok(out.index)
    }

    /// Frees a window record.
    pub fn free_record(&self, index: i32) -> Result<(), ClientError> {
        let msg = FreeRecord { index };
        self.roundtrip(REQ_FREE_RECORD, bytemuck::bytes_of(&msg))?;
        Ok(())
    }

    /// Pushes a popup record, returning its popup-stack index.
    pub fn alloc_popup(&self, flags: u32, rect: Rect, window: u32) -> Result<i32, ClientError> {
        let msg = AllocPopup {
            flags,
            rect,
            window,
        };
        let frame = self.roundtrip(REQ_ALLOC_POPUP, bytemuck::bytes_of(&msg))?;
        let out: PopupAllocated = parse_body(&frame.body)?;
        Ok(out.index)
    }

    /// Pops a popup record.  Everything stacked above it is popped too.
    pub fn free_popup(&self, index: i32) -> Result<(), ClientError> {
        let msg = FreePopup { index };
        self.roundtrip(REQ_FREE_POPUP, bytemuck::bytes_of(&msg))?;
        Ok(())
    }

    fn zorder(&self, op: u32, index: i32) -> Result<(), ClientError> {
        let msg = ZOrderOp { op, index };
        self.roundtrip(REQ_ZORDER_OP, bytemuck::bytes_of(&msg))?;
        Ok(())
    }

    /// Raises a record to the top of its level.
    pub fn move_to_top(&self, index: i32) -> Result<(), ClientError> {
        self.zorder(ZOP_MOVE_TO_TOP, index)
    }

    /// Makes a record the active one; 0 clears the focus.
    pub fn set_active(&self, index: i32) -> Result<(), ClientError> {
        self.zorder(ZOP_SET_ACTIVE, index)
    }

    /// Shows a record.
    pub fn show(&self, index: i32) -> Result<(), ClientError> {
        self.zorder(ZOP_SHOW, index)
    }

    /// Hides a record.
    pub fn hide(&self, index: i32) -> Result<(), ClientError> {
        self.zorder(ZOP_HIDE, index)
    }

    /// Replaces a record's mask-rectangle chain.  Rectangles are in
    /// window-relative coordinates.
    pub fn set_mask_rects(&self, index: i32, rects: &[Rect]) -> Result<(), ClientError> {
        if rects.len() > MAX_MASK_RECTS {
            return Err(ClientError::Reply("too many mask rectangles"));
        }
        let header = SetMaskRects {
            index,
            untrusted_count: rects.len() as u32,
        };
        let mut body = bytemuck::bytes_of(&header).to_vec();
        for rect in rects {
            body.extend_from_slice(bytemuck::bytes_of(rect));
        }
        self.roundtrip(REQ_SET_MASK_RECTS, &body)?;
        Ok(())
    }

    /// Creates a shared pixel surface for `window` (0 for the wallpaper)
    /// and maps it.  The mapping prefers the descriptor passed back with
    /// the reply and falls back to the advertised shm name.
    pub fn create_surface(
        &self,
        window: u32,
        width: u32,
        height: u32,
    ) -> Result<Surface, ClientError> {
        let msg = SurfaceRequest {
            window,
            width,
            height,
        };
        let mut frame = self.roundtrip(REQ_SURFACE, bytemuck::bytes_of(&msg))?;
        let out: SurfaceReply = parse_body(&frame.body)?;
        let size = out.region_size as usize;
        if let Some(fd) = frame.fd.take() {
            return Ok(Surface::from_fd(fd.into_raw_fd(), size)?);
        }
        let name = unpack_name(&out.shm_name).ok_or(ClientError::Reply("bad shm name"))?;
        Ok(Surface::open(name, size)?)
    }

    /// Queries a layer; an empty name queries the joined layer.
    pub fn layer_info(&self, layer: &str) -> Result<LayerInfoReply, ClientError> {
        let msg = LayerInfoRequest {
            layer_name: pack_name::<{ LEN_LAYER_NAME + 1 }>(layer),
        };
        let frame = self.roundtrip(REQ_LAYER_INFO, bytemuck::bytes_of(&msg))?;
        parse_body(&frame.body)
    }

    fn layer_op(&self, op: u32, layer: &str) -> Result<(), ClientError> {
        let msg = LayerOp {
            op,
            layer_name: pack_name::<{ LEN_LAYER_NAME + 1 }>(layer),
        };
        self.roundtrip(REQ_LAYER_OP, bytemuck::bytes_of(&msg))?;
        Ok(())
    }

    /// Makes the named layer topmost.
    pub fn set_layer_topmost(&self, layer: &str) -> Result<(), ClientError> {
        self.layer_op(LAYER_OP_SET_TOPMOST, layer)
    }

    /// Deletes the named layer.
    pub fn delete_layer(&self, layer: &str) -> Result<(), ClientError> {
        self.layer_op(LAYER_OP_DELETE, layer)
    }

    /// Liveness check; also gives the server a turn to flush damage.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.roundtrip(REQ_PING, &[])?;
        Ok(())
    }
}

fn parse_reply<T: bytemuck::Pod>(frame: &Frame) -> Result<T, ClientError> {
    let code = frame.word0 as i32;
    if code != ERR_OK {
        return Err(ClientError::Server(code));
    }
    parse_body(&frame.body)
}

fn parse_body<T: bytemuck::Pod>(body: &[u8]) -> Result<T, ClientError> {
    if body.len() != std::mem::size_of::<T>() {
        return Err(ClientError::Reply("wrong reply length"));
    }
    Ok(bytemuck::pod_read_unaligned(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use strata_server::{Server, ServerConfig};

    struct TestServer {
        stop: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
        socket: std::path::PathBuf,
    }

    impl TestServer {
        fn spawn() -> TestServer {
            static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
            let seq = NEXT.fetch_add(1, Ordering::Relaxed);
            let socket = std::env::temp_dir().join(format!(
                "strata-client-test-{}-{}.sock",
                std::process::id(),
                seq
            ));
            let config = ServerConfig {
                socket_path: socket.clone(),
                screen_rect: Rect::new(0, 0, 640, 480),
                ..ServerConfig::default()
            };
            let mut server = Server::new(config).unwrap();
            let stop = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop);
            let thread = std::thread::spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if let Err(err) = server.poll_once(5) {
                        panic!("server loop failed: {}", err);
                    }
                }
            });
            TestServer {
                stop,
                thread: Some(thread),
                socket,
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[test]
    fn a_session_sees_its_own_records_in_the_mapped_registry() {
        let server = TestServer::spawn();
        let conn = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        assert!(conn.client_id() > 0);

        let idx = conn
            .alloc_record(
                Level::Normal,
                strata_wire::FLAG_VISIBLE,
                Rect::new(10, 10, 50, 50),
                42,
                0,
            )
            .unwrap();
        assert!(idx > 0);

        // The shared mapping reflects the server's mutation.
        let node = conn.registry().record(idx).unwrap();
        assert_eq!(node.window, 42);
        assert_eq!(node.client, conn.client_id());

        conn.free_record(idx).unwrap();
        assert!(conn.registry().record(idx).is_err());
    }

    #[test]
    fn surfaces_round_trip_through_the_passed_descriptor() {
        let server = TestServer::spawn();
        let conn = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        let surface = conn.create_surface(7, 32, 16).unwrap();
        assert_eq!(surface.width(), 32);
        assert_eq!(surface.height(), 16);
        surface.mark_dirty(Rect::new(0, 0, 8, 8));
        assert_eq!(surface.dirty_age(), 1);
        conn.ping().unwrap();
    }

    #[test]
    fn server_refusals_surface_as_error_codes() {
        let server = TestServer::spawn();
        let conn = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        // Freeing a record the client does not own.
        let err = conn.free_record(9999).err().unwrap();
        assert!(matches!(err, ClientError::Server(code) if code < 0));
        // The session survives the refusal.
        conn.ping().unwrap();
    }

    #[test]
    fn popup_menus_stack_and_pop_over_the_socket() {
        let server = TestServer::spawn();
        let conn = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        let lower = conn
            .alloc_popup(strata_wire::FLAG_VISIBLE, Rect::new(4, 4, 20, 20), 6)
            .unwrap();
        conn.alloc_popup(strata_wire::FLAG_VISIBLE, Rect::new(8, 8, 24, 24), 7)
            .unwrap();
        assert_eq!(conn.registry().popup_count().unwrap(), 2);

        conn.free_popup(lower).unwrap();
        assert_eq!(conn.registry().popup_count().unwrap(), 0);
    }

    #[test]
    fn two_clients_share_one_layer() {
        let server = TestServer::spawn();
        let a = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        let b = Connection::connect(&server.socket, &ConnectOptions::default()).unwrap();
        let idx = a
            .alloc_record(
                Level::Normal,
                strata_wire::FLAG_VISIBLE,
                Rect::new(0, 0, 20, 20),
                1,
                0,
            )
            .unwrap();
        // b's mapping of the same layer sees a's record.
        let node = b.registry().record(idx).unwrap();
        assert_eq!(node.client, a.client_id());

        let info = b.layer_info("").unwrap();
        assert_eq!(info.nr_clients, 2);
        assert_eq!(info.is_topmost, 1);
    }
}
