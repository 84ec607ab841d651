//! Request dispatch: the server state, the built-in handlers, and the
//! registration table for application-defined requests.
//!
//! The transport is deliberately absent here.  The socket loop hands in
//! `(client, id, body)` and sends whatever [`Reply`] comes back, which
//! keeps every handler testable against plain byte slices.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};

use strata_compositor::{
    CompositorContext, CompositorError, CompositorManager, CompositorOps, LayerChange,
    SurfaceProvider,
};
use strata_registry::{Capacities, Registry, ZNode, ZNodeFlags};
use strata_shm::Surface;
use strata_wire::{
    pack_name, request_length_limits, unpack_name, AllocPopup, AllocRecord, FreePopup,
    FreeRecord, JoinLayer, JoinedInfo, LayerInfoReply, LayerInfoRequest, LayerOp, Level,
    PopupAllocated, RecordAllocated, SetMaskRects, SurfaceReply, SurfaceRequest, ZOrderOp,
    LAYER_OP_DELETE, LAYER_OP_SET_TOPMOST, MAX_MASK_RECTS, MAX_REQUEST_ID, MAX_SURFACE_HEIGHT,
    MAX_SURFACE_WIDTH, MAX_SYS_REQUEST_ID, REQ_ALLOC_POPUP, REQ_ALLOC_RECORD, REQ_FREE_POPUP,
    REQ_FREE_RECORD, REQ_JOIN_LAYER, REQ_LAYER_INFO, REQ_LAYER_OP, REQ_PING, REQ_SET_MASK_RECTS,
    REQ_SURFACE, REQ_ZORDER_OP, Rect, ERR_OK, ZOP_HIDE, ZOP_MOVE_TO_TOP, ZOP_SET_ACTIVE,
    ZOP_SHOW,
};

use crate::client::ClientRecord;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::layer::LayerTable;
use crate::unique_shm_name;

/// A reply ready to put on the wire.
pub struct Reply {
    /// Status code; [`ERR_OK`] or a negative error.
    pub code: i32,
    /// Reply body.
    pub body: Vec<u8>,
    /// Descriptor to pass with the reply.  Borrowed from server-owned
    /// state; the dispatch layer never closes it.
    pub fd: Option<RawFd>,
}

impl Reply {
    fn ok() -> Reply {
        Reply {
            code: ERR_OK,
            body: Vec::new(),
            fd: None,
        }
    }

    fn with_body<T: bytemuck::Pod>(body: &T) -> Reply {
        Reply {
            code: ERR_OK,
            body: bytemuck::bytes_of(body).to_vec(),
            fd: None,
        }
    }
}

/// Pixel surfaces the server holds on behalf of clients, keyed by the
/// owning client and its window handle.
#[derive(Default)]
pub struct SurfaceTable {
    by_key: HashMap<(i32, u32), Surface>,
    wallpaper: Option<Surface>,
}

impl SurfaceProvider for SurfaceTable {
    fn surface_for(&self, record: &ZNode) -> Option<&Surface> {
        self.by_key.get(&(record.client, record.window))
    }

    fn wallpaper(&self) -> Option<&Surface> {
        self.wallpaper.as_ref()
    }
}

/// Handler for one application-registered request id.
pub type Handler =
    Box<dyn FnMut(&mut ServerState, i32, &[u8]) -> Result<Reply, ServerError> + Send>;

/// Application-defined request handlers, outside the system band.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u32, Handler>,
}

impl Dispatcher {
    /// Registers a handler.  Only ids strictly inside
    /// `(MAX_SYS_REQUEST_ID, MAX_REQUEST_ID]` are accepted, and only once.
    pub fn register(&mut self, id: u32, handler: Handler) -> Result<(), ServerError> {
        if id <= MAX_SYS_REQUEST_ID || id > MAX_REQUEST_ID {
            return Err(ServerError::Refused(
                "request id outside the registerable band",
            ));
        }
        if self.handlers.contains_key(&id) {
            return Err(ServerError::Refused("request id already registered"));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Runs the handler for `id`, if one is registered.
    pub fn dispatch(
        &mut self,
        state: &mut ServerState,
        client: i32,
        id: u32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        match self.handlers.get_mut(&id) {
            Some(handler) => handler(state, client, body),
            None => Err(ServerError::Refused("no handler for request")),
        }
    }
}

fn parse<T: bytemuck::Pod>(body: &[u8]) -> Result<T, ServerError> {
    if body.len() != std::mem::size_of::<T>() {
        return Err(ServerError::Protocol("bad request length"));
    }
    Ok(bytemuck::pod_read_unaligned(body))
}

/// The server's whole mutable world: layers, clients, and surfaces.
pub struct ServerState {
    layers: LayerTable,
    clients: HashMap<i32, ClientRecord>,
    surfaces: SurfaceTable,
    next_client_id: i32,
    screen_rect: Rect,
}

impl ServerState {
    /// Builds the state with the default layer in place.
    pub fn new(config: &ServerConfig) -> Result<ServerState, ServerError> {
        Ok(ServerState {
            layers: LayerTable::new(&config.default_caps, config.screen_rect)?,
            clients: HashMap::new(),
            surfaces: SurfaceTable::default(),
            next_client_id: 1,
            screen_rect: config.screen_rect,
        })
    }

    /// Admits a new connection, returning its client id.
    pub fn accept_client(&mut self) -> i32 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, ClientRecord::new(id));
        log::debug!("client {} connected", id);
        id
    }

    /// The layer table.
    pub fn layers(&self) -> &LayerTable {
        &self.layers
    }

    /// The surface table.
    pub fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    /// The session record of a client.
    pub fn client(&self, id: i32) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    /// Compositor context for the layer at `index`.
    pub fn context_for(&self, index: usize) -> CompositorContext<'_> {
        CompositorContext {
            registry: self.layers.get(index).registry(),
            surfaces: &self.surfaces,
            screen_rect: self.screen_rect,
        }
    }

    /// Compositor context for the topmost layer.
    pub fn topmost_context(&self) -> CompositorContext<'_> {
        self.context_for(self.layers.topmost())
    }

    fn notify(
        &self,
        manager: &CompositorManager,
        layer: usize,
        f: impl FnOnce(&mut dyn CompositorOps, &CompositorContext<'_>),
    ) {
        let ctx = self.context_for(layer);
        manager.with_active(|ops| f(ops, &ctx));
    }

    fn joined_layer(&self, client: i32) -> Result<usize, ServerError> {
        let record = self
            .clients
            .get(&client)
            .ok_or(ServerError::Protocol("unknown client"))?;
        if !record.is_joined() {
            return Err(ServerError::Protocol("request before join"));
        }
        record
            .layer
            .ok_or(ServerError::Protocol("joined client without a layer"))
    }

    fn owned_record(
        &self,
        registry: &Registry,
        client: i32,
        idx: i32,
    ) -> Result<ZNode, ServerError> {
        let node = registry.record(idx)?;
        if idx == 0 || node.client != client {
            return Err(ServerError::Refused("record owned by another client"));
        }
        Ok(node)
    }

    /// Handles one built-in request.  Errors bubble to the socket loop,
    /// which decides between an error reply and a disconnect.
    pub fn handle_builtin(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        id: u32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let limits =
            request_length_limits(id).ok_or(ServerError::Protocol("unknown request id"))?;
        if !limits.contains(&body.len()) {
            return Err(ServerError::Protocol("bad request length"));
        }
        match id {
            REQ_JOIN_LAYER => self.handle_join(client, body),
            REQ_LAYER_INFO => self.handle_layer_info(client, body),
            REQ_LAYER_OP => self.handle_layer_op(manager, client, body),
            REQ_ALLOC_RECORD => self.handle_alloc(manager, client, body),
            REQ_FREE_RECORD => self.handle_free(manager, client, body),
            REQ_ZORDER_OP => self.handle_zorder(manager, client, body),
            REQ_SET_MASK_RECTS => self.handle_set_mask_rects(manager, client, body),
            REQ_SURFACE => self.handle_surface(client, body),
            REQ_PING => Ok(Reply::ok()),
            REQ_ALLOC_POPUP => self.handle_alloc_popup(manager, client, body),
            REQ_FREE_POPUP => self.handle_free_popup(manager, client, body),
            _ => Err(ServerError::Protocol("unknown request id")),
        }
    }

    fn handle_join(&mut self, client: i32, body: &[u8]) -> Result<Reply, ServerError> {
        let msg: JoinLayer = parse(body)?;
        let record = self
            .clients
            .get(&client)
            .ok_or(ServerError::Protocol("unknown client"))?;
        if record.is_joined() {
            return Err(ServerError::Protocol("double join"));
        }
        let layer_name = unpack_name(&msg.layer_name)
            .ok_or(ServerError::Protocol("layer name is not utf-8"))?
            .to_owned();
        let client_name = unpack_name(&msg.client_name).unwrap_or("").to_owned();
        let caps = Capacities {
            popups: 0,
            levels: msg.capacities,
            mask_rects: 0,
        };
        let layer = self.layers.join(client, &layer_name, &caps)?;
        if let Some(record) = self.clients.get_mut(&client) {
            record.joined(client_name, layer);
        }
        let layer = self.layers.get(layer);
        Ok(Reply::with_body(&JoinedInfo {
            client_id: client,
            region_size: layer.region_size() as u32,
            shm_name: pack_name(layer.shm_name()),
        }))
    }

    fn handle_layer_info(&mut self, client: i32, body: &[u8]) -> Result<Reply, ServerError> {
        let msg: LayerInfoRequest = parse(body)?;
        let own_layer = self.joined_layer(client)?;
        let name = unpack_name(&msg.layer_name)
            .ok_or(ServerError::Protocol("layer name is not utf-8"))?;
        let index = if name.is_empty() {
            own_layer
        } else {
            self.layers
                .find(name)
                .ok_or(ServerError::Refused("no such layer"))?
        };
        let layer = self.layers.get(index);
        let active = layer.registry().active()?;
        let active_client = if active > 0 {
            layer.registry().record(active)?.client
        } else {
            -1
        };
        Ok(Reply::with_body(&LayerInfoReply {
            nr_clients: layer.clients().len() as u32,
            is_topmost: (index == self.layers.topmost()) as u32,
            active_client,
        }))
    }

    fn handle_layer_op(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: LayerOp = parse(body)?;
        self.joined_layer(client)?;
        let name = unpack_name(&msg.layer_name)
            .ok_or(ServerError::Protocol("layer name is not utf-8"))?
            .to_owned();
        match msg.op {
            LAYER_OP_SET_TOPMOST => {
                if self.layers.set_topmost(&name)? {
                    self.notify(manager, self.layers.topmost(), |ops, ctx| {
                        ops.on_layer_op(ctx, LayerChange::Switched);
                        ops.transit_to_layer(ctx);
                    });
                }
                Ok(Reply::ok())
            }
            LAYER_OP_DELETE => {
                self.layers.delete(&name)?;
                self.notify(manager, self.layers.topmost(), |ops, ctx| {
                    ops.on_layer_op(ctx, LayerChange::Deleted);
                });
                Ok(Reply::ok())
            }
            _ => Err(ServerError::Refused("unknown layer operation")),
        }
    }

    fn handle_alloc(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: AllocRecord = parse(body)?;
        let layer = self.joined_layer(client)?;
        let level =
            Level::from_wire(msg.level).ok_or(ServerError::Refused("bad priority level"))?;
        let flags = ZNodeFlags::from_bits_truncate(msg.flags);
        let index = self.layers.get(layer).registry().alloc_record(
            level,
            flags,
            msg.rect,
            client,
            msg.window,
            msg.main_window,
        )?;

        // System-surface levels pull their layer to the front.
        if matches!(level, Level::ScreenLock | Level::Docker | Level::Launcher)
            && self.layers.set_topmost_index(layer)
        {
            self.notify(manager, layer, |ops, ctx| {
                ops.on_layer_op(ctx, LayerChange::Switched);
            });
        }
        if flags.contains(ZNodeFlags::VISIBLE) {
            self.notify(manager, layer, |ops, ctx| ops.on_showing_win(ctx, index));
        }
        Ok(Reply::with_body(&RecordAllocated {
            index,
            reserved: 0,
        }))
    }

    fn handle_free(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: FreeRecord = parse(body)?;
        let layer = self.joined_layer(client)?;
        let registry = self.layers.get(layer).registry();
        self.owned_record(registry, client, msg.index)?;
        let was_active = registry.active()? == msg.index;
        self.notify(manager, layer, |ops, ctx| {
            ops.on_hiding_win(ctx, msg.index);
        });
        self.layers.get(layer).registry().free_record(msg.index)?;
        if was_active {
            if let Some(record) = self.clients.get_mut(&client) {
                record.deactivated();
            }
        }
        Ok(Reply::ok())
    }

    fn handle_alloc_popup(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: AllocPopup = parse(body)?;
        let layer = self.joined_layer(client)?;
        let flags = ZNodeFlags::from_bits_truncate(msg.flags);
        let index =
            self.layers
                .get(layer)
                .registry()
                .alloc_popup(flags, msg.rect, client, msg.window)?;
        if flags.contains(ZNodeFlags::VISIBLE) {
            self.notify(manager, layer, |ops, ctx| ops.on_showing_ppp(ctx, index));
        }
        Ok(Reply::with_body(&PopupAllocated { index, reserved: 0 }))
    }

    fn handle_free_popup(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: FreePopup = parse(body)?;
        let layer = self.joined_layer(client)?;
        let registry = self.layers.get(layer).registry();
        let node = registry.popup_record(msg.index)?;
        if node.client != client {
            return Err(ServerError::Refused("popup owned by another client"));
        }
        // Popping is stack-disciplined: everything above goes too, and
        // the compositor hears about each one, top first.
        let top = registry.popup_count()? as i32;
        for idx in (msg.index..top).rev() {
            let rect = registry.popup_record(idx)?.rect;
            self.notify(manager, layer, |ops, ctx| {
                ops.on_hiding_ppp(ctx, idx);
                ops.on_closed_menu(ctx, rect);
            });
        }
        self.layers.get(layer).registry().free_popup(msg.index)?;
        Ok(Reply::ok())
    }

    fn handle_zorder(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let msg: ZOrderOp = parse(body)?;
        let layer = self.joined_layer(client)?;
        let registry = self.layers.get(layer).registry();
        match msg.op {
            ZOP_MOVE_TO_TOP => {
                self.owned_record(registry, client, msg.index)?;
                registry.move_to_top(msg.index)?;
                self.notify(manager, layer, |ops, ctx| {
                    ops.on_raised_win(ctx, msg.index);
                });
            }
            ZOP_SET_ACTIVE => {
                if msg.index != 0 {
                    self.owned_record(registry, client, msg.index)?;
                }
                let old = registry.set_active(msg.index)?;
                if old > 0 {
                    let old_owner = registry.record(old)?.client;
                    if let Some(record) = self.clients.get_mut(&old_owner) {
                        record.deactivated();
                    }
                }
                if msg.index != 0 {
                    if let Some(record) = self.clients.get_mut(&client) {
                        record.activated();
                    }
                }
            }
            ZOP_SHOW | ZOP_HIDE => {
                self.owned_record(registry, client, msg.index)?;
                let show = msg.op == ZOP_SHOW;
                if registry.set_visible(msg.index, show)? {
                    self.notify(manager, layer, |ops, ctx| {
                        if show {
                            ops.on_showing_win(ctx, msg.index);
                        } else {
                            ops.on_hiding_win(ctx, msg.index);
                        }
                    });
                }
            }
            _ => return Err(ServerError::Refused("unknown z-order operation")),
        }
        Ok(Reply::ok())
    }

    fn handle_set_mask_rects(
        &mut self,
        manager: &CompositorManager,
        client: i32,
        body: &[u8],
    ) -> Result<Reply, ServerError> {
        let header_len = std::mem::size_of::<SetMaskRects>();
        let rect_len = std::mem::size_of::<Rect>();
        if body.len() < header_len {
            return Err(ServerError::Protocol("bad request length"));
        }
        let msg: SetMaskRects = bytemuck::pod_read_unaligned(&body[..header_len]);
        let count = msg.untrusted_count as usize;
        if count > MAX_MASK_RECTS || body.len() != header_len + count * rect_len {
            return Err(ServerError::Protocol("bad mask-rect count"));
        }
        let rects: Vec<Rect> = body[header_len..]
            .chunks_exact(rect_len)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        let layer = self.joined_layer(client)?;
        let registry = self.layers.get(layer).registry();
        self.owned_record(registry, client, msg.index)?;
        registry.set_mask_rects(msg.index, &rects)?;
        self.notify(manager, layer, |ops, ctx| {
            ops.on_changed_rgn(ctx, msg.index);
        });
        Ok(Reply::ok())
    }

    fn handle_surface(&mut self, client: i32, body: &[u8]) -> Result<Reply, ServerError> {
        let msg: SurfaceRequest = parse(body)?;
        self.joined_layer(client)?;
        if msg.width == 0
            || msg.height == 0
            || msg.width > MAX_SURFACE_WIDTH
            || msg.height > MAX_SURFACE_HEIGHT
        {
            return Err(ServerError::Refused("bad surface dimensions"));
        }
        let name = unique_shm_name("surf");
        let surface = Surface::create(&name, msg.width, msg.height)?;
        let region_size = surface.shm().len() as u32;
        let reply = SurfaceReply {
            region_size,
            shm_name: pack_name(&name),
        };
        // Window handle 0 designates the wallpaper.
        let fd = if msg.window == 0 {
            if self.surfaces.wallpaper.is_some() {
                log::warn!("client {} replaced the wallpaper surface", client);
            }
            self.surfaces.wallpaper = Some(surface);
            self.surfaces
                .wallpaper
                .as_ref()
                .map(|s| s.shm().as_raw_fd())
        } else {
            if let Some(old) = self.surfaces.by_key.insert((client, msg.window), surface) {
                log::warn!(
                    "client {} replaced the surface of window {} ({:?} dropped)",
                    client,
                    msg.window,
                    old.shm().name()
                );
            }
            self.surfaces
                .by_key
                .get(&(client, msg.window))
                .map(|s| s.shm().as_raw_fd())
        };
        let mut reply = Reply::with_body(&reply);
        reply.fd = fd;
        Ok(reply)
    }

    /// Tears a client down: every record it owns is freed (the compositor
    /// hears about each one), its surfaces are dropped, and it leaves its
    /// layer.
    pub fn disconnect(&mut self, manager: &CompositorManager, client: i32) {
        let Some(record) = self.clients.get_mut(&client) else {
            return;
        };
        record.disconnected();
        let layer = record.layer;
        if let Some(layer) = layer {
            let registry = self.layers.get(layer).registry();

            // The client's popups come off the stack first, along with
            // anything stacked above them.
            let mut lowest = None;
            let _ = registry.walk_popups(|idx, node| {
                if node.client == client {
                    lowest = Some(idx);
                }
                true
            });
            if let Some(base) = lowest {
                let top = registry.popup_count().map(|n| n as i32).unwrap_or(base);
                for idx in (base..top).rev() {
                    self.notify(manager, layer, |ops, ctx| ops.on_hiding_ppp(ctx, idx));
                }
                if let Err(err) = registry.free_popup(base) {
                    log::warn!("popup sweep of client {} failed: {}", client, err);
                }
            }

            let mut owned = Vec::new();
            let _ = registry.walk_records(|idx, node| {
                if node.client == client {
                    owned.push(idx);
                }
                true
            });
            for idx in owned {
                self.notify(manager, layer, |ops, ctx| ops.on_hiding_win(ctx, idx));
            }
            let freed = self
                .layers
                .get(layer)
                .registry()
                .free_client_records(client, |idx, _| {
                    log::trace!("freed record {} of client {}", idx, client);
                });
            match freed {
                Ok(n) if n > 0 => log::info!("client {} left {} records behind", client, n),
                Ok(_) => {}
                Err(err) => log::warn!("disconnect sweep of client {} failed: {}", client, err),
            }
            self.layers.leave(client, layer);
        }
        self.surfaces.by_key.retain(|(owner, _), _| *owner != client);
        self.clients.remove(&client);
        log::debug!("client {} disconnected", client);
    }

    /// Selects the active compositor, building the context from the
    /// topmost layer.
    pub fn select_compositor(
        &self,
        manager: &CompositorManager,
        name: &str,
    ) -> Result<(), CompositorError> {
        manager.select(&self.topmost_context(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientPhase;
    use std::sync::Arc;
    use strata_compositor::{FallbackCompositor, FrameBuffer};
    use strata_wire::{LEN_CLIENT_NAME, LEN_LAYER_NAME, NR_LEVELS};

    fn manager() -> CompositorManager {
        let frame = Arc::new(FrameBuffer::new(640, 480));
        CompositorManager::new(Box::new(FallbackCompositor::new(frame, None)))
    }

    fn state() -> ServerState {
        let config = ServerConfig {
            screen_rect: Rect::new(0, 0, 640, 480),
            ..ServerConfig::default()
        };
        ServerState::new(&config).unwrap()
    }

    fn join_msg(layer: &str) -> JoinLayer {
        JoinLayer {
            layer_name: pack_name::<{ LEN_LAYER_NAME + 1 }>(layer),
            client_name: pack_name::<{ LEN_CLIENT_NAME + 1 }>("test"),
            capacities: [0; NR_LEVELS],
        }
    }

    fn join(state: &mut ServerState, manager: &CompositorManager, layer: &str) -> i32 {
        let client = state.accept_client();
        let reply = state
            .handle_builtin(
                manager,
                client,
                REQ_JOIN_LAYER,
                bytemuck::bytes_of(&join_msg(layer)),
            )
            .unwrap();
        assert_eq!(reply.code, ERR_OK);
        client
    }

    fn alloc(
        state: &mut ServerState,
        manager: &CompositorManager,
        client: i32,
        level: Level,
        window: u32,
    ) -> i32 {
        let msg = AllocRecord {
            level: level as u32,
            flags: strata_wire::FLAG_VISIBLE,
            rect: Rect::new(0, 0, 32, 32),
            window,
            main_window: 0,
        };
        let reply = state
            .handle_builtin(manager, client, REQ_ALLOC_RECORD, bytemuck::bytes_of(&msg))
            .unwrap();
        let out: RecordAllocated = bytemuck::pod_read_unaligned(&reply.body);
        out.index
    }

    #[test]
    fn join_reports_the_region() {
        let mut state = state();
        let manager = manager();
        let client = state.accept_client();
        let reply = state
            .handle_builtin(
                &manager,
                client,
                REQ_JOIN_LAYER,
                bytemuck::bytes_of(&join_msg("")),
            )
            .unwrap();
        let info: JoinedInfo = bytemuck::pod_read_unaligned(&reply.body);
        assert_eq!(info.client_id, client);
        assert!(info.region_size > 0);
        assert!(unpack_name(&info.shm_name).unwrap().starts_with("/strata-"));
        assert_eq!(state.client(client).unwrap().phase, ClientPhase::Joined);
    }

    #[test]
    fn requests_before_join_drop_the_client() {
        let mut state = state();
        let manager = manager();
        let client = state.accept_client();
        let msg = FreeRecord { index: 1 };
        let err = state
            .handle_builtin(&manager, client, REQ_FREE_RECORD, bytemuck::bytes_of(&msg))
            .err()
            .unwrap();
        assert!(err.drops_client());
    }

    #[test]
    fn double_join_is_a_protocol_error() {
        let mut state = state();
        let manager = manager();
        let client = join(&mut state, &manager, "");
        let err = state
            .handle_builtin(
                &manager,
                client,
                REQ_JOIN_LAYER,
                bytemuck::bytes_of(&join_msg("")),
            )
            .err()
            .unwrap();
        assert!(err.drops_client());
    }

    #[test]
    fn wrong_length_is_a_protocol_error() {
        let mut state = state();
        let manager = manager();
        let client = join(&mut state, &manager, "");
        let err = state
            .handle_builtin(&manager, client, REQ_ALLOC_RECORD, &[0u8; 3])
            .err()
            .unwrap();
        assert!(err.drops_client());
    }

    #[test]
    fn records_are_owner_checked() {
        let mut state = state();
        let manager = manager();
        let alice = join(&mut state, &manager, "");
        let bob = join(&mut state, &manager, "");
        let idx = alloc(&mut state, &manager, alice, Level::Normal, 11);

        let msg = FreeRecord { index: idx };
        let err = state
            .handle_builtin(&manager, bob, REQ_FREE_RECORD, bytemuck::bytes_of(&msg))
            .err()
            .unwrap();
        assert!(!err.drops_client());

        let reply = state
            .handle_builtin(&manager, alice, REQ_FREE_RECORD, bytemuck::bytes_of(&msg))
            .unwrap();
        assert_eq!(reply.code, ERR_OK);
    }

    #[test]
    fn screenlock_alloc_migrates_its_layer_topmost() {
        let mut state = state();
        let manager = manager();
        let _other = join(&mut state, &manager, "");
        let locker = join(&mut state, &manager, "lock");
        let lock_layer = state.client(locker).unwrap().layer.unwrap();
        assert_ne!(state.layers().topmost(), lock_layer);

        alloc(&mut state, &manager, locker, Level::ScreenLock, 1);
        assert_eq!(state.layers().topmost(), lock_layer);
    }

    #[test]
    fn set_active_moves_the_focus_between_clients() {
        let mut state = state();
        let manager = manager();
        let alice = join(&mut state, &manager, "");
        let bob = join(&mut state, &manager, "");
        let a = alloc(&mut state, &manager, alice, Level::Normal, 1);
        let b = alloc(&mut state, &manager, bob, Level::Normal, 2);

        let msg = ZOrderOp {
            op: ZOP_SET_ACTIVE,
            index: a,
        };
        state
            .handle_builtin(&manager, alice, REQ_ZORDER_OP, bytemuck::bytes_of(&msg))
            .unwrap();
        assert_eq!(state.client(alice).unwrap().phase, ClientPhase::Active);

        let msg = ZOrderOp {
            op: ZOP_SET_ACTIVE,
            index: b,
        };
        state
            .handle_builtin(&manager, bob, REQ_ZORDER_OP, bytemuck::bytes_of(&msg))
            .unwrap();
        assert_eq!(state.client(alice).unwrap().phase, ClientPhase::Inactive);
        assert_eq!(state.client(bob).unwrap().phase, ClientPhase::Active);
    }

    #[test]
    fn disconnect_sweeps_records_and_surfaces() {
        let mut state = state();
        let manager = manager();
        let alice = join(&mut state, &manager, "");
        let bob = join(&mut state, &manager, "");
        alloc(&mut state, &manager, alice, Level::Normal, 1);
        alloc(&mut state, &manager, alice, Level::Normal, 2);
        let kept = alloc(&mut state, &manager, bob, Level::Normal, 3);

        let msg = SurfaceRequest {
            window: 1,
            width: 16,
            height: 16,
        };
        state
            .handle_builtin(&manager, alice, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .unwrap();

        state.disconnect(&manager, alice);
        assert!(state.client(alice).is_none());
        let registry = state.layers().get(0).registry();
        let mut live = Vec::new();
        registry
            .walk_records(|idx, node| {
                live.push((idx, node.client));
                true
            })
            .unwrap();
        assert_eq!(live, vec![(kept, bob)]);
        assert!(state.surfaces().by_key.is_empty());
    }

    #[test]
    fn surface_requests_create_shared_pixels() {
        let mut state = state();
        let manager = manager();
        let client = join(&mut state, &manager, "");
        let msg = SurfaceRequest {
            window: 9,
            width: 32,
            height: 8,
        };
        let reply = state
            .handle_builtin(&manager, client, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .unwrap();
        let out: SurfaceReply = bytemuck::pod_read_unaligned(&reply.body);
        assert!(reply.fd.is_some());
        assert!(out.region_size > 32 * 8 * 4);

        // Window 0 is the wallpaper slot.
        let msg = SurfaceRequest {
            window: 0,
            width: 640,
            height: 480,
        };
        state
            .handle_builtin(&manager, client, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .unwrap();
        assert!(state.surfaces().wallpaper().is_some());

        let msg = SurfaceRequest {
            window: 9,
            width: 0,
            height: 8,
        };
        let err = state
            .handle_builtin(&manager, client, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .err()
            .unwrap();
        assert!(!err.drops_client());
    }

    #[test]
    fn handler_registration_band_is_enforced() {
        let mut dispatcher = Dispatcher::default();
        let handler = |_: &mut ServerState, _: i32, _: &[u8]| Ok(Reply::ok());
        assert!(dispatcher
            .register(MAX_SYS_REQUEST_ID, Box::new(handler))
            .is_err());
        assert!(dispatcher
            .register(MAX_REQUEST_ID + 1, Box::new(handler))
            .is_err());
        dispatcher
            .register(MAX_SYS_REQUEST_ID + 1, Box::new(handler))
            .unwrap();
        assert!(dispatcher
            .register(MAX_SYS_REQUEST_ID + 1, Box::new(handler))
            .is_err());

        let mut st = state();
        let client = st.accept_client();
        let reply = dispatcher
            .dispatch(&mut st, client, MAX_SYS_REQUEST_ID + 1, &[])
            .unwrap();
        assert_eq!(reply.code, ERR_OK);
    }

    #[test]
    fn popups_flow_over_the_wire() {
        let mut state = state();
        let manager = manager();
        let alice = join(&mut state, &manager, "");
        let bob = join(&mut state, &manager, "");

        let msg = AllocPopup {
            flags: strata_wire::FLAG_VISIBLE,
            rect: Rect::new(4, 4, 20, 20),
            window: 31,
        };
        let reply = state
            .handle_builtin(&manager, alice, REQ_ALLOC_POPUP, bytemuck::bytes_of(&msg))
            .unwrap();
        let lower: PopupAllocated = bytemuck::pod_read_unaligned(&reply.body);
        let msg = AllocPopup {
            flags: strata_wire::FLAG_VISIBLE,
            rect: Rect::new(8, 8, 24, 24),
            window: 32,
        };
        state
            .handle_builtin(&manager, alice, REQ_ALLOC_POPUP, bytemuck::bytes_of(&msg))
            .unwrap();
        let registry = state.layers().get(0).registry();
        assert_eq!(registry.popup_count().unwrap(), 2);

        // Another client cannot pop it.
        let msg = FreePopup { index: lower.index };
        let err = state
            .handle_builtin(&manager, bob, REQ_FREE_POPUP, bytemuck::bytes_of(&msg))
            .err()
            .unwrap();
        assert!(!err.drops_client());

        // Popping the lower popup takes the upper one with it.
        let reply = state
            .handle_builtin(&manager, alice, REQ_FREE_POPUP, bytemuck::bytes_of(&msg))
            .unwrap();
        assert_eq!(reply.code, ERR_OK);
        let registry = state.layers().get(0).registry();
        assert_eq!(registry.popup_count().unwrap(), 0);
    }

    #[test]
    fn disconnect_sweeps_popups_too() {
        let mut state = state();
        let manager = manager();
        let alice = join(&mut state, &manager, "");
        let msg = AllocPopup {
            flags: strata_wire::FLAG_VISIBLE,
            rect: Rect::new(0, 0, 10, 10),
            window: 5,
        };
        state
            .handle_builtin(&manager, alice, REQ_ALLOC_POPUP, bytemuck::bytes_of(&msg))
            .unwrap();

        state.disconnect(&manager, alice);
        let registry = state.layers().get(0).registry();
        assert_eq!(registry.popup_count().unwrap(), 0);
    }

    #[test]
    fn repeated_surface_requests_replace_the_mapping() {
        let mut state = state();
        let manager = manager();
        let client = join(&mut state, &manager, "");
        let msg = SurfaceRequest {
            window: 9,
            width: 16,
            height: 16,
        };
        state
            .handle_builtin(&manager, client, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .unwrap();
        let msg = SurfaceRequest {
            window: 9,
            width: 32,
            height: 32,
        };
        let reply = state
            .handle_builtin(&manager, client, REQ_SURFACE, bytemuck::bytes_of(&msg))
            .unwrap();
        assert_eq!(reply.code, ERR_OK);

        // One surface per (client, window); the new one won.
        assert_eq!(state.surfaces().by_key.len(), 1);
        let held = &state.surfaces().by_key[&(client, 9)];
        assert_eq!(held.width(), 32);
    }

    #[test]
    fn set_mask_rects_validates_the_count() {
        let mut state = state();
        let manager = manager();
        let client = join(&mut state, &manager, "");
        let idx = alloc(&mut state, &manager, client, Level::Normal, 1);

        let mut body = bytemuck::bytes_of(&SetMaskRects {
            index: idx,
            untrusted_count: 2,
        })
        .to_vec();
        body.extend_from_slice(bytemuck::bytes_of(&Rect::new(0, 0, 8, 8)));
        body.extend_from_slice(bytemuck::bytes_of(&Rect::new(8, 8, 16, 16)));
        let reply = state
            .handle_builtin(&manager, client, REQ_SET_MASK_RECTS, &body)
            .unwrap();
        assert_eq!(reply.code, ERR_OK);

        // A count that disagrees with the body length is a forgery.
        let mut body = bytemuck::bytes_of(&SetMaskRects {
            index: idx,
            untrusted_count: 5,
        })
        .to_vec();
        body.extend_from_slice(bytemuck::bytes_of(&Rect::new(0, 0, 8, 8)));
        let err = state
            .handle_builtin(&manager, client, REQ_SET_MASK_RECTS, &body)
            .err()
            .unwrap();
        assert!(err.drops_client());
    }
}
