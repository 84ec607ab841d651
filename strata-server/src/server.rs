//! The socket loop: accept, service, compose.
//!
//! One thread owns every connection.  A poll sweep wakes on the
//! listening socket and on every client channel; each readable client is
//! serviced once, then one compositing cycle runs against the topmost
//! layer.  Banded composition inside a cycle is the only concurrency.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use strata_channel::{Channel, Listener};
use strata_compositor::{
    load_plugin, CompositorManager, DamageTracker, FallbackCompositor, FrameBuffer,
};
use strata_tasks::TaskPool;
use strata_wire::{MAX_SYS_REQUEST_ID, TIMEOUT_TICK_MS};

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Handler, ServerState};
use crate::error::ServerError;

/// The window server.
pub struct Server {
    state: ServerState,
    dispatcher: Dispatcher,
    manager: CompositorManager,
    tracker: DamageTracker,
    listener: Listener,
    connections: HashMap<i32, Channel>,
    frame: Arc<FrameBuffer>,
}

impl Server {
    /// Binds the listening socket and stands the default layer and the
    /// fallback compositor up.
    pub fn new(config: ServerConfig) -> Result<Server, ServerError> {
        let state = ServerState::new(&config)?;
        let frame = Arc::new(FrameBuffer::new(
            config.screen_rect.width() as u32,
            config.screen_rect.height() as u32,
        ));
        let pool = (config.compose_workers > 0)
            .then(|| Arc::new(TaskPool::new(config.compose_workers)));
        let fallback = FallbackCompositor::new(Arc::clone(&frame), pool);
        let manager = CompositorManager::new(Box::new(fallback));
        let listener = Listener::bind(&config.socket_path)?;
        log::info!(
            "listening on {} ({}x{} screen)",
            config.socket_path.display(),
            config.screen_rect.width(),
            config.screen_rect.height()
        );
        Ok(Server {
            state,
            dispatcher: Dispatcher::default(),
            manager,
            tracker: DamageTracker::new(),
            listener,
            connections: HashMap::new(),
            frame,
        })
    }

    /// The frame the active compositor draws into.
    pub fn frame(&self) -> &Arc<FrameBuffer> {
        &self.frame
    }

    /// The server state, for inspection.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// The compositor table.
    pub fn manager(&self) -> &CompositorManager {
        &self.manager
    }

    /// Registers an application request handler.
    pub fn register_handler(&mut self, id: u32, handler: Handler) -> Result<(), ServerError> {
        self.dispatcher.register(id, handler)
    }

    /// Loads and selects a compositor plugin.  Any failure logs and keeps
    /// the current selection; a missing or incompatible plugin is never
    /// fatal.
    pub fn use_plugin(&self, path: &str, name: &str) {
        let plugin = match load_plugin(path, name) {
            Ok(plugin) => plugin,
            Err(err) => {
                log::warn!("plugin {:?} unusable, staying on fallback: {}", name, err);
                return;
            }
        };
        if let Err(err) = self.manager.register(name, Box::new(plugin)) {
            log::warn!("plugin {:?} not registered: {}", name, err);
            return;
        }
        if let Err(err) = self.state.select_compositor(&self.manager, name) {
            log::warn!("plugin {:?} not selected: {}", name, err);
        }
    }

    /// Serves forever.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.poll_once(0)?;
        }
    }

    /// One poll sweep: accept pending connections, service readable
    /// clients, run a compositing cycle.  `timeout_ticks` of 0 blocks
    /// until something happens.  Returns the number of clients serviced.
    pub fn poll_once(&mut self, timeout_ticks: u32) -> Result<usize, ServerError> {
        let ids: Vec<i32> = self.connections.keys().copied().collect();
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(ids.len() + 1);
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for id in &ids {
            fds.push(libc::pollfd {
                fd: self.connections[id].as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout_ms = if timeout_ticks == 0 {
            -1
        } else {
            (timeout_ticks * TIMEOUT_TICK_MS) as i32
        };
        let rc = loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc >= 0 {
                break rc;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(ServerError::Channel(err.into()));
            }
        };
        if rc == 0 {
            return Ok(0);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match self.listener.accept() {
                Ok(channel) => {
                    let id = self.state.accept_client();
                    self.connections.insert(id, channel);
                }
                Err(err) => log::warn!("accept failed: {}", err),
            }
        }

        let mut serviced = 0;
        for (slot, id) in ids.iter().enumerate() {
            let revents = fds[slot + 1].revents;
            if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                self.drop_connection(*id);
                continue;
            }
            if revents & libc::POLLIN != 0 {
                self.service(*id);
                serviced += 1;
            }
        }

        self.compose();
        Ok(serviced)
    }

    /// Reads and answers one request from `id`.
    fn service(&mut self, id: i32) {
        if self.service_inner(id) {
            self.drop_connection(id);
        }
    }

    /// Returns whether the client must be dropped.
    fn service_inner(&mut self, id: i32) -> bool {
        let Some(channel) = self.connections.get(&id) else {
            return false;
        };
        let frame = match channel.recv_request(1) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("client {} read failed: {}", id, err);
                return true;
            }
        };
        let result = if frame.word0 <= MAX_SYS_REQUEST_ID {
            self.state
                .handle_builtin(&self.manager, id, frame.word0, &frame.body)
        } else {
            self.dispatcher
                .dispatch(&mut self.state, id, frame.word0, &frame.body)
        };
        match result {
            Ok(reply) => channel.send_reply(reply.code, &reply.body, reply.fd).is_err(),
            Err(err) if err.drops_client() => {
                log::warn!("dropping client {}: {}", id, err);
                true
            }
            Err(err) => {
                log::debug!("client {} request refused: {}", id, err);
                channel.send_reply(err.wire_code(), &[], None).is_err()
            }
        }
    }

    fn drop_connection(&mut self, id: i32) {
        self.connections.remove(&id);
        self.state.disconnect(&self.manager, id);
    }

    /// Runs one compositing cycle against the topmost layer.
    fn compose(&mut self) {
        let ctx = self.state.topmost_context();
        let tracker = &mut self.tracker;
        let composed = self
            .manager
            .with_active(|ops| tracker.run_cycle(&ctx, ops));
        if let Err(err) = composed {
            log::warn!("compositing cycle failed: {}", err);
        }
    }
}
