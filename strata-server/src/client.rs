//! Per-client session state.

/// Lifecycle of a client session.
///
/// `Active` means one of the client's records holds the input focus in
/// its layer; `Inactive` is a joined client without focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Connected, join not yet seen.
    Connecting,
    /// Joined a layer, no record focused yet.
    Joined,
    /// Holds the focused record of its layer.
    Active,
    /// Joined, focus elsewhere.
    Inactive,
    /// Being torn down.
    Disconnected,
}

/// One client session, transport excluded.
pub struct ClientRecord {
    /// Server-assigned id; also the `client` field of its registry
    /// records.  Never 0, which marks server-owned records.
    pub id: i32,
    /// Self-reported name, for diagnostics.
    pub name: String,
    /// Lifecycle phase.
    pub phase: ClientPhase,
    /// Index into the layer table once joined.
    pub layer: Option<usize>,
}

impl ClientRecord {
    /// A freshly accepted client.
    pub fn new(id: i32) -> ClientRecord {
        ClientRecord {
            id,
            name: String::new(),
            phase: ClientPhase::Connecting,
            layer: None,
        }
    }

    /// Whether the session has joined a layer and is still live.
    pub fn is_joined(&self) -> bool {
        matches!(
            self.phase,
            ClientPhase::Joined | ClientPhase::Active | ClientPhase::Inactive
        )
    }

    /// Marks the join transition.
    pub fn joined(&mut self, name: String, layer: usize) {
        debug_assert_eq!(self.phase, ClientPhase::Connecting);
        self.name = name;
        self.layer = Some(layer);
        self.phase = ClientPhase::Joined;
        log::debug!("client {} ({:?}) joined layer {}", self.id, self.name, layer);
    }

    /// One of the client's records took the focus.
    pub fn activated(&mut self) {
        if self.is_joined() {
            self.phase = ClientPhase::Active;
        }
    }

    /// The client's focused record lost the focus.
    pub fn deactivated(&mut self) {
        if self.phase == ClientPhase::Active {
            self.phase = ClientPhase::Inactive;
        }
    }

    /// Begins teardown.
    pub fn disconnected(&mut self) {
        self.phase = ClientPhase::Disconnected;
    }
}
