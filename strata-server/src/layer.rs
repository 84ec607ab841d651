//! The layer table.
//!
//! A layer is one shared-memory registry plus the clients joined to it.
//! Exactly one layer is topmost and is the one the compositor draws.
//! The default layer exists from startup and can never be deleted.

use strata_registry::{Capacities, Registry};
use strata_shm::ShmObject;
use strata_wire::{Rect, LEN_LAYER_NAME, MAX_NR_LAYERS};

use crate::error::ServerError;

/// Name of the layer created at startup.
pub const DEFAULT_LAYER_NAME: &str = "default";

/// One layer: a named registry region and its member clients.
pub struct Layer {
    name: String,
    shm_name: String,
    shm: ShmObject,
    registry: Registry,
    clients: Vec<i32>,
}

impl Layer {
    fn create(name: &str, caps: &Capacities, desktop_rect: Rect) -> Result<Layer, ServerError> {
        let caps = caps.normalized();
        let size = caps.region_size();
        let shm_name = crate::unique_shm_name("layer");
        let shm = ShmObject::create(&shm_name, size)?;
        let registry =
            unsafe { Registry::create_at(shm.as_ptr(), size, &caps, desktop_rect) }?;
        log::info!("layer {:?} created ({} bytes at {})", name, size, shm_name);
        Ok(Layer {
            name: name.to_owned(),
            shm_name,
            shm,
            registry,
            clients: Vec::new(),
        })
    }

    /// The layer's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared-memory object name clients map the registry from.
    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    /// Size of the registry region in bytes.
    pub fn region_size(&self) -> usize {
        self.shm.len()
    }

    /// The layer's registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ids of the clients joined to this layer.
    pub fn clients(&self) -> &[i32] {
        &self.clients
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        // The region's lock dies with the registry; the mapping itself is
        // released by the ShmObject afterwards.
        unsafe { self.registry.destroy() };
    }
}

/// All layers, with the topmost selection.
pub struct LayerTable {
    layers: Vec<Layer>,
    topmost: usize,
    screen_rect: Rect,
}

impl LayerTable {
    /// A table holding only the default layer, which starts topmost.
    pub fn new(default_caps: &Capacities, screen_rect: Rect) -> Result<LayerTable, ServerError> {
        let default = Layer::create(DEFAULT_LAYER_NAME, default_caps, screen_rect)?;
        Ok(LayerTable {
            layers: vec![default],
            topmost: 0,
            screen_rect,
        })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false: the default layer exists from startup.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Index of the named layer.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    /// The layer at `index`.
    pub fn get(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    /// Index of the topmost layer.
    pub fn topmost(&self) -> usize {
        self.topmost
    }

    /// Joins `client` to the named layer, creating the layer with `caps`
    /// if it does not exist.  An empty name means the default layer.
    /// Returns the layer's index.
    pub fn join(
        &mut self,
        client: i32,
        name: &str,
        caps: &Capacities,
    ) -> Result<usize, ServerError> {
        if name.len() > LEN_LAYER_NAME {
            return Err(ServerError::Refused("layer name too long"));
        }
        let name = if name.is_empty() { DEFAULT_LAYER_NAME } else { name };
        let index = match self.find(name) {
            Some(index) => index,
            None => {
                if self.layers.len() >= MAX_NR_LAYERS {
                    return Err(ServerError::Refused("layer table is full"));
                }
                if !caps.normalized().is_valid() {
                    return Err(ServerError::Refused("bad layer capacities"));
                }
                self.layers.push(Layer::create(name, caps, self.screen_rect)?);
                self.layers.len() - 1
            }
        };
        self.layers[index].clients.push(client);
        Ok(index)
    }

    /// Removes `client` from the layer at `index`.
    pub fn leave(&mut self, client: i32, index: usize) {
        self.layers[index].clients.retain(|&c| c != client);
    }

    /// Makes the named layer topmost.  Returns whether the selection
    /// actually changed.
    pub fn set_topmost(&mut self, name: &str) -> Result<bool, ServerError> {
        let index = self
            .find(name)
            .ok_or(ServerError::Refused("no such layer"))?;
        if index == self.topmost {
            return Ok(false);
        }
        self.topmost = index;
        log::info!("layer {:?} is now topmost", name);
        Ok(true)
    }

    /// Makes the layer at `index` topmost.
    pub fn set_topmost_index(&mut self, index: usize) -> bool {
        if index == self.topmost {
            return false;
        }
        self.topmost = index;
        log::info!("layer {:?} is now topmost", self.layers[index].name);
        true
    }

    /// Deletes the named layer.  The default layer and layers with joined
    /// clients are refused.
    pub fn delete(&mut self, name: &str) -> Result<(), ServerError> {
        let index = self
            .find(name)
            .ok_or(ServerError::Refused("no such layer"))?;
        if index == 0 {
            return Err(ServerError::Refused("the default layer cannot be deleted"));
        }
        if !self.layers[index].clients.is_empty() {
            return Err(ServerError::Refused("layer still has clients"));
        }
        self.layers.remove(index);
        if self.topmost == index {
            self.topmost = 0;
        } else if self.topmost > index {
            self.topmost -= 1;
        }
        log::info!("layer {:?} deleted", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LayerTable {
        LayerTable::new(&Capacities::default(), Rect::new(0, 0, 640, 480)).unwrap()
    }

    #[test]
    fn join_creates_once_and_reuses() {
        let mut t = table();
        let a = t.join(1, "games", &Capacities::default()).unwrap();
        let b = t.join(2, "games", &Capacities::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a).clients(), &[1, 2]);

        // Empty name is the default layer.
        let d = t.join(3, "", &Capacities::default()).unwrap();
        assert_eq!(d, 0);
    }

    #[test]
    fn default_layer_is_undeletable() {
        let mut t = table();
        assert!(matches!(
            t.delete(DEFAULT_LAYER_NAME),
            Err(ServerError::Refused(_))
        ));
    }

    #[test]
    fn delete_requires_an_empty_layer() {
        let mut t = table();
        let idx = t.join(1, "games", &Capacities::default()).unwrap();
        assert!(t.delete("games").is_err());
        t.leave(1, idx);
        t.delete("games").unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn topmost_tracks_deletion() {
        let mut t = table();
        let idx = t.join(1, "lock", &Capacities::default()).unwrap();
        assert!(t.set_topmost("lock").unwrap());
        assert_eq!(t.topmost(), idx);
        t.leave(1, idx);
        t.delete("lock").unwrap();
        assert_eq!(t.topmost(), 0);
    }

    #[test]
    fn long_names_are_refused() {
        let mut t = table();
        assert!(t
            .join(1, "a-very-long-layer-name", &Capacities::default())
            .is_err());
    }
}
