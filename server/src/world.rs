use log::info;
use overworld_shared::TileMap;
use tokio::sync::RwLock;

/// Shared world configuration.
///
/// Locked independently of the session registry. Reads vastly outnumber
/// writes, and writes always replace the whole map.
pub struct World {
    map: RwLock<TileMap>,
}

impl World {
    pub fn new(map: TileMap) -> Self {
        Self {
            map: RwLock::new(map),
        }
    }

    pub async fn current(&self) -> TileMap {
        self.map.read().await.clone()
    }

    /// Swaps in a new map and returns the previous one.
    pub async fn replace(&self, map: TileMap) -> TileMap {
        let mut current = self.map.write().await;
        info!(
            "Replacing {}x{} tile map with {}x{}",
            current.width(),
            current.height(),
            map.width(),
            map.height()
        );
        std::mem::replace(&mut *current, map)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(TileMap::default())
    }
}
