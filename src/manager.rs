//! Room registry
//!
//! [`RoomManager`] owns every room. Rooms hold a weak reference back to the
//! registry so that a closing room can deregister itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::AppError;
use crate::room::Room;
use crate::types::RoomId;

/// Default capacity of a room's inbound command queue
pub const DEFAULT_ROOM_QUEUE: usize = 64;

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<RoomId, Arc<Room>>,
    closed: bool,
}

/// Shared registry state behind a [`RoomManager`]
#[derive(Debug)]
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    room_queue: usize,
}

impl Registry {
    /// Drop `id` from the map; unknown ids are ignored
    pub(crate) fn remove(&self, id: RoomId) {
        if self.state.lock().rooms.remove(&id).is_some() {
            debug!("Room {} removed from manager", id);
        }
    }
}

/// Registry of rooms by id
///
/// Cheap to clone; all clones share the same rooms.
#[derive(Debug, Clone)]
pub struct RoomManager {
    registry: Arc<Registry>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_ROOM_QUEUE)
    }

    /// Manager whose rooms buffer up to `room_queue` pending commands
    pub fn with_queue_size(room_queue: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                state: Mutex::new(RegistryState::default()),
                room_queue: room_queue.max(1),
            }),
        }
    }

    /// Create a room and start its consumer
    pub fn create_room(&self, name: &str) -> Result<RoomId, AppError> {
        let mut state = self.registry.state.lock();
        if state.closed {
            return Err(AppError::RoomManagerClosed);
        }

        let room = Room::spawn(name, self.registry.room_queue, Arc::downgrade(&self.registry));
        let id = room.id();
        state.rooms.insert(id, room);
        info!("Room {} ({}) created", name, id);

        Ok(id)
    }

    pub fn get_room(&self, id: RoomId) -> Option<Arc<Room>> {
        self.registry.state.lock().rooms.get(&id).cloned()
    }

    /// Deregister a room without closing it
    pub fn remove_room(&self, id: RoomId) {
        self.registry.remove(id);
    }

    /// Close the manager and every room it holds; later calls are no-ops
    pub fn close(&self) {
        let rooms: Vec<_> = {
            let mut state = self.registry.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.rooms.values().cloned().collect()
        };

        info!("Closing room manager ({} rooms)", rooms.len());
        for room in rooms {
            room.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.state.lock().closed
    }

    pub fn room_count(&self) -> usize {
        self.registry.state.lock().rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
