//! Authoritative world model.
//!
//! All entities live in one id-keyed table owned by [`WorldModel`]. Ids are
//! allocated by a single monotonic counter; 0 is reserved for "no object /
//! no parent / not yet assigned". The world itself is modelled as a root
//! ridable object whose grid carries the region topology, so hosting is
//! uniform: every placed object sits in exactly one cell of exactly one
//! ridable grid, to arbitrary nesting depth.

use crate::nav::{cube_figure, Coord, Direction, NavInfo, ParallelTransporter, Rotation};
use crate::protocol::Message;
use log::{debug, warn};
use std::collections::HashMap;

/// Maximum number of level shifts (exit / board) a single navigation step
/// may perform before it is abandoned as a topology error.
pub const MAX_NAV_DEPTH: usize = 8;

pub const TYPE_PLAYER: u8 = 0;
pub const TYPE_ITEM: u8 = 1;
pub const TYPE_FACTORY: u8 = 2;
pub const TYPE_RIDABLE: u8 = 3;

/// Closed set of object kinds. Ridable objects carry their hosting grid
/// inline, so dispatch is an exhaustive match instead of a downcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Player,
    Item,
    Factory,
    Ridable(RidableGrid),
}

impl ObjectKind {
    pub fn type_id(&self) -> u8 {
        match self {
            ObjectKind::Player => TYPE_PLAYER,
            ObjectKind::Item => TYPE_ITEM,
            ObjectKind::Factory => TYPE_FACTORY,
            ObjectKind::Ridable(_) => TYPE_RIDABLE,
        }
    }

    /// Maps a wire type id to a kind. Ridable objects are created through
    /// AddRidableObject (which carries grid dimensions), never through here.
    pub fn from_type_id(type_id: u8) -> Option<ObjectKind> {
        match type_id {
            TYPE_PLAYER => Some(ObjectKind::Player),
            TYPE_ITEM => Some(ObjectKind::Item),
            TYPE_FACTORY => Some(ObjectKind::Factory),
            _ => None,
        }
    }
}

/// A ridable object's cell grid: an ordered `height x width` sequence of
/// child object ids, 0 meaning an empty slot. At most one cell holds the
/// owner's exit reference (content equal to the owner's parent id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RidableGrid {
    height: u8,
    width: u8,
    cells: Vec<u32>,
    transporter: ParallelTransporter,
}

impl RidableGrid {
    /// A flat toroidal grid. Rejects zero dimensions (network input is not
    /// trusted to be well-formed).
    pub fn new(height: u8, width: u8) -> Option<RidableGrid> {
        if height == 0 || width == 0 {
            return None;
        }
        Some(RidableGrid {
            height,
            width,
            cells: vec![0; height as usize * width as usize],
            transporter: ParallelTransporter::new(height as i32, width as i32),
        })
    }

    /// A grid with a pre-built topology (used for the region's folded
    /// figure). The transporter's dimensions must fit the wire's u8 fields.
    pub fn with_transporter(transporter: ParallelTransporter) -> Option<RidableGrid> {
        let height = u8::try_from(transporter.height()).ok()?;
        let width = u8::try_from(transporter.width()).ok()?;
        Some(RidableGrid {
            height,
            width,
            cells: vec![0; height as usize * width as usize],
            transporter,
        })
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn transporter(&self) -> &ParallelTransporter {
        &self.transporter
    }

    /// 2D to 1D index conversion. Out-of-range coordinates are rejected,
    /// never wrapped.
    fn index(&self, coord: Coord) -> Option<usize> {
        if !self.transporter.contains(coord) {
            return None;
        }
        Some(coord.y as usize * self.width as usize + coord.x as usize)
    }

    /// 1D to 2D conversion for wire-level slot indices.
    pub fn slot_coord(&self, slot: u8) -> Option<Coord> {
        if slot as usize >= self.cells.len() {
            return None;
        }
        Some(Coord::new(
            slot as i32 / self.width as i32,
            slot as i32 % self.width as i32,
        ))
    }

    pub fn cell(&self, coord: Coord) -> Option<u32> {
        self.index(coord).map(|i| self.cells[i])
    }

    /// Writes a cell; returns false for out-of-range coordinates.
    pub fn set_cell(&mut self, coord: Coord, content: u32) -> bool {
        match self.index(coord) {
            Some(i) => {
                self.cells[i] = content;
                true
            }
            None => false,
        }
    }

    /// Finds the cell holding `content`, if any.
    pub fn find(&self, content: u32) -> Option<Coord> {
        if content == 0 {
            return None;
        }
        self.cells.iter().position(|&c| c == content).map(|i| {
            Coord::new(i as i32 / self.width as i32, i as i32 % self.width as i32)
        })
    }

    pub fn first_empty(&self) -> Option<Coord> {
        self.cells.iter().position(|&c| c == 0).map(|i| {
            Coord::new(i as i32 / self.width as i32, i as i32 % self.width as i32)
        })
    }

    #[cfg(test)]
    pub fn occupied(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }
}

/// A world entity. `id` is immutable once assigned; `parent_id` names the
/// ridable object whose grid hosts this one (0 = unhosted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameObject {
    pub id: u32,
    pub mesh_id: u32,
    pub texture_id: u32,
    pub parent_id: u32,
    pub pos: Coord,
    pub facing: Direction,
    pub kind: ObjectKind,
}

impl GameObject {
    pub fn new(id: u32, kind: ObjectKind) -> GameObject {
        GameObject {
            id,
            mesh_id: 0,
            texture_id: 0,
            parent_id: 0,
            pos: Coord::new(0, 0),
            facing: Direction::Right,
            kind,
        }
    }

    pub fn is_ridable(&self) -> bool {
        matches!(self.kind, ObjectKind::Ridable(_))
    }

    pub fn grid(&self) -> Option<&RidableGrid> {
        match &self.kind {
            ObjectKind::Ridable(grid) => Some(grid),
            _ => None,
        }
    }

    pub fn grid_mut(&mut self) -> Option<&mut RidableGrid> {
        match &mut self.kind {
            ObjectKind::Ridable(grid) => Some(grid),
            _ => None,
        }
    }
}

/// Outcome of a successful navigation or boarding mutation, consumed by the
/// command layer to derive broadcast deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub object_id: u32,
    pub position: Coord,
    pub facing: Direction,
    /// Net rotation class applied across all seams and level shifts.
    pub rotation: Rotation,
    /// Set when the walker changed host.
    pub new_parent: Option<u32>,
}

/// The single source of truth for game state. Mutated only by validated
/// commands on the owning task; never shared across threads.
#[derive(Debug)]
pub struct WorldModel {
    objects: HashMap<u32, GameObject>,
    next_id: u32,
    root_id: u32,
}

impl WorldModel {
    /// An empty replica world, populated entirely from snapshot messages.
    pub fn empty() -> WorldModel {
        WorldModel {
            objects: HashMap::new(),
            next_id: 1,
            root_id: 0,
        }
    }

    /// A world whose region grid carries the given topology.
    pub fn with_region(transporter: ParallelTransporter) -> Option<WorldModel> {
        let grid = RidableGrid::with_transporter(transporter)?;
        let mut world = WorldModel::empty();
        let root_id = world.allocate_id();
        world
            .objects
            .insert(root_id, GameObject::new(root_id, ObjectKind::Ridable(grid)));
        world.root_id = root_id;
        Some(world)
    }

    /// A world folded as a cube surface with `size x size` faces.
    ///
    /// Panics when the figure's strip exceeds the u8 grid dimensions;
    /// callers range-check against [`crate::MAX_FIGURE_SIZE`] first.
    pub fn cube_world(size: i32) -> WorldModel {
        WorldModel::with_region(cube_figure(size)).expect("cube figure dimensions exceed grid limits")
    }

    pub fn root_id(&self) -> u32 {
        self.root_id
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&GameObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut GameObject> {
        self.objects.get_mut(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &GameObject> {
        self.objects.values()
    }

    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Inserts an object created from a network message, keeping the local
    /// id counter ahead of every remotely assigned id.
    pub fn insert(&mut self, object: GameObject) -> bool {
        if object.id == 0 {
            warn!("refusing to insert object with unassigned id");
            return false;
        }
        if self.objects.contains_key(&object.id) {
            warn!("object {} already exists, insert ignored", object.id);
            return false;
        }
        self.next_id = self.next_id.max(object.id + 1);
        self.objects.insert(object.id, object);
        true
    }

    /// Creates and places a player on the region grid, returning its id and
    /// spawn cell. Server-side convenience for the post-handshake spawn.
    pub fn spawn_player(&mut self, mesh_id: u32, texture_id: u32) -> Option<(u32, Coord)> {
        let root_id = self.root_id;
        let spawn = self.get(root_id)?.grid()?.first_empty()?;
        let id = self.allocate_id();
        let mut player = GameObject::new(id, ObjectKind::Player);
        player.mesh_id = mesh_id;
        player.texture_id = texture_id;
        player.parent_id = root_id;
        player.pos = spawn;
        self.objects.insert(id, player);
        self.get_mut(root_id)?.grid_mut()?.set_cell(spawn, id);
        Some((id, spawn))
    }

    /// Removes an object, clears its host cell, and re-homes any children
    /// into the freed slot (or the nearest empty cell) of the removed
    /// object's own host grid.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(removed) = self.objects.remove(&id) else {
            warn!("remove: object {} not found", id);
            return false;
        };

        // Free the cell the object occupied.
        if let Some(host) = self.objects.get_mut(&removed.parent_id) {
            if let Some(grid) = host.grid_mut() {
                if grid.cell(removed.pos) == Some(id) {
                    grid.set_cell(removed.pos, 0);
                }
            }
        }

        // Re-home children one level up.
        let children: Vec<u32> = self
            .objects
            .values()
            .filter(|o| o.parent_id == id)
            .map(|o| o.id)
            .collect();
        for child_id in children {
            let slot = self.objects.get_mut(&removed.parent_id).and_then(|host| {
                let grid = host.grid_mut()?;
                let slot = if grid.cell(removed.pos) == Some(0) {
                    removed.pos
                } else {
                    grid.first_empty()?
                };
                grid.set_cell(slot, child_id);
                Some(slot)
            });
            if let Some(child) = self.objects.get_mut(&child_id) {
                match slot {
                    Some(coord) => {
                        child.parent_id = removed.parent_id;
                        child.pos = coord;
                    }
                    None => {
                        warn!("no slot for orphan {}, leaving it unhosted", child_id);
                        child.parent_id = 0;
                    }
                }
            }
        }

        true
    }

    /// Applies an authoritative position update, moving the object's grid
    /// cell along with it.
    pub fn update_position(&mut self, id: u32, coord: Coord) -> bool {
        let Some((parent_id, old_pos)) = self.objects.get(&id).map(|o| (o.parent_id, o.pos)) else {
            warn!("update_position: object {} not found", id);
            return false;
        };

        if parent_id != 0 {
            let Some(grid) = self.objects.get_mut(&parent_id).and_then(|h| h.grid_mut()) else {
                warn!("update_position: host {} of object {} has no grid", parent_id, id);
                return false;
            };
            match grid.cell(coord) {
                None => {
                    warn!("update_position: {:?} out of range for object {}", coord, id);
                    return false;
                }
                Some(content) if content != 0 && content != id => {
                    warn!("update_position: cell {:?} already holds {}", coord, content);
                    return false;
                }
                _ => {}
            }
            if grid.cell(old_pos) == Some(id) {
                grid.set_cell(old_pos, 0);
            }
            grid.set_cell(coord, id);
        }

        if let Some(object) = self.objects.get_mut(&id) {
            object.pos = coord;
        }
        true
    }

    /// Re-parents an object: detaches it from its old host grid, rewrites
    /// its own exit reference if it is ridable, and attaches it to the new
    /// host at its current coordinate (or the first empty slot).
    pub fn set_parent(&mut self, id: u32, new_parent: u32) -> bool {
        let Some((old_parent, pos, is_ridable)) = self
            .objects
            .get(&id)
            .map(|o| (o.parent_id, o.pos, o.is_ridable()))
        else {
            warn!("set_parent: object {} not found", id);
            return false;
        };
        if new_parent == id {
            warn!("set_parent: object {} cannot host itself", id);
            return false;
        }

        if is_ridable && !self.set_parent_and_exit(id, new_parent) {
            // Exit bookkeeping failed; the object keeps its old parent.
            return false;
        }

        // Detach from the old host.
        if let Some(grid) = self.objects.get_mut(&old_parent).and_then(|h| h.grid_mut()) {
            if grid.cell(pos) == Some(id) {
                grid.set_cell(pos, 0);
            }
        }

        let mut attached_at = pos;
        if new_parent != 0 {
            let Some(grid) = self.objects.get_mut(&new_parent).and_then(|h| h.grid_mut()) else {
                warn!("set_parent: new parent {} has no grid", new_parent);
                return false;
            };
            let slot = match grid.cell(pos) {
                Some(0) => Some(pos),
                _ => grid.first_empty(),
            };
            match slot {
                Some(coord) => {
                    grid.set_cell(coord, id);
                    attached_at = coord;
                }
                None => {
                    warn!("set_parent: grid of {} is full, {} left unplaced", new_parent, id);
                }
            }
        }

        if let Some(object) = self.objects.get_mut(&id) {
            object.parent_id = new_parent;
            object.pos = attached_at;
        }
        true
    }

    /// Rewrites the exit reference inside a ridable object's own grid when
    /// its parent changes. The old exit slot is found and overwritten with
    /// the new parent id; if no old slot exists the object is treated as
    /// having had no parent and a fresh slot is claimed.
    ///
    /// On success exactly one cell holds `new_parent` and none holds the
    /// previous parent id.
    pub fn set_parent_and_exit(&mut self, id: u32, new_parent: u32) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            warn!("set_parent_and_exit: object {} not found", id);
            return false;
        };
        let old_parent = object.parent_id;
        let Some(grid) = object.grid_mut() else {
            warn!("set_parent_and_exit: object {} is not ridable", id);
            return false;
        };

        if let Some(slot) = grid.find(old_parent) {
            grid.set_cell(slot, new_parent);
            return true;
        }
        if new_parent == 0 {
            return true;
        }
        match grid.first_empty() {
            Some(slot) => {
                grid.set_cell(slot, new_parent);
                true
            }
            None => {
                warn!("set_parent_and_exit: grid of {} is full", id);
                false
            }
        }
    }

    /// PlayerInput entry point: one navigation step for a player.
    pub fn take_action(&mut self, player_id: u32, direction: Direction) -> Option<MoveOutcome> {
        self.walk(player_id, direction)
    }

    /// One navigation step for any hosted walker.
    ///
    /// An empty destination cell is a plain move. The host's exit cell
    /// re-homes the walker one level up, continuing from the host's own
    /// coordinate. A ridable occupant is boarded by continuing the step
    /// inside its grid from its exit slot. Any other occupant blocks the
    /// step. Level shifts are bounded by [`MAX_NAV_DEPTH`]; there is no
    /// unbounded recursion.
    pub fn walk(&mut self, walker_id: u32, moving: Direction) -> Option<MoveOutcome> {
        let Some(walker) = self.objects.get(&walker_id) else {
            warn!("walk: walker {} not found", walker_id);
            return None;
        };
        if walker.parent_id == 0 {
            warn!("walk: object {} is not hosted by any grid", walker_id);
            return None;
        }

        let old_host = walker.parent_id;
        let old_pos = walker.pos;
        let mut host_id = walker.parent_id;
        let mut pos = walker.pos;
        let mut facing = walker.facing;
        let mut moving = moving;
        let mut total_rotation = Rotation::Straight;

        for _ in 0..MAX_NAV_DEPTH {
            let Some(host) = self.objects.get(&host_id) else {
                warn!("walk: host {} vanished", host_id);
                return None;
            };
            let host_parent = host.parent_id;
            let host_pos = host.pos;
            let Some(grid) = host.grid() else {
                warn!("walk: host {} has no grid", host_id);
                return None;
            };

            let Some(NavInfo {
                position: dest,
                facing: new_facing,
                rotation,
            }) = grid.transporter().move_from(pos, moving, facing)
            else {
                warn!("walk: {:?} out of range in grid of {}", pos, host_id);
                return None;
            };
            let content = grid.cell(dest).unwrap_or(0);

            if content == 0 || content == walker_id {
                let total = total_rotation.then(rotation);
                return self.commit_move(walker_id, old_host, old_pos, host_id, dest, new_facing, total);
            }

            if host_parent != 0 && content == host_parent {
                // Designated exit: continue one level up from the host's
                // own cell.
                moving = rotation.apply(moving);
                facing = new_facing;
                total_rotation = total_rotation.then(rotation);
                pos = host_pos;
                host_id = host_parent;
                continue;
            }

            let occupant_entry = self
                .objects
                .get(&content)
                .filter(|o| o.is_ridable())
                .and_then(|o| o.grid()?.find(o.parent_id));
            match occupant_entry {
                Some(entry) => {
                    // Board the vehicle: continue inside its grid from the
                    // exit slot.
                    moving = rotation.apply(moving);
                    facing = new_facing;
                    total_rotation = total_rotation.then(rotation);
                    pos = entry;
                    host_id = content;
                }
                None => {
                    debug!("walk: {} blocked by occupant {} at {:?}", walker_id, content, dest);
                    return None;
                }
            }
        }

        warn!("walk: navigation depth exceeded for {}", walker_id);
        None
    }

    /// Explicit boarding at a linear slot index of a vehicle's grid.
    pub fn ride_on(&mut self, vehicle_id: u32, rider_id: u32, ride_at: u8) -> Option<MoveOutcome> {
        if vehicle_id == rider_id {
            warn!("ride_on: object {} cannot ride itself", rider_id);
            return None;
        }
        let Some((old_host, old_pos, facing)) = self
            .objects
            .get(&rider_id)
            .map(|o| (o.parent_id, o.pos, o.facing))
        else {
            warn!("ride_on: rider {} not found", rider_id);
            return None;
        };
        let Some(grid) = self.objects.get(&vehicle_id).and_then(|v| v.grid()) else {
            warn!("ride_on: vehicle {} not found or not ridable", vehicle_id);
            return None;
        };
        let Some(slot) = grid.slot_coord(ride_at) else {
            warn!("ride_on: slot {} out of range for vehicle {}", ride_at, vehicle_id);
            return None;
        };
        if grid.cell(slot) != Some(0) {
            debug!("ride_on: slot {} of vehicle {} is occupied", ride_at, vehicle_id);
            return None;
        }

        self.commit_move(rider_id, old_host, old_pos, vehicle_id, slot, facing, Rotation::Straight)
    }

    fn commit_move(
        &mut self,
        walker_id: u32,
        old_host: u32,
        old_pos: Coord,
        new_host: u32,
        dest: Coord,
        facing: Direction,
        rotation: Rotation,
    ) -> Option<MoveOutcome> {
        if let Some(grid) = self.objects.get_mut(&old_host).and_then(|h| h.grid_mut()) {
            if grid.cell(old_pos) == Some(walker_id) {
                grid.set_cell(old_pos, 0);
            }
        }
        if let Some(grid) = self.objects.get_mut(&new_host).and_then(|h| h.grid_mut()) {
            grid.set_cell(dest, walker_id);
        }

        let walker = self.objects.get_mut(&walker_id)?;
        let new_parent = (walker.parent_id != new_host).then_some(new_host);
        walker.parent_id = new_host;
        walker.pos = dest;
        walker.facing = facing;

        Some(MoveOutcome {
            object_id: walker_id,
            position: dest,
            facing,
            rotation,
            new_parent,
        })
    }

    /// Serializes the world as a replayable message sequence: all objects
    /// are added first (id order), then positioned and parented, so a
    /// replica applying the stream through the normal command path
    /// reconstructs the state no matter how hosts and occupants interleave
    /// in id space.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut ids: Vec<u32> = self.objects.keys().copied().collect();
        ids.sort_unstable();

        let mut messages = Vec::with_capacity(ids.len() * 3);
        for &id in &ids {
            let object = &self.objects[&id];
            match object.grid() {
                Some(grid) => messages.push(Message::AddRidableObject {
                    obj_id: id,
                    mesh_id: object.mesh_id,
                    texture_id: object.texture_id,
                    grid_height: grid.height(),
                    grid_width: grid.width(),
                }),
                None => messages.push(Message::AddGameObject {
                    type_id: object.kind.type_id(),
                    obj_id: id,
                }),
            }
        }
        for &id in &ids {
            let object = &self.objects[&id];
            messages.push(Message::GameObjectPosition {
                y: object.pos.y,
                x: object.pos.x,
                obj_id: id,
            });
            if object.parent_id != 0 {
                messages.push(Message::GameObjectParentObject {
                    parent_id: object.parent_id,
                    obj_id: id,
                });
            }
        }
        messages
    }
}
