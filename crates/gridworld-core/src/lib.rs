//! Core grid, entity, and tick machinery shared across the gridworld workspace.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

new_key_type! {
    /// Stable handle for grid entities backed by a generational slot map.
    pub struct EntityId;
}

/// Convenience alias for associating side data with entities.
pub type EntityMap<T> = SecondaryMap<EntityId, T>;

/// Byte length of the co-processor input frame for one agent decision.
pub const COPROC_INPUT_LEN: usize = 9;
/// Byte length of the co-processor output frame for one agent decision.
pub const COPROC_OUTPUT_LEN: usize = 1;

/// 8-way compass heading used by mobile agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    East,
    NorthEast,
    North,
    NorthWest,
    West,
    SouthWest,
    South,
    SouthEast,
}

impl Direction {
    /// Every heading in enum order; also the neighbor order of wire frames.
    pub const ALL: [Self; 8] = [
        Self::East,
        Self::NorthEast,
        Self::North,
        Self::NorthWest,
        Self::West,
        Self::SouthWest,
        Self::South,
        Self::SouthEast,
    ];

    /// Rotate one step clockwise.
    #[must_use]
    pub const fn rotate_cw(self) -> Self {
        match self {
            Self::East => Self::SouthEast,
            Self::SouthEast => Self::South,
            Self::South => Self::SouthWest,
            Self::SouthWest => Self::West,
            Self::West => Self::NorthWest,
            Self::NorthWest => Self::North,
            Self::North => Self::NorthEast,
            Self::NorthEast => Self::East,
        }
    }

    /// Rotate one step counter-clockwise.
    #[must_use]
    pub const fn rotate_ccw(self) -> Self {
        match self {
            Self::East => Self::NorthEast,
            Self::NorthEast => Self::North,
            Self::North => Self::NorthWest,
            Self::NorthWest => Self::West,
            Self::West => Self::SouthWest,
            Self::SouthWest => Self::South,
            Self::South => Self::SouthEast,
            Self::SouthEast => Self::East,
        }
    }

    /// Rotate one step in `rotation`'s sense.
    #[must_use]
    pub const fn rotated(self, rotation: Rotation) -> Self {
        match rotation {
            Rotation::Clockwise => self.rotate_cw(),
            Rotation::CounterClockwise => self.rotate_ccw(),
        }
    }

    /// Column/row delta of the adjacent cell (north is decreasing `y`).
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::East => (1, 0),
            Self::NorthEast => (1, -1),
            Self::North => (0, -1),
            Self::NorthWest => (-1, -1),
            Self::West => (-1, 0),
            Self::SouthWest => (-1, 1),
            Self::South => (0, 1),
            Self::SouthEast => (1, 1),
        }
    }

    /// Position of this heading within [`Direction::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`Direction::index`], used when decoding wire frames.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::East),
            1 => Some(Self::NorthEast),
            2 => Some(Self::North),
            3 => Some(Self::NorthWest),
            4 => Some(Self::West),
            5 => Some(Self::SouthWest),
            6 => Some(Self::South),
            7 => Some(Self::SouthEast),
            _ => None,
        }
    }
}

/// Rotational sense for in-place turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

/// Closed set of grid occupant categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    MobileAgent,
    Barrier,
    Resource,
    SoilBlock,
    SignalMarker,
    Conduit,
    Rock,
}

impl EntityKind {
    /// Number of entity kinds (one cell slot each).
    pub const COUNT: usize = 7;

    /// Every kind in cell-slot order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::MobileAgent,
        Self::Barrier,
        Self::Resource,
        Self::SoilBlock,
        Self::SignalMarker,
        Self::Conduit,
        Self::Rock,
    ];

    /// Slot index of this kind within a cell.
    #[must_use]
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Whether an occupant of this kind blocks agents from entering its cell.
    #[must_use]
    pub const fn blocks_entry(self) -> bool {
        matches!(
            self,
            Self::MobileAgent | Self::Barrier | Self::SoilBlock | Self::Rock
        )
    }
}

/// Grid coordinate (`x` = column, `y` = row).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CellPos {
    pub x: u32,
    pub y: u32,
}

impl CellPos {
    /// Construct a new coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Coordinate of the adjacent cell in `direction`, unless it underflows.
    ///
    /// Bounds against a concrete grid extent are the [`Grid`]'s concern.
    #[must_use]
    pub fn offset_by(self, direction: Direction) -> Option<Self> {
        let (dx, dy) = direction.offset();
        let x = self.x.checked_add_signed(dx)?;
        let y = self.y.checked_add_signed(dy)?;
        Some(Self { x, y })
    }
}

/// Scalar fields carried by every grid entity.
///
/// `heading` is meaningful for mobile agents and defaults to east elsewhere;
/// `energy`/`max_energy` drive resource and signal-marker behavior.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityData {
    pub position: CellPos,
    pub heading: Direction,
    pub energy: u32,
    pub max_energy: u32,
    pub age: u64,
}

impl EntityData {
    /// Entity at `position` with default heading and no energy budget.
    #[must_use]
    pub const fn at(position: CellPos) -> Self {
        Self {
            position,
            heading: Direction::East,
            energy: 0,
            max_energy: 0,
            age: 0,
        }
    }

    /// Agent-style entity with an explicit heading.
    #[must_use]
    pub const fn facing(position: CellPos, heading: Direction) -> Self {
        Self {
            position,
            heading,
            energy: 0,
            max_energy: 0,
            age: 0,
        }
    }

    /// Same entity with an energy budget attached.
    #[must_use]
    pub const fn with_energy(mut self, energy: u32, max_energy: u32) -> Self {
        self.energy = energy;
        self.max_energy = max_energy;
        self
    }
}

/// One grid slot: at most one occupant handle per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cell {
    slots: [Option<EntityId>; EntityKind::COUNT],
}

impl Cell {
    /// Occupant handle for `kind`, if any.
    #[must_use]
    pub const fn occupant(&self, kind: EntityKind) -> Option<EntityId> {
        self.slots[kind.slot()]
    }

    /// True when no kind occupies this cell.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// True iff a mobile agent may enter: no barrier, soil block, rock, or
    /// other agent present. Resources, signal markers, and conduits never
    /// block entry.
    #[must_use]
    pub fn can_occupy(&self) -> bool {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| kind.blocks_entry())
            .all(|kind| self.slots[kind.slot()].is_none())
    }

    fn set_occupant(&mut self, kind: EntityKind, id: Option<EntityId>) {
        self.slots[kind.slot()] = id;
    }
}

/// Errors raised by world construction, mutation, and snapshot restore.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An entity's recorded position lies outside the grid extent.
    #[error("{kind:?} position ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        kind: EntityKind,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// A second entity of one kind was mapped onto an occupied cell slot.
    #[error("{kind:?} slot at ({x}, {y}) is already occupied")]
    SlotOccupied { kind: EntityKind, x: u32, y: u32 },
    /// Snapshot container carried the wrong magic or version.
    #[error("unsupported snapshot container: {0}")]
    UnsupportedSnapshot(&'static str),
    /// Snapshot body failed to decode.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(#[from] postcard::Error),
}

/// Upper bound on `width * height` for one grid. Extents are checked against
/// it before the cell array is allocated, so snapshot-borne dimensions cannot
/// trigger an oversized allocation.
pub const MAX_GRID_CELLS: u64 = 1 << 24;

/// 2D cell index over the world extent, one [`Cell`] per coordinate.
///
/// Backed by a single contiguous row-major allocation indexed `y * width + x`.
/// The grid never owns entities; its slots hold generational handles into the
/// [`EntityStore`], which stays authoritative for positions.
#[derive(Debug, Clone)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Cell>,
}

impl Grid {
    /// Construct an empty grid covering `width * height` cells.
    ///
    /// Rejects zero extents and extents above [`MAX_GRID_CELLS`].
    pub fn new(width: u32, height: u32) -> Result<Self, WorldError> {
        if width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if u64::from(width) * u64::from(height) > MAX_GRID_CELLS {
            return Err(WorldError::InvalidConfig(
                "grid dimensions exceed the cell limit",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![Cell::default(); (width as usize) * (height as usize)],
        })
    }

    /// Grid width in cells (columns).
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in cells (rows).
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// True when `pos` lies inside the grid extent.
    #[must_use]
    pub const fn in_bounds(&self, pos: CellPos) -> bool {
        pos.x < self.width && pos.y < self.height
    }

    #[inline]
    fn index_of(&self, pos: CellPos) -> usize {
        (pos.y as usize) * (self.width as usize) + (pos.x as usize)
    }

    /// Immutable access to the cell at `pos`.
    #[must_use]
    pub fn cell_at(&self, pos: CellPos) -> Option<&Cell> {
        if self.in_bounds(pos) {
            Some(&self.cells[self.index_of(pos)])
        } else {
            None
        }
    }

    /// Coordinate of the neighboring cell in `direction`, if it exists.
    ///
    /// The grid is not toroidal: edges have no wrap-around neighbors.
    #[must_use]
    pub fn neighbor(&self, pos: CellPos, direction: Direction) -> Option<CellPos> {
        pos.offset_by(direction).filter(|next| self.in_bounds(*next))
    }

    /// True when the neighboring cell in `direction` exists.
    #[must_use]
    pub fn has_neighbor(&self, pos: CellPos, direction: Direction) -> bool {
        self.neighbor(pos, direction).is_some()
    }

    /// Iterate `(position, cell)` pairs in row-major order.
    pub fn iter_cells(&self) -> impl Iterator<Item = (CellPos, &Cell)> + '_ {
        self.cells.iter().enumerate().map(|(idx, cell)| {
            let x = (idx % self.width as usize) as u32;
            let y = (idx / self.width as usize) as u32;
            (CellPos::new(x, y), cell)
        })
    }

    /// Iterate the boundary-ring coordinates (top and bottom rows, then the
    /// remaining side columns).
    pub fn boundary_ring(&self) -> impl Iterator<Item = CellPos> {
        let width = self.width;
        let height = self.height;
        let top = (0..width).map(move |x| CellPos::new(x, 0));
        let bottom = (0..width)
            .filter(move |_| height > 1)
            .map(move |x| CellPos::new(x, height - 1));
        let left = (1..height.saturating_sub(1)).map(move |y| CellPos::new(0, y));
        let right = (1..height.saturating_sub(1))
            .filter(move |_| width > 1)
            .map(move |y| CellPos::new(width - 1, y));
        top.chain(bottom).chain(left).chain(right)
    }

    /// Ensure `pos` is inside the grid and the `kind` slot there is free.
    pub fn ensure_open(&self, kind: EntityKind, pos: CellPos) -> Result<(), WorldError> {
        let Some(cell) = self.cell_at(pos) else {
            return Err(WorldError::OutOfBounds {
                kind,
                x: pos.x,
                y: pos.y,
                width: self.width,
                height: self.height,
            });
        };
        if cell.occupant(kind).is_some() {
            return Err(WorldError::SlotOccupied {
                kind,
                x: pos.x,
                y: pos.y,
            });
        }
        Ok(())
    }

    /// Clear every slot of every cell.
    pub fn clear(&mut self) {
        self.cells.fill(Cell::default());
    }

    /// Rebuild every cell slot from the authoritative entity store.
    ///
    /// The grid is cleared first; an entity recorded outside the extent or
    /// doubling up on a kind slot aborts the rebuild with the offender named.
    /// Callers that must stay consistent on failure rebuild into a fresh grid
    /// and swap it in only on success.
    pub fn rebuild(&mut self, store: &EntityStore) -> Result<(), WorldError> {
        self.clear();
        for kind in EntityKind::ALL {
            for (id, data) in store.arena(kind).iter() {
                self.ensure_open(kind, data.position)?;
                let idx = self.index_of(data.position);
                self.cells[idx].set_occupant(kind, Some(id));
            }
        }
        Ok(())
    }

    /// Overwrite the `kind` slot at `pos`. Callers have validated bounds.
    fn set_slot(&mut self, kind: EntityKind, pos: CellPos, id: Option<EntityId>) {
        debug_assert!(self.in_bounds(pos));
        let idx = self.index_of(pos);
        if let Some(cell) = self.cells.get_mut(idx) {
            cell.set_occupant(kind, id);
        }
    }
}

/// Dense entity storage with generational handles and stable stored order.
///
/// Iteration follows insertion order; removal swaps the last row into the
/// vacated index, so the relative order of survivors changes only there.
#[derive(Debug)]
pub struct EntityArena {
    slots: SlotMap<EntityId, usize>,
    handles: Vec<EntityId>,
    rows: Vec<EntityData>,
}

impl Default for EntityArena {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no entities are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over live handles in stored order.
    pub fn iter_handles(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.handles.iter().copied()
    }

    /// Iterate `(handle, data)` pairs in stored order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityData)> + '_ {
        self.handles.iter().copied().zip(self.rows.iter())
    }

    /// Iterate `(handle, data)` pairs mutably in stored order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut EntityData)> + '_ {
        self.handles.iter().copied().zip(self.rows.iter_mut())
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live entity.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    /// Borrow the data row for `id`.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.index_of(id).map(|idx| &self.rows[idx])
    }

    /// Mutably borrow the data row for `id`.
    #[must_use]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityData> {
        let idx = self.index_of(id)?;
        Some(&mut self.rows[idx])
    }

    /// Insert a new entity and return its handle.
    pub fn insert(&mut self, data: EntityData) -> EntityId {
        let index = self.rows.len();
        self.rows.push(data);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its data if it was present.
    pub fn remove(&mut self, id: EntityId) -> Option<EntityData> {
        let index = self.slots.remove(id)?;
        let removed = self.rows.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Clear all stored entities.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.rows.clear();
    }
}

/// Per-kind entity arenas; the authoritative owner of every entity.
#[derive(Debug)]
pub struct EntityStore {
    arenas: [EntityArena; EntityKind::COUNT],
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arenas: std::array::from_fn(|_| EntityArena::new()),
        }
    }

    /// Arena holding entities of `kind`.
    #[must_use]
    pub fn arena(&self, kind: EntityKind) -> &EntityArena {
        &self.arenas[kind.slot()]
    }

    /// Mutable arena access for `kind`.
    #[must_use]
    pub fn arena_mut(&mut self, kind: EntityKind) -> &mut EntityArena {
        &mut self.arenas[kind.slot()]
    }

    /// Total number of live entities across all kinds.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.arenas.iter().map(EntityArena::len).sum()
    }

    /// Clear every arena.
    pub fn clear(&mut self) {
        for arena in &mut self.arenas {
            arena.clear();
        }
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Lifecycle state of the simulation loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RunState {
    /// Initial state; the host is not driving a continuous loop.
    #[default]
    Stopped,
    /// Host-driven continuous stepping is active.
    Running,
}

/// Read-only context handed to an update policy for one agent decision.
#[derive(Debug, Clone, Copy)]
pub struct AgentView {
    /// Handle of the agent being decided.
    pub id: EntityId,
    pub position: CellPos,
    pub heading: Direction,
    /// Whether the forward neighbor exists inside the grid.
    pub forward_exists: bool,
    /// Whether the forward neighbor exists and can be entered.
    pub forward_open: bool,
    /// Per-direction enterability of the eight neighbors, in
    /// [`Direction::ALL`] order.
    pub open: [bool; 8],
}

/// Action decided for one agent for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Move one cell forward along the current heading.
    Advance,
    /// Rotate in place.
    Turn(Rotation),
    /// Do nothing this tick.
    Hold,
}

/// Per-agent decision rule applied each tick.
///
/// Selected once when the world is constructed; the engine consults it for
/// every mobile agent in stored order.
pub trait UpdatePolicy: Send {
    /// Static identifier of the policy implementation.
    fn name(&self) -> &'static str;

    /// Decide the action for one agent.
    fn decide(&mut self, view: &AgentView) -> AgentAction;

    /// Drop any per-agent state retained for `id`.
    fn forget(&mut self, _id: EntityId) {}

    /// Drop all per-agent state (the handle space is being replaced).
    fn reset(&mut self) {}

    /// Co-processor fallbacks since the last drain, for tick reporting.
    fn drain_fallbacks(&mut self) -> usize {
        0
    }
}

/// Default rule: advance when the forward cell is open, otherwise turn
/// counter-clockwise in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOrRotate;

impl UpdatePolicy for ForwardOrRotate {
    fn name(&self) -> &'static str {
        "forward-or-rotate"
    }

    fn decide(&mut self, view: &AgentView) -> AgentAction {
        if view.forward_open {
            AgentAction::Advance
        } else {
            AgentAction::Turn(Rotation::CounterClockwise)
        }
    }
}

/// Failures reported by a co-processor backend.
#[derive(Debug, Error)]
pub enum CoProcessorError {
    /// Backend could not be brought up or refused the attachment.
    #[error("co-processor attach failed: {0}")]
    Attach(String),
    /// A frame did not match the negotiated length.
    #[error("frame length mismatch: expected {expected}, got {actual}")]
    FrameLength { expected: usize, actual: usize },
    /// Evaluation failed mid-cycle.
    #[error("co-processor cycle failed: {0}")]
    Cycle(String),
    /// Output frame did not contain a recognised action code.
    #[error("output frame did not contain a recognised action")]
    UnrecognisedAction,
}

/// External per-agent logic evaluator driven through fixed-size byte frames.
///
/// Frame lengths are negotiated once, at attach time, and fixed thereafter.
/// State frames start zeroed; the engine stores them between cycles and swaps
/// them through the backend on every evaluation.
pub trait CoProcessor: Send {
    /// Static identifier of the backend.
    fn kind(&self) -> &'static str;

    /// Input frame length in bytes.
    fn input_len(&self) -> usize;

    /// State frame length in bytes.
    fn state_len(&self) -> usize;

    /// Output frame length in bytes.
    fn output_len(&self) -> usize;

    /// Overwrite the internal state from `frame`.
    fn load_state(&mut self, frame: &[u8]) -> Result<(), CoProcessorError>;

    /// Serialize the internal state into `frame`, returning bytes written.
    /// The count must cover the whole frame; partial writes are rejected.
    fn store_state(&self, frame: &mut [u8]) -> Result<usize, CoProcessorError>;

    /// Latch the input frame for the next cycle.
    fn write_input(&mut self, frame: &[u8]) -> Result<(), CoProcessorError>;

    /// Run one evaluation cycle.
    fn cycle(&mut self) -> Result<(), CoProcessorError>;

    /// Copy the latest output frame into `frame`, returning bytes written.
    /// Counts above the frame length are rejected.
    fn read_output(&self, frame: &mut [u8]) -> Result<usize, CoProcessorError>;
}

type CoProcessorSpawner =
    Box<dyn Fn(&mut dyn RngCore) -> Result<Box<dyn CoProcessor>, CoProcessorError> + Send + Sync>;

struct CoProcessorEntry {
    kind: Cow<'static, str>,
    spawner: CoProcessorSpawner,
}

/// Registry of co-processor factories keyed by opaque handles.
#[derive(Default)]
pub struct CoProcessorRegistry {
    next_key: u64,
    entries: HashMap<u64, CoProcessorEntry>,
}

impl fmt::Debug for CoProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoProcessorRegistry")
            .field("next_key", &self.next_key)
            .field("entry_count", &self.entries.len())
            .finish()
    }
}

impl CoProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend factory, returning its registry key.
    pub fn register<F>(&mut self, kind: impl Into<Cow<'static, str>>, factory: F) -> u64
    where
        F: Fn(&mut dyn RngCore) -> Result<Box<dyn CoProcessor>, CoProcessorError>
            + Send
            + Sync
            + 'static,
    {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(
            key,
            CoProcessorEntry {
                kind: kind.into(),
                spawner: Box::new(factory),
            },
        );
        key
    }

    /// Remove a backend factory from the registry.
    pub fn unregister(&mut self, key: u64) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Instantiate a backend using the factory referenced by `key`.
    pub fn spawn(
        &self,
        rng: &mut dyn RngCore,
        key: u64,
    ) -> Result<Box<dyn CoProcessor>, CoProcessorError> {
        match self.entries.get(&key) {
            Some(entry) => (entry.spawner)(rng),
            None => Err(CoProcessorError::Attach(format!(
                "no backend registered under key {key}"
            ))),
        }
    }

    /// Descriptive identifier associated with a registry entry.
    #[must_use]
    pub fn kind(&self, key: u64) -> Option<&str> {
        self.entries.get(&key).map(|entry| entry.kind.as_ref())
    }

    /// Returns whether a key is registered.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }
}

/// Encode the default input frame for one agent view.
///
/// Byte 0 carries the heading index; bytes 1..9 carry per-direction
/// enterability flags in [`Direction::ALL`] order.
#[must_use]
pub fn encode_agent_input(view: &AgentView) -> [u8; COPROC_INPUT_LEN] {
    let mut frame = [0u8; COPROC_INPUT_LEN];
    frame[0] = view.heading.index() as u8;
    for (slot, open) in frame[1..].iter_mut().zip(view.open) {
        *slot = u8::from(open);
    }
    frame
}

/// Decode an output frame into an action, if byte 0 carries a known code
/// (0 hold, 1 advance, 2 turn clockwise, 3 turn counter-clockwise).
#[must_use]
pub fn decode_agent_action(frame: &[u8]) -> Option<AgentAction> {
    match frame.first()? {
        0 => Some(AgentAction::Hold),
        1 => Some(AgentAction::Advance),
        2 => Some(AgentAction::Turn(Rotation::Clockwise)),
        3 => Some(AgentAction::Turn(Rotation::CounterClockwise)),
        _ => None,
    }
}

/// Policy delegating agent decisions to an attached co-processor.
///
/// One backend serves every agent; per-agent state frames are stored here and
/// swapped through the backend each cycle. A failed cycle falls back to the
/// default rule for that decision and is counted for the tick report.
pub struct CoProcessorPolicy {
    processor: Box<dyn CoProcessor>,
    states: EntityMap<Vec<u8>>,
    input: Vec<u8>,
    output: Vec<u8>,
    fallback: ForwardOrRotate,
    fallbacks: usize,
}

impl fmt::Debug for CoProcessorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoProcessorPolicy")
            .field("backend", &self.processor.kind())
            .field("attached_agents", &self.states.len())
            .finish()
    }
}

impl CoProcessorPolicy {
    /// Attach a backend spawned from `registry` under `key`.
    ///
    /// Frame lengths are negotiated here, once: the backend must accept at
    /// least the default agent frames. Failure leaves the caller free to fall
    /// back to [`ForwardOrRotate`].
    pub fn attach(
        registry: &CoProcessorRegistry,
        rng: &mut dyn RngCore,
        key: u64,
    ) -> Result<Self, CoProcessorError> {
        let processor = registry.spawn(rng, key)?;
        if processor.input_len() < COPROC_INPUT_LEN {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_INPUT_LEN,
                actual: processor.input_len(),
            });
        }
        if processor.output_len() < COPROC_OUTPUT_LEN {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_OUTPUT_LEN,
                actual: processor.output_len(),
            });
        }
        Ok(Self {
            input: vec![0; processor.input_len()],
            output: vec![0; processor.output_len()],
            states: EntityMap::new(),
            processor,
            fallback: ForwardOrRotate,
            fallbacks: 0,
        })
    }

    /// Identifier of the attached backend.
    #[must_use]
    pub fn backend_kind(&self) -> &'static str {
        self.processor.kind()
    }

    fn delegate(&mut self, view: &AgentView) -> Result<AgentAction, CoProcessorError> {
        let state_len = self.processor.state_len();
        if self.states.get(view.id).is_none() {
            self.states.insert(view.id, vec![0u8; state_len]);
        }
        let Some(state) = self.states.get_mut(view.id) else {
            return Err(CoProcessorError::Cycle("state frame missing".into()));
        };

        self.processor.load_state(state)?;
        self.input.fill(0);
        self.input[..COPROC_INPUT_LEN].copy_from_slice(&encode_agent_input(view));
        self.processor.write_input(&self.input)?;
        self.processor.cycle()?;
        // Counts come from the backend; never index past the negotiated frames.
        let written = self.processor.read_output(&mut self.output)?;
        if written > self.output.len() {
            return Err(CoProcessorError::FrameLength {
                expected: self.output.len(),
                actual: written,
            });
        }
        let stored = self.processor.store_state(state)?;
        if stored != state.len() {
            return Err(CoProcessorError::FrameLength {
                expected: state.len(),
                actual: stored,
            });
        }
        decode_agent_action(&self.output[..written]).ok_or(CoProcessorError::UnrecognisedAction)
    }
}

impl UpdatePolicy for CoProcessorPolicy {
    fn name(&self) -> &'static str {
        "co-processor"
    }

    fn decide(&mut self, view: &AgentView) -> AgentAction {
        match self.delegate(view) {
            Ok(action) => action,
            Err(_) => {
                self.fallbacks += 1;
                self.fallback.decide(view)
            }
        }
    }

    fn forget(&mut self, id: EntityId) {
        self.states.remove(id);
    }

    fn reset(&mut self) {
        self.states.clear();
    }

    fn drain_fallbacks(&mut self) -> usize {
        std::mem::take(&mut self.fallbacks)
    }
}

/// Hook deciding which entity, if any, should emigrate after a tick.
pub trait EmigrationPolicy: Send {
    /// Inspect the store after a tick; name an entity to flag for emigration.
    fn select(&mut self, store: &EntityStore, tick: Tick) -> Option<(EntityKind, EntityId)>;
}

/// Default emigration policy: nothing ever leaves the world.
#[derive(Debug, Default)]
pub struct NoEmigration;

impl EmigrationPolicy for NoEmigration {
    fn select(&mut self, _store: &EntityStore, _tick: Tick) -> Option<(EntityKind, EntityId)> {
        None
    }
}

/// Entity record exchanged through the transfer boundary and snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub kind: EntityKind,
    pub data: EntityData,
}

/// Encode a transferable entity record.
pub fn encode_entity(record: &TransferRecord) -> Result<Vec<u8>, WorldError> {
    Ok(postcard::to_allocvec(record)?)
}

/// Decode a transferable entity record.
pub fn decode_entity(bytes: &[u8]) -> Result<TransferRecord, WorldError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Parameters governing automatic resource replenishment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegrowthSettings {
    /// Population floor below which a cluster is seeded.
    pub min_count: usize,
    /// Cluster radius in cells (Chebyshev distance).
    pub radius: u32,
    /// Energy assigned to each spawned resource.
    pub energy: u32,
}

impl Default for RegrowthSettings {
    fn default() -> Self {
        Self {
            min_count: 16,
            radius: 2,
            energy: 10,
        }
    }
}

/// Static configuration for a gridworld simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldConfig {
    /// Grid width in cells (columns).
    pub width: u32,
    /// Grid height in cells (rows).
    pub height: u32,
    /// Pinned world identifier; generated when absent.
    pub world_id: Option<Uuid>,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Ticks between signal-marker decay sweeps; 0 disables decay.
    pub marker_decay_interval: u32,
    /// Resource regrowth parameters; absent disables regrowth.
    pub resource_regrowth: Option<RegrowthSettings>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: 10,
            height: 10,
            world_id: None,
            rng_seed: None,
            marker_decay_interval: 600,
            resource_regrowth: None,
        }
    }
}

impl WorldConfig {
    /// Validates the configuration, returning the grid dimensions.
    pub fn dimensions(&self) -> Result<(u32, u32), WorldError> {
        if self.width == 0 || self.height == 0 {
            return Err(WorldError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if let Some(regrowth) = &self.resource_regrowth {
            if regrowth.min_count == 0 {
                return Err(WorldError::InvalidConfig(
                    "resource_regrowth.min_count must be non-zero",
                ));
            }
            if regrowth.radius == 0 || regrowth.radius > 128 {
                return Err(WorldError::InvalidConfig(
                    "resource_regrowth.radius must be in 1..=128",
                ));
            }
        }
        Ok((self.width, self.height))
    }

    /// Returns the configured seed, drawing one from entropy if absent.
    fn initial_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }

    /// Returns the pinned world id, generating one if absent.
    fn initial_id(&self) -> Uuid {
        self.world_id.unwrap_or_else(Uuid::new_v4)
    }
}

/// Counters emitted after processing one world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickReport {
    pub tick: Tick,
    /// Agents that moved forward this tick.
    pub moved: usize,
    /// Agents that rotated in place this tick.
    pub turned: usize,
    /// Agents that held position this tick.
    pub held: usize,
    /// Agent decisions that fell back from the co-processor to the default rule.
    pub coproc_fallbacks: usize,
    /// Signal markers drained by decay this tick.
    pub markers_decayed: usize,
    /// Signal markers removed after reaching zero energy.
    pub markers_expired: usize,
    /// Resources spawned by regrowth this tick.
    pub resources_spawned: usize,
    /// Whether an entity was flagged for emigration this tick.
    pub emigrant_flagged: bool,
}

/// Byte prefix identifying a snapshot container.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"GWSN";
/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Complete serialized world state (the snapshot body).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub world_id: Uuid,
    pub width: u32,
    pub height: u32,
    pub tick: Tick,
    pub seed: u64,
    /// Entity lists per kind in [`EntityKind::ALL`] order, each in stored order.
    pub entities: [Vec<EntityData>; EntityKind::COUNT],
    pub pending_out: Option<TransferRecord>,
}

/// Encode `snapshot` into a standalone byte container.
pub fn encode_snapshot(snapshot: &WorldSnapshot) -> Result<Vec<u8>, WorldError> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(SNAPSHOT_MAGIC);
    bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&postcard::to_allocvec(snapshot)?);
    Ok(bytes)
}

/// Decode a byte container produced by [`encode_snapshot`].
pub fn decode_snapshot(bytes: &[u8]) -> Result<WorldSnapshot, WorldError> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 2 {
        return Err(WorldError::UnsupportedSnapshot(
            "container shorter than header",
        ));
    }
    let (magic, rest) = bytes.split_at(SNAPSHOT_MAGIC.len());
    if magic != SNAPSHOT_MAGIC {
        return Err(WorldError::UnsupportedSnapshot("bad magic"));
    }
    let (version_bytes, body) = rest.split_at(2);
    let version = u16::from_le_bytes([version_bytes[0], version_bytes[1]]);
    if version != SNAPSHOT_VERSION {
        return Err(WorldError::UnsupportedSnapshot("unsupported version"));
    }
    Ok(postcard::from_bytes(body)?)
}

/// Authoritative simulation state: grid, entity arenas, clock, and policy.
///
/// Single-writer; hosts serialize access externally. Every mutation
/// either completes or leaves the prior state authoritative, and the grid and
/// arenas are never left disagreeing with each other.
pub struct WorldState {
    config: WorldConfig,
    world_id: Uuid,
    run_state: RunState,
    tick: Tick,
    seed: u64,
    grid: Grid,
    store: EntityStore,
    policy: Box<dyn UpdatePolicy>,
    emigration: Box<dyn EmigrationPolicy>,
    pending_out: Option<TransferRecord>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("world_id", &self.world_id)
            .field("run_state", &self.run_state)
            .field("tick", &self.tick)
            .field("policy", &self.policy.name())
            .field("entity_count", &self.store.total_len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a world with the default update rule.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        Self::with_policy(config, Box::new(ForwardOrRotate))
    }

    /// Instantiate a world with an explicit update policy.
    pub fn with_policy(
        config: WorldConfig,
        policy: Box<dyn UpdatePolicy>,
    ) -> Result<Self, WorldError> {
        let (width, height) = config.dimensions()?;
        let seed = config.initial_seed();
        let world_id = config.initial_id();
        Ok(Self {
            grid: Grid::new(width, height)?,
            store: EntityStore::new(),
            config,
            world_id,
            run_state: RunState::Stopped,
            tick: Tick::zero(),
            seed,
            policy,
            emigration: Box::new(NoEmigration),
            pending_out: None,
        })
    }

    /// Replace the emigration hook.
    pub fn set_emigration(&mut self, policy: Box<dyn EmigrationPolicy>) {
        self.emigration = policy;
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Stable identifier carried by snapshots of this world.
    #[must_use]
    pub const fn world_id(&self) -> Uuid {
        self.world_id
    }

    /// Current simulation tick (the global age counter).
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Seed the next tick's RNG will be derived from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        self.run_state
    }

    /// True while the loop is in the `Running` state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.run_state, RunState::Running)
    }

    /// Transition to `Running`; calling while running is a no-op.
    pub fn start(&mut self) {
        self.run_state = RunState::Running;
    }

    /// Transition to `Stopped`; calling while stopped is a no-op.
    pub fn stop(&mut self) {
        self.run_state = RunState::Stopped;
    }

    /// Read-only access to the spatial index.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Read-only access to the entity arenas.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Name of the active update policy.
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Number of live entities of `kind`.
    #[must_use]
    pub fn entity_count(&self, kind: EntityKind) -> usize {
        self.store.arena(kind).len()
    }

    /// Total number of live entities.
    #[must_use]
    pub fn total_entities(&self) -> usize {
        self.store.total_len()
    }

    /// Borrow the data row for one entity.
    #[must_use]
    pub fn entity(&self, kind: EntityKind, id: EntityId) -> Option<&EntityData> {
        self.store.arena(kind).get(id)
    }

    /// Entity currently awaiting emigration, if any.
    #[must_use]
    pub fn pending_out(&self) -> Option<&TransferRecord> {
        self.pending_out.as_ref()
    }

    /// Spawn an entity of `kind`, validating bounds and the kind slot.
    pub fn spawn(&mut self, kind: EntityKind, data: EntityData) -> Result<EntityId, WorldError> {
        self.grid.ensure_open(kind, data.position)?;
        let id = self.store.arena_mut(kind).insert(data);
        self.grid.set_slot(kind, data.position, Some(id));
        Ok(id)
    }

    /// Remove an entity, clearing its cell slot. Returns its last data.
    pub fn remove(&mut self, kind: EntityKind, id: EntityId) -> Option<EntityData> {
        let data = self.store.arena_mut(kind).remove(id)?;
        self.grid.set_slot(kind, data.position, None);
        if kind == EntityKind::MobileAgent {
            self.policy.forget(id);
        }
        Some(data)
    }

    /// Execute one simulation tick pipeline, returning its counters.
    ///
    /// Valid in either run state; continuous execution loops belong to the
    /// host. Agents are visited in stored order with no re-sorting, so equal
    /// starting states and seeds replay identically.
    pub fn step(&mut self) -> TickReport {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let next_tick = self.tick.next();
        let mut report = TickReport {
            tick: next_tick,
            ..TickReport::default()
        };

        self.stage_aging();
        self.stage_agents(&mut report);
        self.stage_marker_decay(next_tick, &mut report);
        self.stage_regrowth(&mut rng, &mut report);
        self.stage_emigration(next_tick, &mut report);

        report.coproc_fallbacks = self.policy.drain_fallbacks();
        self.tick = next_tick;
        self.seed = rng.random();
        report
    }

    fn stage_aging(&mut self) {
        for (_, data) in self.store.arena_mut(EntityKind::MobileAgent).iter_mut() {
            data.age = data.age.saturating_add(1);
        }
    }

    fn stage_agents(&mut self, report: &mut TickReport) {
        let handles: Vec<EntityId> = self
            .store
            .arena(EntityKind::MobileAgent)
            .iter_handles()
            .collect();
        for id in handles {
            let Some(view) = self.agent_view(id) else {
                continue;
            };
            match self.policy.decide(&view) {
                AgentAction::Advance => {
                    // Re-validated at apply time; a refused advance is a hold.
                    if self.try_advance(id, view.position, view.heading) {
                        report.moved += 1;
                    } else {
                        report.held += 1;
                    }
                }
                AgentAction::Turn(rotation) => {
                    self.turn_agent(id, rotation);
                    report.turned += 1;
                }
                AgentAction::Hold => {
                    report.held += 1;
                }
            }
        }
    }

    fn agent_view(&self, id: EntityId) -> Option<AgentView> {
        let data = self.store.arena(EntityKind::MobileAgent).get(id)?;
        let position = data.position;
        let heading = data.heading;
        let mut open = [false; 8];
        for direction in Direction::ALL {
            open[direction.index()] = self
                .grid
                .neighbor(position, direction)
                .and_then(|next| self.grid.cell_at(next))
                .is_some_and(Cell::can_occupy);
        }
        Some(AgentView {
            id,
            position,
            heading,
            forward_exists: self.grid.has_neighbor(position, heading),
            forward_open: open[heading.index()],
            open,
        })
    }

    /// Relocate an agent one cell forward: clear the old slot, update the
    /// stored position, then set the new slot.
    fn try_advance(&mut self, id: EntityId, from: CellPos, heading: Direction) -> bool {
        let Some(to) = self.grid.neighbor(from, heading) else {
            return false;
        };
        if !self.grid.cell_at(to).is_some_and(Cell::can_occupy) {
            return false;
        }
        self.grid.set_slot(EntityKind::MobileAgent, from, None);
        if let Some(data) = self.store.arena_mut(EntityKind::MobileAgent).get_mut(id) {
            data.position = to;
        }
        self.grid.set_slot(EntityKind::MobileAgent, to, Some(id));
        true
    }

    fn turn_agent(&mut self, id: EntityId, rotation: Rotation) {
        if let Some(data) = self.store.arena_mut(EntityKind::MobileAgent).get_mut(id) {
            data.heading = data.heading.rotated(rotation);
        }
    }

    fn stage_marker_decay(&mut self, next_tick: Tick, report: &mut TickReport) {
        let interval = self.config.marker_decay_interval;
        if interval == 0 || !next_tick.0.is_multiple_of(u64::from(interval)) {
            return;
        }
        let mut expired: SmallVec<[EntityId; 8]> = SmallVec::new();
        for (id, data) in self.store.arena_mut(EntityKind::SignalMarker).iter_mut() {
            data.energy = data.energy.saturating_sub(interval);
            report.markers_decayed += 1;
            if data.energy == 0 {
                expired.push(id);
            }
        }
        for id in expired {
            self.remove(EntityKind::SignalMarker, id);
            report.markers_expired += 1;
        }
    }

    fn stage_regrowth(&mut self, rng: &mut SmallRng, report: &mut TickReport) {
        let Some(settings) = self.config.resource_regrowth else {
            return;
        };
        if self.store.arena(EntityKind::Resource).len() >= settings.min_count {
            return;
        }
        let center = CellPos::new(
            rng.random_range(0..self.grid.width()),
            rng.random_range(0..self.grid.height()),
        );
        let radius = settings.radius as i32;
        let mut cluster: SmallVec<[CellPos; 32]> = SmallVec::new();
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let Some(x) = center.x.checked_add_signed(dx) else {
                    continue;
                };
                let Some(y) = center.y.checked_add_signed(dy) else {
                    continue;
                };
                let pos = CellPos::new(x, y);
                if !self.grid.in_bounds(pos) {
                    continue;
                }
                let dist = dx.abs().max(dy.abs()) as f32;
                if dist == 0.0 || rng.random::<f32>() < 1.0 / (dist + 1.0) {
                    cluster.push(pos);
                }
            }
        }
        for pos in cluster {
            if self.grid.ensure_open(EntityKind::Resource, pos).is_ok() {
                let data = EntityData::at(pos).with_energy(settings.energy, settings.energy);
                let id = self.store.arena_mut(EntityKind::Resource).insert(data);
                self.grid.set_slot(EntityKind::Resource, pos, Some(id));
                report.resources_spawned += 1;
            }
        }
    }

    fn stage_emigration(&mut self, next_tick: Tick, report: &mut TickReport) {
        // Single-slot queue: a new emigrant is only flagged once the host
        // has collected the previous one.
        if self.pending_out.is_some() {
            return;
        }
        let Some((kind, id)) = self.emigration.select(&self.store, next_tick) else {
            return;
        };
        if let Some(data) = self.remove(kind, id) {
            self.pending_out = Some(TransferRecord { kind, data });
            report.emigrant_flagged = true;
        }
    }

    /// Capture the complete serializable state.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let entities = EntityKind::ALL
            .map(|kind| self.store.arena(kind).iter().map(|(_, data)| *data).collect());
        WorldSnapshot {
            world_id: self.world_id,
            width: self.grid.width(),
            height: self.grid.height(),
            tick: self.tick,
            seed: self.seed,
            entities,
            pending_out: self.pending_out,
        }
    }

    fn state_bytes(&self) -> Result<Vec<u8>, WorldError> {
        encode_snapshot(&self.snapshot())
    }

    /// Exact byte size of the current snapshot container.
    #[must_use]
    pub fn state_byte_size(&self) -> usize {
        self.state_bytes().map_or(0, |bytes| bytes.len())
    }

    /// Serialize into `buffer`, returning bytes written.
    ///
    /// Returns 0 without writing when the buffer is too small; the host
    /// re-queries [`WorldState::state_byte_size`] and retries.
    pub fn get_state(&self, buffer: &mut [u8]) -> usize {
        let Ok(bytes) = self.state_bytes() else {
            return 0;
        };
        if buffer.len() < bytes.len() {
            return 0;
        }
        buffer[..bytes.len()].copy_from_slice(&bytes);
        bytes.len()
    }

    /// Replace the entire world state from snapshot bytes.
    ///
    /// The decoded state is validated by a full grid rebuild before anything
    /// is committed; on any failure the prior state stays authoritative. The
    /// run state is host-owned and survives the restore.
    pub fn set_state(&mut self, bytes: &[u8]) -> Result<(), WorldError> {
        let snapshot = decode_snapshot(bytes)?;
        let mut grid = Grid::new(snapshot.width, snapshot.height)?;
        let mut store = EntityStore::new();
        for (kind, list) in EntityKind::ALL.into_iter().zip(snapshot.entities.iter()) {
            let arena = store.arena_mut(kind);
            for data in list {
                arena.insert(*data);
            }
        }
        grid.rebuild(&store)?;

        self.world_id = snapshot.world_id;
        self.config.width = snapshot.width;
        self.config.height = snapshot.height;
        self.tick = snapshot.tick;
        self.seed = snapshot.seed;
        self.grid = grid;
        self.store = store;
        self.pending_out = snapshot.pending_out;
        // Old handles are void once the arenas are replaced.
        self.policy.reset();
        Ok(())
    }

    /// Admit one externally supplied entity, best-effort.
    ///
    /// Placement prefers the boundary ring, then scans the interior, for a
    /// cell whose `kind` slot is free (agents additionally require an
    /// enterable cell). A malformed record or a full grid rejects silently:
    /// `false`, nothing changed.
    pub fn transfer_in(&mut self, bytes: &[u8]) -> bool {
        let Ok(record) = decode_entity(bytes) else {
            return false;
        };
        let Some(pos) = self.admission_cell(record.kind) else {
            return false;
        };
        let mut data = record.data;
        data.position = pos;
        let id = self.store.arena_mut(record.kind).insert(data);
        self.grid.set_slot(record.kind, pos, Some(id));
        true
    }

    fn admission_cell(&self, kind: EntityKind) -> Option<CellPos> {
        let open = |pos: CellPos| {
            let cell = self.grid.cell_at(pos)?;
            if cell.occupant(kind).is_some() {
                return None;
            }
            if kind == EntityKind::MobileAgent && !cell.can_occupy() {
                return None;
            }
            Some(pos)
        };
        for pos in self.grid.boundary_ring() {
            if let Some(found) = open(pos) {
                return Some(found);
            }
        }
        for y in 0..self.grid.height() {
            for x in 0..self.grid.width() {
                if let Some(found) = open(CellPos::new(x, y)) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Byte size of the entity awaiting emigration, or 0 when none is pending.
    #[must_use]
    pub fn pending_transfer_out_size(&self) -> usize {
        self.pending_out
            .as_ref()
            .and_then(|record| encode_entity(record).ok())
            .map_or(0, |bytes| bytes.len())
    }

    /// Serialize and clear the pending emigrant, returning bytes written.
    ///
    /// Returns 0 and keeps the emigrant pending when nothing is flagged or
    /// the buffer is too small.
    pub fn transfer_out(&mut self, buffer: &mut [u8]) -> usize {
        let Some(record) = self.pending_out else {
            return 0;
        };
        let Ok(bytes) = encode_entity(&record) else {
            return 0;
        };
        if buffer.len() < bytes.len() {
            return 0;
        }
        buffer[..bytes.len()].copy_from_slice(&bytes);
        self.pending_out = None;
        bytes.len()
    }
}
