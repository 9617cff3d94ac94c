//! Voxel world interface consumed by the acoustics core
//!
//! The core never owns world data. Cell contents and rain heights are read
//! through [`WorldQuery`]. [`VoxelGrid`] is a sparse in-memory implementation
//! used by the sandbox runner and the tests.

use crate::error::WorldError;
use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Axis-aligned box, either cell-local (0..1 space) or in world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create a new box from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// The full unit cell
    pub fn unit() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE)
    }

    /// Move the box by `offset`
    pub fn translated(&self, offset: Vec3) -> Self {
        Self::new(self.min + offset, self.max + offset)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// What a single cell looks like to a sound ray
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellInfo {
    /// Empty cell, never occludes
    pub is_air: bool,
    /// At least one full face; occlusion applies without a geometric test
    pub has_solid_face: bool,
    /// Water, lava and friends
    pub is_liquid: bool,
    /// Doors, trapdoors and gates. Tracked separately by the weather-aware evaluation.
    pub interactable: bool,
    /// Material occlusion applied when a ray is blocked by this cell
    pub occlusion: f32,
    /// Cell-local collision volumes for partial geometry
    pub collision_volumes: Vec<Aabb>,
}

impl Default for CellInfo {
    fn default() -> Self {
        Self::air()
    }
}

impl CellInfo {
    pub fn air() -> Self {
        Self {
            is_air: true,
            has_solid_face: false,
            is_liquid: false,
            interactable: false,
            occlusion: 0.0,
            collision_volumes: Vec::new(),
        }
    }

    /// Full cube with the given material occlusion
    pub fn solid(occlusion: f32) -> Self {
        Self {
            is_air: false,
            has_solid_face: true,
            is_liquid: false,
            interactable: false,
            occlusion,
            collision_volumes: vec![Aabb::unit()],
        }
    }

    /// Stone - the reference material, one full unit of occlusion
    pub fn stone() -> Self {
        Self::solid(1.0)
    }

    /// Wood planks - slightly less dense than stone
    pub fn planks() -> Self {
        Self::solid(0.8)
    }

    /// Glass - full cube that lets a good part of the sound through
    pub fn glass() -> Self {
        Self::solid(0.3)
    }

    /// Wool - soft but thick
    pub fn wool() -> Self {
        Self::solid(1.2)
    }

    pub fn water() -> Self {
        Self {
            is_air: false,
            has_solid_face: false,
            is_liquid: true,
            interactable: false,
            occlusion: 0.0,
            collision_volumes: Vec::new(),
        }
    }

    /// Foliage: partial geometry spanning the whole cell, barely occluding
    pub fn leaves() -> Self {
        Self::partial(0.15, vec![Aabb::unit()])
    }

    /// Fence post in the middle of the cell
    pub fn fence() -> Self {
        Self::partial(
            0.4,
            vec![Aabb::new(
                Vec3::new(0.375, 0.0, 0.375),
                Vec3::new(0.625, 1.0, 0.625),
            )],
        )
    }

    /// Non-solid, non-liquid cell with the given collision volumes
    pub fn partial(occlusion: f32, collision_volumes: Vec<Aabb>) -> Self {
        Self {
            is_air: false,
            has_solid_face: false,
            is_liquid: false,
            interactable: false,
            occlusion,
            collision_volumes,
        }
    }

    /// Closed door panel spanning the cell along X, on the low-Z edge
    pub fn door_closed() -> Self {
        Self {
            interactable: true,
            ..Self::partial(
                0.9,
                vec![Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.1875))],
            )
        }
    }

    /// Open door folded against the low-X edge of the cell
    pub fn door_open() -> Self {
        Self {
            interactable: true,
            ..Self::partial(
                0.9,
                vec![Aabb::new(Vec3::ZERO, Vec3::new(0.1875, 1.0, 1.0))],
            )
        }
    }

    /// Closed trapdoor lying flat at the bottom of the cell
    pub fn trapdoor_closed() -> Self {
        Self {
            interactable: true,
            ..Self::partial(
                0.9,
                vec![Aabb::new(Vec3::ZERO, Vec3::new(1.0, 0.1875, 1.0))],
            )
        }
    }

    /// Solid for structural checks: a full face or liquid
    pub fn is_solid(&self) -> bool {
        !self.is_air && (self.has_solid_face || self.is_liquid)
    }

    /// Whether rain stops at this cell
    pub fn blocks_rain(&self) -> bool {
        !self.is_air
    }
}

/// Read access to the voxel world
///
/// Implementations must tolerate queries for regions that are not loaded and
/// report them as [`WorldError`] instead of panicking.
pub trait WorldQuery {
    /// Contents of the cell at `pos`
    fn cell(&self, pos: IVec3) -> Result<CellInfo, WorldError>;

    /// First y coordinate at which rain lands in column (x, z), one above the
    /// topmost rain-blocking cell
    fn rain_height(&self, x: i32, z: i32) -> Result<i32, WorldError>;
}

/// Sparse in-memory voxel world
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    cells: HashMap<IVec3, CellInfo>,
    /// Inclusive min / exclusive max of the loaded region, `None` = everything loaded
    loaded: Option<(IVec3, IVec3)>,
    /// Rain height of a column without any blocks
    bottom: i32,
    top: i32,
}

impl Default for VoxelGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl VoxelGrid {
    pub fn new() -> Self {
        Self {
            cells: HashMap::new(),
            loaded: None,
            bottom: -64,
            top: -64,
        }
    }

    /// Restrict queries to `[min, max)`; anything outside reports as unloaded
    pub fn with_loaded_bounds(mut self, min: IVec3, max: IVec3) -> Self {
        self.loaded = Some((min, max));
        self
    }

    /// Place a cell. Air removes whatever was there.
    pub fn set(&mut self, pos: IVec3, cell: CellInfo) {
        if cell.is_air {
            self.cells.remove(&pos);
        } else {
            self.top = self.top.max(pos.y);
            self.cells.insert(pos, cell);
        }
    }

    pub fn clear(&mut self, pos: IVec3) {
        self.cells.remove(&pos);
    }

    /// Fill the inclusive box `[min, max]`
    pub fn fill(&mut self, min: IVec3, max: IVec3, cell: &CellInfo) {
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    self.set(IVec3::new(x, y, z), cell.clone());
                }
            }
        }
    }

    /// Shell of the inclusive box `[min, max]`: walls, floor and roof
    pub fn hollow_box(&mut self, min: IVec3, max: IVec3, cell: &CellInfo) {
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    let on_shell = x == min.x
                        || x == max.x
                        || y == min.y
                        || y == max.y
                        || z == min.z
                        || z == max.z;
                    if on_shell {
                        self.set(IVec3::new(x, y, z), cell.clone());
                    }
                }
            }
        }
    }

    pub fn get(&self, pos: IVec3) -> Option<&CellInfo> {
        self.cells.get(&pos)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn is_loaded(&self, x: i32, y: Option<i32>, z: i32) -> bool {
        match self.loaded {
            None => true,
            Some((min, max)) => {
                let y_ok = y.map_or(true, |y| y >= min.y && y < max.y);
                x >= min.x && x < max.x && z >= min.z && z < max.z && y_ok
            }
        }
    }
}

impl WorldQuery for VoxelGrid {
    fn cell(&self, pos: IVec3) -> Result<CellInfo, WorldError> {
        if !self.is_loaded(pos.x, Some(pos.y), pos.z) {
            return Err(WorldError::Unloaded {
                x: pos.x,
                y: pos.y,
                z: pos.z,
            });
        }
        Ok(self.cells.get(&pos).cloned().unwrap_or_else(CellInfo::air))
    }

    fn rain_height(&self, x: i32, z: i32) -> Result<i32, WorldError> {
        if !self.is_loaded(x, None, z) {
            return Err(WorldError::ColumnUnloaded { x, z });
        }
        let mut y = self.top;
        while y >= self.bottom {
            if let Some(cell) = self.cells.get(&IVec3::new(x, y, z)) {
                if cell.blocks_rain() {
                    return Ok(y + 1);
                }
            }
            y -= 1;
        }
        Ok(self.bottom)
    }
}
