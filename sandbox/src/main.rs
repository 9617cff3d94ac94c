//! Acoustics sandbox: walks a listener into a small house and logs what it hears

mod reverb_probe;

use acoustics::{
    acoustics_update_system, AcousticsConfig, AcousticsState, CellInfo, DdaMarcher,
    OcclusionEvaluator, VoxelGrid,
};
use glam::{IVec3, Vec3};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{info, warn};

const TICK_MS: u64 = 100;
const WALK_TICKS: usize = 26;
const DOOR_CLOSE_TICK: usize = 50;
const TOTAL_TICKS: usize = 90;

const DOOR: [IVec3; 2] = [IVec3::new(0, 1, 4), IVec3::new(0, 2, 4)];

fn main() {
    acoustics::init_logging();
    info!("Starting acoustics sandbox");

    let config = load_config();
    let mut grid = build_scene();
    let marcher = DdaMarcher::default();
    let mut state = AcousticsState::new(&config);

    // Ambient emitters attached to tracked openings
    let playing: Rc<RefCell<HashSet<u32>>> = Rc::default();
    let audible = playing.clone();
    state
        .tracker
        .set_audibility_check(move |id| audible.borrow().contains(&id));

    let sound = Vec3::new(-4.5, 1.5, 12.5);

    for tick in 0..TOTAL_TICKS {
        let now_ms = tick as u64 * TICK_MS;
        let listener = listener_at(tick);

        if tick == DOOR_CLOSE_TICK {
            for cell in DOOR {
                grid.set(cell, CellInfo::door_closed());
                state.on_block_changed(cell);
            }
            info!("Door closed");
        }

        let evaluator = OcclusionEvaluator::new(&grid, &marcher, &config);

        if let Some(update) = acoustics_update_system(&mut state, &evaluator, listener, now_ms) {
            let mut playing = playing.borrow_mut();
            for id in &update.created {
                playing.insert(*id);
                info!(id, "Ambient emitter started");
            }
            for (id, reason) in &update.removed {
                playing.remove(id);
                info!(id, ?reason, "Ambient emitter stopped");
            }

            info!(
                tick,
                listener = ?listener,
                coverage = state.scanner.smoothed_sky_coverage(),
                occlusion = state.scanner.smoothed_occlusion_factor(),
                openings = state.tracker.len(),
                "Enclosure"
            );
        }

        if tick % 5 == 0 {
            match reverb_probe::hear(&mut state, &evaluator, sound, listener, now_ms) {
                Some(heard) => info!(
                    tick,
                    apparent = ?heard.apparent_position,
                    filter = heard.filter,
                    cached = heard.from_cache,
                    "Sound"
                ),
                None => info!(tick, "Sound paths cancelled out"),
            }
        }
    }

    for opening in state.tracker.tracked_openings() {
        info!(
            id = opening.id,
            position = ?opening.position,
            weight = opening.smoothed_weight,
            members = opening.member_count,
            "Tracked opening"
        );
    }
    info!(stats = ?state.reverb_cache.stats(), "Reverb cache");
}

/// Config path from the first argument, defaults otherwise
fn load_config() -> AcousticsConfig {
    let Some(path) = std::env::args().nth(1) else {
        return AcousticsConfig::default();
    };
    match AcousticsConfig::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config from {}: {}, using defaults", path, e);
            AcousticsConfig::default()
        }
    }
}

/// Flat ground with a plank house, an open door on the west wall and a window
fn build_scene() -> VoxelGrid {
    let mut grid = VoxelGrid::new();
    grid.fill(IVec3::new(-24, 0, -24), IVec3::new(24, 0, 24), &CellInfo::stone());
    grid.hollow_box(IVec3::new(0, 0, 0), IVec3::new(8, 5, 8), &CellInfo::planks());
    for cell in DOOR {
        grid.set(cell, CellInfo::door_open());
    }
    grid.set(IVec3::new(4, 2, 8), CellInfo::glass());
    // A tree outside
    grid.fill(IVec3::new(-6, 1, -6), IVec3::new(-6, 4, -6), &CellInfo::planks());
    grid.fill(IVec3::new(-8, 5, -8), IVec3::new(-4, 6, -4), &CellInfo::leaves());
    grid
}

/// Walk east through the door, then stand in the middle of the room
fn listener_at(tick: usize) -> Vec3 {
    let step = tick.min(WALK_TICKS) as f32;
    Vec3::new(-8.5 + step * 0.5, 2.62, 4.5)
}
