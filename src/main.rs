use glam::Vec2;
use leb_subdiv::{EngineError, Subdivision, SubdivisionParams};

// headless demo: orbit the target inside the domain and report how the
// tree tracks it
fn main() -> Result<(), EngineError> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let frames: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(240);
    let max_depth: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(12);

    let mut subdivision = Subdivision::new(SubdivisionParams {
        max_depth,
        ..Default::default()
    })?;

    for frame in 0..frames {
        let angle = frame as f32 * 0.02;
        subdivision.set_target(Vec2::new(
            0.35 + 0.2 * angle.cos(),
            0.35 + 0.2 * angle.sin(),
        ));
        subdivision.update();

        if frame % 30 == 0 {
            log::info!(
                "frame {frame}: {} leaves, {} heap bytes, {} work groups",
                subdivision.node_count(),
                subdivision.heap_byte_size(),
                subdivision.update_record().group_count()
            );
        }
    }

    log::info!(
        "done after {frames} frames: {} leaves",
        subdivision.node_count()
    );
    Ok(())
}
