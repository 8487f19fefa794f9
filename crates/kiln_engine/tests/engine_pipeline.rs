//! End-to-end tests: the real threaded engine over the headless backend.
//!
//! These exercise the full producer path — batch guard, bounded queue,
//! render-thread dispatch, ticket completion — and the frame loop's
//! self-healing behavior, with a short loop period so a handful of frames
//! fits in a few dozen milliseconds.

use std::time::Duration;

use kiln_engine::backend::headless::HeadlessStats;
use kiln_engine::glam::{Vec2, Vec3};
use kiln_engine::kiln_core::Transform;
use kiln_engine::resources::shader::ShaderStage;
use kiln_engine::{
    Engine, EngineError, EngineOptions, EngineStatus, HeadlessBackend, ProgramMode, Reply,
    TextureData, WindowOptions,
};

const PERIOD: Duration = Duration::from_millis(2);
const WAIT: Duration = Duration::from_secs(5);

fn start_engine_with(options: EngineOptions) -> (Engine, HeadlessStats) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = HeadlessBackend::new();
    let stats = backend.stats();
    let engine = Engine::new(options);
    engine
        .init(WindowOptions::default(), PERIOD, move || Ok(Box::new(backend)))
        .unwrap();
    engine.wait_ready(WAIT).unwrap();
    (engine, stats)
}

fn start_engine() -> (Engine, HeadlessStats) {
    start_engine_with(EngineOptions::default())
}

fn quad_data() -> (Vec<Vec3>, Vec<Vec2>, Vec<u32>) {
    (
        vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ],
        vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ],
        vec![0, 1, 2, 2, 3, 0],
    )
}

fn new_quad(engine: &Engine) -> u32 {
    let (positions, uvs, triangles) = quad_data();
    let ticket = engine
        .batch()
        .new_mesh(None, positions, uvs, None, triangles);
    match ticket.wait_timeout(WAIT).unwrap() {
        Reply::Id(id) => id,
        Reply::Done => panic!("new mesh must answer with an id"),
    }
}

/// Builds a linkable program from trivial sources and returns its id.
///
/// Tickets are only awaited after their batch guard is dropped: the render
/// thread skips draining while any producer holds the message lock.
fn new_program(engine: &Engine, tag: &str) -> u32 {
    let batch = engine.batch();
    let vs = batch.new_shader(
        ShaderStage::Vertex,
        tag.to_owned(),
        "fn vs_main() { }".into(),
    );
    let fs = batch.new_shader(
        ShaderStage::Fragment,
        tag.to_owned(),
        "fn fs_main() { }".into(),
    );
    drop(batch);
    let vs_id = vs.wait_timeout(WAIT).unwrap().id().unwrap();
    let fs_id = fs.wait_timeout(WAIT).unwrap().id().unwrap();

    let batch = engine.batch();
    let program = batch.new_program(ProgramMode::Flat);
    batch.select_shader(vs_id);
    batch.attach_shader();
    batch.select_shader(fs_id);
    let attached = batch.attach_shader();
    drop(batch);
    attached.wait_timeout(WAIT).unwrap();
    program.wait_timeout(WAIT).unwrap().id().unwrap()
}

#[test]
fn mesh_pipeline_end_to_end() {
    let (engine, _stats) = start_engine();

    let id = new_quad(&engine);
    let selected = engine.batch().select_mesh(id);
    assert_eq!(selected.wait_timeout(WAIT).unwrap(), Reply::Done);

    // Update with null triangles: positions/uvs/normals replaced, indices kept.
    let update = engine.batch().set_mesh_attributes(
        vec![Vec3::Y; 4],
        vec![Vec2::ONE; 4],
        Some(vec![Vec3::Z; 4]),
        None,
    );
    assert_eq!(update.wait_timeout(WAIT).unwrap(), Reply::Done);

    engine.close();
    assert_eq!(engine.status(), EngineStatus::Closed);
}

#[test]
fn invalid_mesh_is_cancelled_not_failed() {
    let (engine, _stats) = start_engine();
    // 5 indices: not a multiple of 3.
    let ticket = engine.batch().new_mesh(
        None,
        vec![Vec3::ZERO; 3],
        vec![Vec2::ZERO; 3],
        None,
        vec![0, 1, 2, 1, 2],
    );
    assert!(matches!(
        ticket.wait_timeout(WAIT),
        Err(EngineError::Cancelled)
    ));
    // The engine itself is fine.
    assert_eq!(engine.status(), EngineStatus::Running);
    engine.close();
}

#[test]
fn read_only_mesh_rejects_mutation_even_after_reselection() {
    let (engine, _stats) = start_engine();
    let id = new_quad(&engine);
    let promoted = engine.batch().set_mesh_read_only();
    promoted.wait_timeout(WAIT).unwrap();

    let reselected = engine.batch().select_mesh(id);
    reselected.wait_timeout(WAIT).unwrap();
    let mutation = engine.batch().set_mesh_attributes(
        vec![Vec3::X; 4],
        vec![Vec2::ZERO; 4],
        None,
        None,
    );
    assert!(matches!(
        mutation.wait_timeout(WAIT),
        Err(EngineError::Cancelled)
    ));
    engine.close();
}

#[test]
fn packed_cubemap_ratio_is_validated() {
    let (engine, _stats) = start_engine();

    // width == height * 6: valid row strip.
    let side = 4u32;
    let good = TextureData::new(side * 6, side, vec![0; (side * 6 * side * 4) as usize]).unwrap();
    let ok = engine.batch().new_cubemap_packed(0, good, None);
    assert!(matches!(ok.wait_timeout(WAIT).unwrap(), Reply::Id(_)));

    // width == height * 5: no supported packing.
    let bad = TextureData::new(side * 5, side, vec![0; (side * 5 * side * 4) as usize]).unwrap();
    let err = engine.batch().new_cubemap_packed(0, bad, None);
    assert!(matches!(
        err.wait_timeout(WAIT),
        Err(EngineError::Cancelled)
    ));
    engine.close();
}

#[test]
fn same_texture_identity_uploads_once() {
    let (engine, stats) = start_engine();

    new_quad(&engine);
    let renderable = engine.batch().new_renderable(vec![Transform::IDENTITY]);
    renderable.wait_timeout(WAIT).unwrap();
    let pid = new_program(&engine, "tex-test");

    let first = engine.batch().new_texture_2d(
        1,
        TextureData::solid([10, 20, 30, 255]),
        Some("assets/crate.png".into()),
    );
    let a = first.wait_timeout(WAIT).unwrap().id().unwrap();

    {
        let batch = engine.batch();
        batch.select_program(pid);
        batch.assign_program();
        batch.select_texture(a);
        batch.set_renderable_texture(1);
    }
    std::thread::sleep(Duration::from_millis(50));

    // Re-registering the same logical asset returns the same id and does not
    // upload a second GPU texture.
    let second = engine.batch().new_texture_2d(
        1,
        TextureData::solid([10, 20, 30, 255]),
        Some("assets/crate.png".into()),
    );
    let b = second.wait_timeout(WAIT).unwrap().id().unwrap();
    assert_eq!(a, b);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(stats.lock().textures_created, 1);
    engine.close();
}

#[test]
fn closed_program_heals_onto_default() {
    let (engine, stats) = start_engine();

    new_quad(&engine);
    let created = engine.batch().new_renderable(vec![Transform::IDENTITY]);
    created.wait_timeout(WAIT).unwrap();
    let pid = new_program(&engine, "healing");
    {
        let batch = engine.batch();
        batch.select_program(pid);
        batch.assign_program();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        !stats.lock().last_frame_draws.is_empty(),
        "renderable draws under its own program"
    );

    {
        let batch = engine.batch();
        batch.select_program(pid);
        batch.close_program();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert!(
        !stats.lock().last_frame_draws.is_empty(),
        "renderable still draws after its program closed (default fallback)"
    );
    engine.close();
}

#[test]
fn zero_sum_weight_row_is_rejected_before_buffering() {
    let (engine, _stats) = start_engine();
    new_quad(&engine);
    let created = engine.batch().new_renderable(vec![Transform::IDENTITY]);
    created.wait_timeout(WAIT).unwrap();

    let attach = engine.batch().attach_skeleton(
        vec![kiln_engine::Bone::root(Transform::IDENTITY)],
        vec![1.0, 1.0, 0.0, 1.0], // 4 rows × 1 bone; row 2 sums to zero
    );
    assert!(matches!(
        attach.wait_timeout(WAIT),
        Err(EngineError::Cancelled)
    ));
    engine.close();
}

#[test]
fn queue_bound_times_out_the_blocked_producer() {
    let (engine, _stats) = start_engine_with(EngineOptions {
        queue_capacity: 1,
        enqueue_timeout: Duration::from_millis(30),
    });

    // Holding the batch keeps the render thread from draining, so the
    // second submission finds the queue full and times out.
    let batch = engine.batch();
    let first = batch.enable_ui(true);
    let second = batch.enable_ui(false);
    assert!(second.is_cancelled(), "over-capacity command cancelled");
    drop(batch);

    assert_eq!(first.wait_timeout(WAIT).unwrap(), Reply::Done);
    engine.close();
}

#[test]
fn renderable_handle_materializes_asynchronously() {
    let (engine, _stats) = start_engine();
    let mesh = new_quad(&engine);

    let handle = kiln_engine::RenderableHandle::new(&engine, mesh, vec![Transform::IDENTITY]);
    // Mutations before materialization are no-ops, not errors.
    let early = handle.set_instances(vec![Transform::IDENTITY; 2]);
    assert!(early.wait_timeout(WAIT).is_ok());

    let deadline = std::time::Instant::now() + WAIT;
    while !handle.has_id() && !handle.is_failed() {
        assert!(std::time::Instant::now() < deadline, "handle never materialized");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(handle.has_id());
    assert!(!handle.is_failed());

    handle.select().unwrap();
    let late = handle.set_instances(vec![Transform::IDENTITY; 3]);
    assert_eq!(late.wait_timeout(WAIT).unwrap(), Reply::Done);
    engine.close();
}

#[test]
fn init_failure_releases_waiters_and_reports_failed() {
    let engine = Engine::new(EngineOptions::default());
    engine
        .init(WindowOptions::default(), PERIOD, || {
            Err(kiln_engine::BackendError::Surface("no display".into()))
        })
        .unwrap();
    assert!(matches!(
        engine.wait_ready(WAIT),
        Err(EngineError::NotRunning)
    ));
    assert_eq!(engine.status(), EngineStatus::Failed);
    // Commands against a failed engine cancel immediately.
    let ticket = engine.batch().enable_ui(true);
    assert!(ticket.is_cancelled());
}

#[test]
fn init_and_close_are_idempotent() {
    let (engine, _stats) = start_engine();
    // Second init is a no-op.
    engine
        .init(WindowOptions::default(), PERIOD, || {
            Ok(Box::new(HeadlessBackend::new()))
        })
        .unwrap();
    assert_eq!(engine.status(), EngineStatus::Running);
    assert_eq!(engine.max_combined_texture_units(), Some(16));

    engine.close();
    engine.close();
    assert_eq!(engine.status(), EngineStatus::Closed);

    let ticket = engine.batch().enable_ui(true);
    assert!(ticket.is_cancelled());
}
