//! Integration tests for probe baking and the probe file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;
use tempfile::TempDir;

use pbrbatch::accel::Blas;
use pbrbatch::bake::{
    BakeStage, ProbeBakeConfig, ProbeBaker, ProbeFileReader, ProbeFileWriter, ProbeGrid,
    PROBE_BYTES,
};
use pbrbatch::config::{RenderConfig, RenderMode};
use pbrbatch::gpu::{BindingResource, Command, HeadlessDevice, PipelineKind};
use pbrbatch::layout::{PackedEnv, RtPushConstant};
use pbrbatch::render::{rt_binding, rt_set, BsdfTables, RenderBatch, Renderer, ShaderSources};
use pbrbatch::scene::{Camera, ObjectInfo, SceneDesc};
use pbrbatch::util::Aabb;
use pbrbatch::Error;

fn bounds() -> Aabb {
    Aabb::new(Vec3::ZERO, Vec3::splat(2.0))
}

/// Bake kernel that paints every texel with the probe camera position and
/// logs the sample offset of each burst.
fn position_kernel(device: &HeadlessDevice) -> Arc<Mutex<Vec<u32>>> {
    let bursts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&bursts);
    device.register_kernel(PipelineKind::ProbeBake, move |ctx| {
        if let Some(push) = ctx.push_constants::<RtPushConstant>() {
            log.lock().push(push.probe_idx);
        }
        let envs: Vec<PackedEnv> = ctx.read(rt_set::BATCH, rt_binding::ENVS);
        let Some(env) = envs.first() else {
            return;
        };
        let [x, y, z, _] = env.cam.pos_and_tan_fov;
        let texels = ctx.binding(rt_set::BATCH, rt_binding::HDR).map_or(0, |b| b.len() / 16);
        ctx.write(rt_set::BATCH, rt_binding::HDR, &vec![[x, y, z, 1.0f32]; texels]);
    });
    bursts
}

fn setup(
    device: &Arc<HeadlessDevice>,
    mode: RenderMode) -> (Renderer<HeadlessDevice>,
    RenderBatch<HeadlessDevice>,
) {
    let cfg = RenderConfig {
        img_width: 16,
        img_height: 16,
        spp: 128,
        mode,
        seed: Some(1),
        ..Default::default()
    };
    let shaders = ShaderSources::default();
    let mut renderer = Renderer::new(Arc::clone(device), cfg, &shaders, &BsdfTables::uniform(0.5))
        .expect("renderer");
    let scene = renderer
        .register_scene(SceneDesc {
            objects: vec![ObjectInfo {
                mesh_offset: 0,
                num_meshes: 1,
            }],
            blases: vec![Blas {
                address: 0x4000,
                bounds: Aabb::new(Vec3::ZERO, Vec3::ONE),
            }],
            env_bounds: bounds(),
            ..Default::default()
        })
        .expect("scene");
    let env = renderer.make_environment(&scene, Camera::default());
    let batch = renderer.make_render_batch(vec![env]).expect("batch");
    (renderer, batch)
}

fn bake_config(dir: &TempDir, grid: [u32; 3]) -> ProbeBakeConfig {
    ProbeBakeConfig {
        grid,
        path: dir.path().join("probes.bin"),
        ..Default::default()
    }
}

fn first_texel(record: &[u8]) -> [f32; 4] {
    bytemuck::pod_read_unaligned(&record[..16])
}

/// Dispatches recorded in bake submissions.
fn bake_dispatches(device: &HeadlessDevice, renderer: &Renderer<HeadlessDevice>) -> usize {
    let bake = Command::BindPipeline(renderer.pipelines().probe_bake);
    device
        .submissions()
        .iter()
        .filter(|s| s.commands.commands().first() == Some(&bake))
        .map(|s| s.commands.dispatch_count())
        .sum()
}

#[test]
fn test_bake_full_grid() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    let bursts = position_kernel(&device);
    let (mut renderer, mut batch) = setup(&device, RenderMode::PathTracer);

    let cfg = bake_config(&dir, [3, 3, 3]);
    let path = cfg.path.clone();
    let mut baker = ProbeBaker::new(cfg).expect("baker");
    let set = baker.bake(&mut renderer, &mut batch).expect("bake");

    assert_eq!(baker.stage(), BakeStage::Done);
    assert_eq!(baker.probe_idx(), 27);
    assert_eq!(set.len(), 27);
    assert!(renderer.probe_set().is_some());
    // Path tracer mode does not sample probes.
    assert!(set.bind_group().is_none());

    // Two bursts of 64 samples per probe.
    let bursts = bursts.lock().clone();
    assert_eq!(bursts.len(), 27 * 2);
    assert_eq!(&bursts[..2], &[0, 64]);

    let reader = ProbeFileReader::open(&path).expect("open");
    assert_eq!(reader.dims(), Some([3, 3, 3]));
    assert_eq!(reader.len(), 27);
    let grid = ProbeGrid::new([3, 3, 3], bounds());
    for (i, record) in reader.records().enumerate() {
        assert_eq!(record.len() as u64, PROBE_BYTES);
        let p = grid.position(i as u32);
        assert_eq!(first_texel(record), [p.x, p.y, p.z, 1.0], "probe {}", i);
    }
    // Center of the grid sits in the middle of the box.
    assert_eq!(first_texel(reader.record(13).expect("record")), [1.0, 1.0, 1.0, 1.0]);

    // Device copies match what was written to disk.
    let probe = &set.probes()[5];
    assert_eq!(probe.position, grid.position(5));
    let texels = device.texture_contents(probe.texture.handle()).expect("texture");
    assert_eq!(texels.as_slice(), reader.record(5).expect("record"));
}

fn write_partial_file(path: &Path, grid: &ProbeGrid, records: usize) {
    let mut writer = ProbeFileWriter::create(path, grid.header_dims()).expect("create");
    for _ in 0..records {
        writer.write_record(&vec![0u8; PROBE_BYTES as usize]).expect("record");
    }
    drop(writer);
    // Torn record left behind by an interrupted write.
    let mut file = OpenOptions::new().append(true).open(path).expect("reopen");
    file.write_all(&PROBE_BYTES.to_le_bytes()).expect("length");
    file.write_all(&[7u8; 100]).expect("partial texels");
}

#[test]
fn test_bake_resumes_interrupted_file() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    let bursts = position_kernel(&device);
    let (mut renderer, mut batch) = setup(&device, RenderMode::PathTracer);

    let cfg = bake_config(&dir, [2, 2, 1]);
    let grid = ProbeGrid::new(cfg.grid, bounds());
    write_partial_file(&cfg.path, &grid, 1);
    let before = ProbeFileReader::open(&cfg.path).expect("open");
    assert_eq!(before.len(), 1);
    drop(before);

    let path = cfg.path.clone();
    let mut baker = ProbeBaker::new(cfg).expect("baker");
    let set = baker.bake(&mut renderer, &mut batch).expect("bake");
    assert_eq!(set.len(), 4);

    // Only the three missing probes were rendered.
    assert_eq!(bursts.lock().len(), 3 * 2);
    assert_eq!(bake_dispatches(&device, &renderer), 3 * 2);

    let reader = ProbeFileReader::open(&path).expect("open");
    assert_eq!(reader.len(), 4);
    assert_eq!(first_texel(reader.record(0).expect("record")), [0.0; 4]);
    for i in 1..4 {
        let p = grid.position(i);
        assert_eq!(first_texel(reader.record(i as usize).expect("record")), [p.x, p.y, p.z, 1.0]);
    }
    let expected_len = 12 + 4 * (8 + PROBE_BYTES);
    assert_eq!(std::fs::metadata(&path).expect("metadata").len(), expected_len);
}

#[test]
fn test_complete_file_is_loaded_without_rendering() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    let bursts = position_kernel(&device);
    let (mut renderer, mut batch) = setup(&device, RenderMode::PathTracer);

    let cfg = bake_config(&dir, [2, 1, 1]);
    ProbeBaker::new(cfg.clone())
        .expect("baker")
        .bake(&mut renderer, &mut batch)
        .expect("first bake");
    bursts.lock().clear();

    let mut again = ProbeBaker::new(cfg).expect("baker");
    let set = again.bake(&mut renderer, &mut batch).expect("second bake");
    assert_eq!(set.len(), 2);
    assert!(bursts.lock().is_empty());
    assert_eq!(set.probes()[1].position, Vec3::new(2.0, 0.0, 0.0));
}

#[test]
fn test_grid_mismatch_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    let (mut renderer, mut batch) = setup(&device, RenderMode::PathTracer);

    let cfg = bake_config(&dir, [3, 3, 3]);
    write_partial_file(&cfg.path, &ProbeGrid::new([2, 2, 2], bounds()), 2);

    let mut baker = ProbeBaker::new(cfg).expect("baker");
    let err = baker.bake(&mut renderer, &mut batch).err().expect("should fail");
    assert!(matches!(
        err,
        Error::ProbeGridMismatch {
            expected: [3, 3, 3],
            found: [2, 2, 2]
        }
    ));
    assert!(err.is_fatal());
    assert!(renderer.probe_set().is_none());
}

#[test]
fn test_biased_mode_binds_probes() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    position_kernel(&device);
    let (mut renderer, mut batch) = setup(&device, RenderMode::Biased);

    let mut baker = ProbeBaker::new(bake_config(&dir, [2, 2, 1])).expect("baker");
    let set = baker.bake(&mut renderer, &mut batch).expect("bake");
    let group = set.bind_group().expect("probe bind group");

    let entries = device.bind_group_entries(group).expect("entries");
    let textures = match &entries[0].resource {
        BindingResource::TextureArray(textures) => textures.clone(),
        other => panic!("unexpected probe binding {:?}", other),
    };
    let expected: Vec<_> = set.probes().iter().map(|p| p.texture.handle()).collect();
    assert_eq!(textures, expected);

    // Later frames bind the probe set.
    device.clear_submissions();
    renderer.render(&mut batch).expect("render");
    let binds_probes = device.submissions().iter().any(|s| {
        s.commands
            .commands()
            .contains(&Command::BindGroup {
                set: rt_set::PROBES,
                group,
            })
    });
    assert!(binds_probes);
}

#[test]
fn test_independent_bakers() {
    let dir = TempDir::new().expect("tempdir");
    let device = Arc::new(HeadlessDevice::default());
    position_kernel(&device);
    let (mut renderer, mut batch) = setup(&device, RenderMode::PathTracer);

    let mut small = ProbeBaker::new(ProbeBakeConfig {
        path: dir.path().join("small.bin"),
        ..bake_config(&dir, [1, 1, 1])
    })
    .expect("baker");
    let mut large = ProbeBaker::new(ProbeBakeConfig {
        path: dir.path().join("large.bin"),
        ..bake_config(&dir, [2, 1, 1])
    })
    .expect("baker");

    small.bake(&mut renderer, &mut batch).expect("small bake");
    large.bake(&mut renderer, &mut batch).expect("large bake");
    assert_eq!(small.probe_idx(), 1);
    assert_eq!(large.probe_idx(), 2);
    assert_eq!(renderer.probe_set().map(|s| s.len()), Some(2));
}

#[test]
fn test_invalid_bake_config() {
    let cfg = ProbeBakeConfig {
        grid: [0, 1, 1],
        ..Default::default()
    };
    assert!(matches!(
        ProbeBaker::<HeadlessDevice>::new(cfg).err(),
        Some(Error::InvalidConfig(_))
    ));
}
