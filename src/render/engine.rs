//! Batch render engine.
//!
//! One [`Renderer`] owns the pipelines, queues and shared scene state of a
//! session and drives every batch through the per-frame protocol:
//! TLAS rebuilds, parameter upload, path tracing (optionally adaptive),
//! denoising, exposure and tonemapping, then submission.

use std::sync::Arc;

use half::f16;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bake::{ProbeSet, DEFAULT_PROBE_GRID};
use crate::config::{RenderConfig, LOCAL_WORKGROUP_X, LOCAL_WORKGROUP_Y};
use crate::gpu::{
    Access, Barrier, BindGroupDesc, BindingEntry, BufferDesc, BufferHandle, CommandList, CopyRegion,
    FenceHandle, GpuBuffer, GpuDevice, GpuTexture, LoaderQueues, PipelineHandle, QueuePool, Stage,
};
use crate::layout::{
    AdaptiveTile, FramebufferConfig, InstanceTransform, PackedEnv, PackedLight, ParamBufferConfig,
    RtPushConstant,
};
use crate::scene::{
    Camera, DomainRandomization, EnvMapData, EnvMapGroup, Environment, Scene, SceneDesc,
    SharedEnvMapState, SharedSceneState,
};
use crate::util::{divide_round_up, Aabb, Error, Result};

use super::adaptive::TileQueue;
use super::batch::{OutputPlane, RenderBatch};
use super::bsdf::{BsdfLuts, BsdfTables};
use super::denoise::{DenoisePlanes, Denoiser, Presenter};
use super::framebuffer::FramebufferState;
use super::pipelines::{rt_set, RenderPipelines, ShaderSources};
use super::state::PerBatchState;

/// Where the renderer is in the per-frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Idle,
    RecordingTlas,
    RecordingUpload,
    RecordingDispatch,
    AdaptiveRefinement,
    RecordingPost,
    Submitted,
}

impl RenderStage {
    /// Legal successor stages.
    pub fn can_advance_to(self, next: RenderStage) -> bool {
        use RenderStage::*;
        matches!(
            (self, next),
            (Idle | Submitted, RecordingTlas)
                | (RecordingTlas, RecordingUpload)
                | (RecordingUpload, RecordingDispatch)
                | (RecordingDispatch | AdaptiveRefinement, AdaptiveRefinement)
                | (RecordingDispatch | AdaptiveRefinement, RecordingPost)
                | (RecordingPost, Submitted)
                | (Submitted, Idle)
        )
    }
}

/// Session-wide render engine.
pub struct Renderer<D: GpuDevice> {
    device: Arc<D>,
    cfg: RenderConfig,
    fb_cfg: FramebufferConfig,
    param_cfg: ParamBufferConfig,
    pipelines: RenderPipelines<D>,
    queues: QueuePool,
    bsdf: BsdfLuts<D>,
    scenes: SharedSceneState<D>,
    env_maps: SharedEnvMapState<D>,
    probe_set: Option<Arc<ProbeSet<D>>>,
    rng: StdRng,
    cur_queue: u32,
    frame_counter: u32,
    stage: RenderStage,
    denoiser: Option<Box<dyn Denoiser<D>>>,
    presenter: Option<Box<dyn Presenter<D>>>,
}

impl<D: GpuDevice> Renderer<D> {
    /// Compile pipelines, upload the BSDF tables and set up the shared
    /// scene and env-map state. A 1x1 black env map is active until
    /// [`set_active_environment_maps`](Self::set_active_environment_maps).
    #[tracing::instrument(skip_all, fields(batch = cfg.batch_size, spp = cfg.spp))]
    pub fn new(
        device: Arc<D>,
        cfg: RenderConfig,
        shaders: &ShaderSources,
        bsdf_tables: &BsdfTables,
    ) -> Result<Self> {
        cfg.validate()?;
        let props = device.properties();
        let fb_cfg = FramebufferConfig::from_config(&cfg);
        let param_cfg = ParamBufferConfig::from_config(&cfg, props.storage_alignment);

        let pipelines = RenderPipelines::new(&device, &cfg, shaders)?;
        let queues = QueuePool::new(&props, cfg.num_loaders)?;
        let bsdf = BsdfLuts::upload(&device, bsdf_tables)?;

        let table_bytes =
            cfg.max_scenes as u64 * std::mem::size_of::<crate::scene::SceneAddresses>() as u64;
        let table = GpuBuffer::new(&device, &BufferDesc::staging("scene addresses", table_bytes))?;
        let scene_group = device.create_bind_group(&BindGroupDesc {
            label: "scenes",
            pipeline: pipelines.path_trace,
            set: rt_set::SCENES,
            entries: &[BindingEntry::buffer(0, table.handle(), 0, table_bytes)],
        })?;
        let scenes = SharedSceneState::new(Arc::clone(&device), table, scene_group, cfg.max_scenes);

        let black = EnvMapGroup::new(
            &device,
            &[EnvMapData::solid(1, 1, [0.0, 0.0, 0.0, 1.0])],
            pipelines.path_trace,
            rt_set::ENV_MAPS,
            cfg.max_env_maps,
        )?;
        let env_maps = SharedEnvMapState::new(Arc::new(black));

        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        tracing::info!(
            width = cfg.img_width,
            height = cfg.img_height,
            frame_width = fb_cfg.frame_width,
            frame_height = fb_cfg.frame_height,
            param_bytes = param_cfg.total_param_bytes,
            "renderer ready"
        );

        Ok(Self {
            device,
            cfg,
            fb_cfg,
            param_cfg,
            pipelines,
            queues,
            bsdf,
            scenes,
            env_maps,
            probe_set: None,
            rng,
            cur_queue: 0,
            frame_counter: 0,
            stage: RenderStage::Idle,
            denoiser: None,
            presenter: None,
        })
    }

    pub fn with_denoiser(mut self, denoiser: impl Denoiser<D> + 'static) -> Self {
        self.denoiser = Some(Box::new(denoiser));
        self
    }

    pub fn with_presenter(mut self, presenter: impl Presenter<D> + 'static) -> Self {
        self.presenter = Some(Box::new(presenter));
        self
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &RenderConfig {
        &self.cfg
    }

    pub fn framebuffer_config(&self) -> &FramebufferConfig {
        &self.fb_cfg
    }

    pub fn param_config(&self) -> &ParamBufferConfig {
        &self.param_cfg
    }

    pub fn pipelines(&self) -> &RenderPipelines<D> {
        &self.pipelines
    }

    pub fn queues(&self) -> &QueuePool {
        &self.queues
    }

    #[inline]
    pub fn stage(&self) -> RenderStage {
        self.stage
    }

    #[inline]
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Queue index the next render submits on.
    #[inline]
    pub fn current_queue(&self) -> u32 {
        self.cur_queue
    }

    /// Hand out queues for the next loader thread.
    pub fn reserve_loader_queues(&self) -> Result<LoaderQueues> {
        self.queues.reserve_loader()
    }

    /// Publish a loaded scene in the shared scene table.
    pub fn register_scene(&self, desc: SceneDesc) -> Result<Arc<Scene>> {
        let id = self.scenes.register(&desc.addresses)?;
        Ok(Arc::new(Scene::new(id, desc)))
    }

    /// Number of scene IDs in use.
    pub fn live_scenes(&self) -> u32 {
        self.scenes.live_ids()
    }

    /// New environment of `scene`, randomized when the session asks for it.
    pub fn make_environment(&mut self, scene: &Arc<Scene>, camera: Camera) -> Environment<D> {
        let randomization = if self.cfg.flags.randomize {
            DomainRandomization::sample(&mut self.rng, self.env_maps.get().num_maps())
        } else {
            DomainRandomization::IDENTITY
        };
        Environment::new(Arc::clone(&self.device), Arc::clone(scene), camera, randomization)
    }

    pub fn load_environment_maps(&self, maps: &[EnvMapData]) -> Result<Arc<EnvMapGroup<D>>> {
        let group = EnvMapGroup::new(
            &self.device,
            maps,
            self.pipelines.path_trace,
            rt_set::ENV_MAPS,
            self.cfg.max_env_maps,
        )?;
        tracing::debug!(maps = group.num_maps(), "loaded environment maps");
        Ok(Arc::new(group))
    }

    /// Make `group` the env maps new frames bind. Returns the previous group.
    pub fn set_active_environment_maps(&self, group: Arc<EnvMapGroup<D>>) -> Arc<EnvMapGroup<D>> {
        self.env_maps.replace(group)
    }

    pub fn active_environment_maps(&self) -> Arc<EnvMapGroup<D>> {
        self.env_maps.get()
    }

    /// Install baked probes for the biased mode to sample.
    pub fn set_probe_set(&mut self, probes: Arc<ProbeSet<D>>) {
        self.probe_set = Some(probes);
    }

    pub fn probe_set(&self) -> Option<&Arc<ProbeSet<D>>> {
        self.probe_set.as_ref()
    }

    /// Allocate a batch handle. Exactly `batch_size` environments are required.
    #[tracing::instrument(skip_all)]
    pub fn make_render_batch(&self, envs: Vec<Environment<D>>) -> Result<RenderBatch<D>> {
        if envs.len() != self.cfg.batch_size as usize {
            return Err(Error::config(format!(
                "batch needs {} environments, got {}",
                self.cfg.batch_size,
                envs.len()
            )));
        }
        let fb = FramebufferState::new(&self.device, &self.cfg.flags, &self.fb_cfg)?;
        let state = self.make_batch_state(&self.fb_cfg, &fb, self.pipelines.path_trace)?;
        Ok(RenderBatch::new(envs, fb, state))
    }

    pub(super) fn make_batch_state(
        &self,
        fb_cfg: &FramebufferConfig,
        fb: &FramebufferState<D>,
        target: PipelineHandle,
    ) -> Result<PerBatchState<D>> {
        PerBatchState::new(
            &self.device,
            &self.cfg,
            &self.param_cfg,
            fb_cfg,
            fb,
            &self.bsdf,
            &self.pipelines,
            target,
        )
    }

    fn advance(&mut self, next: RenderStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal render stage transition {:?} -> {:?}",
            self.stage,
            next
        );
        tracing::trace!(from = ?self.stage, to = ?next, "render stage");
        self.stage = next;
    }

    /// Record and submit one frame of `batch`.
    ///
    /// Waits first if the batch's previous frame is still in flight. Adaptive
    /// sampling and denoising block on intermediate submissions; the final
    /// submission is left in flight until [`wait_for_batch`](Self::wait_for_batch).
    #[tracing::instrument(skip_all, fields(frame = self.frame_counter))]
    pub fn render(&mut self, batch: &mut RenderBatch<D>) -> Result<()> {
        if batch.in_flight {
            self.wait_for_batch(batch)?;
        }
        let dirty = dirty_flags(&batch.envs);
        let result = self.render_frame(batch);
        if result.is_err() {
            // The recorded TLAS builds never reached the device.
            restore_dirty(&mut batch.envs, &dirty);
            self.stage = RenderStage::Idle;
        }
        result
    }

    fn render_frame(&mut self, batch: &mut RenderBatch<D>) -> Result<()> {
        if self.cfg.denoise_active() && self.denoiser.is_none() {
            return Err(Error::config("denoising is enabled but no denoiser is installed"));
        }
        let env_maps = self.env_maps.get();
        let bounds = batch.envs.first().map_or(Aabb::EMPTY, |env| env.scene().env_bounds());

        self.advance(RenderStage::RecordingTlas);
        let mut cmd = self.begin_pass(&batch.state, batch.cur_buffer, &env_maps, bounds);
        Self::record_tlas_builds(&mut batch.envs, &mut cmd)?;

        self.advance(RenderStage::RecordingUpload);
        self.pack_params(&mut batch.envs, &batch.state, None)?;
        self.record_param_upload(&mut cmd, &batch.state);

        self.advance(RenderStage::RecordingDispatch);
        let (x, y, z) = self.launch_size();
        if self.cfg.flags.adaptive_sample {
            cmd = self.run_adaptive(batch, cmd, &env_maps, bounds)?;
        } else {
            cmd.dispatch(x, y, z);
            self.frame_counter = self.frame_counter.wrapping_add(self.cfg.batch_size);
        }

        self.advance(RenderStage::RecordingPost);
        if self.cfg.denoise_active() {
            self.submit_and_wait(cmd, batch.state.fence)?;
            self.run_denoiser(&batch.fb)?;
            cmd = self.begin_pass(&batch.state, batch.cur_buffer, &env_maps, bounds);
        }

        if self.cfg.flags.tonemap {
            let (Some(exposure), Some(tonemap)) =
                (batch.state.exposure_group(), batch.state.tonemap_group())
            else {
                return Err(Error::other(
                    "tonemapping enabled but the batch has no post-process groups",
                ));
            };
            cmd.barrier(Barrier::compute_to_compute());
            cmd.bind_pipeline(self.pipelines.exposure);
            cmd.bind_group(0, exposure);
            cmd.dispatch(1, 1, self.cfg.batch_size);
            cmd.barrier(Barrier::compute_to_compute());
            cmd.bind_pipeline(self.pipelines.tonemap);
            cmd.bind_group(0, tonemap);
            cmd.dispatch(x, y, z);
        }

        self.submit_frame(cmd, batch)?;
        batch.in_flight = true;
        batch.in_flight_env_maps = Some(env_maps);
        batch.cur_buffer ^= 1;
        self.cur_queue = self.queues.next_render_queue(self.cur_queue);
        self.advance(RenderStage::Submitted);
        Ok(())
    }

    /// Block until the batch's last frame completed, then release what it
    /// kept alive.
    pub fn wait_for_batch(&mut self, batch: &mut RenderBatch<D>) -> Result<()> {
        if !batch.in_flight {
            return Ok(());
        }
        self.device.wait_fence(batch.state.fence)?;
        self.device.reset_fence(batch.state.fence)?;
        batch.in_flight = false;
        batch.in_flight_env_maps = None;
        if self.stage == RenderStage::Submitted {
            self.advance(RenderStage::Idle);
        }
        Ok(())
    }

    /// Exported color plane (RGBA16F, physical framebuffer layout).
    pub fn output_buffer(&self, batch: &RenderBatch<D>) -> Result<OutputPlane> {
        OutputPlane::of(&batch.fb.output)
    }

    /// Exported (normal, albedo) planes when auxiliary outputs are on.
    pub fn auxiliary_outputs(
        &self,
        batch: &RenderBatch<D>,
    ) -> Result<Option<(OutputPlane, OutputPlane)>> {
        match (&batch.fb.normal, &batch.fb.albedo) {
            (Some(normal), Some(albedo)) => {
                Ok(Some((OutputPlane::of(normal)?, OutputPlane::of(albedo)?)))
            }
            _ => Ok(None),
        }
    }

    /// Wait for the batch and copy the color plane to the host.
    pub fn read_output(&mut self, batch: &mut RenderBatch<D>) -> Result<Vec<f16>> {
        self.wait_for_batch(batch)?;
        let bytes = self.read_buffer_blocking(batch.fb.output.handle(), batch.fb.output.size())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Wait for the batch and copy (normal, albedo) to the host.
    pub fn read_auxiliary(
        &mut self,
        batch: &mut RenderBatch<D>,
    ) -> Result<Option<(Vec<f16>, Vec<f16>)>> {
        self.wait_for_batch(batch)?;
        let (Some(normal), Some(albedo)) = (&batch.fb.normal, &batch.fb.albedo) else {
            return Ok(None);
        };
        let normal = self.read_buffer_blocking(normal.handle(), normal.size())?;
        let albedo = self.read_buffer_blocking(albedo.handle(), albedo.size())?;
        Ok(Some((bytemuck::pod_collect_to_vec(&normal), bytemuck::pod_collect_to_vec(&albedo))))
    }

    fn launch_size(&self) -> (u32, u32, u32) {
        (
            divide_round_up(self.cfg.img_width, LOCAL_WORKGROUP_X),
            divide_round_up(self.cfg.img_height, LOCAL_WORKGROUP_Y),
            self.cfg.batch_size,
        )
    }

    pub(super) fn probe_dims(&self) -> [u32; 3] {
        self.probe_set.as_ref().map_or(DEFAULT_PROBE_GRID, |p| p.grid().dims)
    }

    pub(super) fn push_constants(&self, probe_idx: u32, bounds: Aabb) -> RtPushConstant {
        let [dx, dy, dz] = self.probe_dims();
        let (min, max) = if bounds.is_empty() {
            ([0.0; 4], [0.0; 4])
        } else {
            (bounds.min.extend(0.0).to_array(), bounds.max.extend(0.0).to_array())
        };
        RtPushConstant {
            frame_counter: self.frame_counter,
            probe_idx,
            _pad: [0; 2],
            probe_dim: [dx, dy, dz, 0],
            probe_bbox_min: min,
            probe_bbox_max: max,
        }
    }

    /// Start a command list with the path tracer and all its sets bound.
    fn begin_pass(
        &self,
        state: &PerBatchState<D>,
        cur_buffer: usize,
        env_maps: &EnvMapGroup<D>,
        bounds: Aabb,
    ) -> CommandList {
        let mut cmd = CommandList::new();
        cmd.bind_pipeline(self.pipelines.path_trace);
        cmd.push_constants(bytemuck::bytes_of(&self.push_constants(0, bounds)));
        cmd.bind_group(rt_set::BATCH, state.rt_group(cur_buffer));
        cmd.bind_group(rt_set::ENV_MAPS, env_maps.bind_group());
        if self.pipelines.has_probe_set() {
            if let Some(group) = self.probe_set.as_ref().and_then(|p| p.bind_group()) {
                cmd.bind_group(rt_set::PROBES, group);
            }
        }
        self.scenes.bind(&mut cmd, rt_set::SCENES);
        cmd
    }

    /// Start a command list with the bake pipeline bound. Sets only; the
    /// caller pushes constants per burst.
    pub(super) fn begin_bake_pass(
        &self,
        state: &PerBatchState<D>,
        env_maps: &EnvMapGroup<D>,
    ) -> CommandList {
        let mut cmd = CommandList::new();
        cmd.bind_pipeline(self.pipelines.probe_bake);
        cmd.bind_group(rt_set::BATCH, state.rt_group(0));
        cmd.bind_group(rt_set::ENV_MAPS, env_maps.bind_group());
        self.scenes.bind(&mut cmd, rt_set::SCENES);
        cmd
    }

    /// Rebuild dirty TLASes, then make them visible to the kernels.
    pub(super) fn record_tlas_builds(
        envs: &mut [Environment<D>],
        cmd: &mut CommandList,
    ) -> Result<usize> {
        let mut rebuilt = 0;
        for env in envs.iter_mut() {
            if env.rebuild_tlas(cmd)? {
                rebuilt += 1;
            }
        }
        cmd.barrier(Barrier::memory(
            Stage::AccelerationStructureBuild,
            Stage::ComputeShader,
            Access::ACCELERATION_STRUCTURE_WRITE,
            Access::ACCELERATION_STRUCTURE_READ | Access::SHADER_READ,
        ));
        tracing::trace!(rebuilt, "recorded TLAS builds");
        Ok(rebuilt)
    }

    /// Write every environment's records into the staging parameter buffer.
    /// `camera` replaces each environment's camera when set.
    pub(super) fn pack_params(
        &self,
        envs: &mut [Environment<D>],
        state: &PerBatchState<D>,
        camera: Option<&Camera>,
    ) -> Result<()> {
        let mut transforms: Vec<InstanceTransform> = Vec::new();
        let mut materials: Vec<u32> = Vec::new();
        let mut lights: Vec<PackedLight> = Vec::new();
        let mut packed: Vec<PackedEnv> = Vec::with_capacity(envs.len());

        for env in envs.iter() {
            let r = env.randomization();
            let cam = camera.unwrap_or(env.camera()).pack();
            packed.push(PackedEnv {
                cam,
                prev_cam: env.prev_camera().pack(),
                data: [
                    env.scene().id(),
                    transforms.len() as u32,
                    lights.len() as u32,
                    env.lights().len() as u32,
                ],
                tlas_addr: env.tlas().address(),
                reservoir_grid_addr: 0,
                env_map_rotation: r.env_rotation.to_array(),
                light_filter_and_env_idx: [
                    r.light_filter.x,
                    r.light_filter.y,
                    r.light_filter.z,
                    f32::from_bits(r.env_map_idx),
                ],
            });
            transforms.extend_from_slice(env.transforms());
            materials.extend(env.instance_materials());
            lights.extend_from_slice(env.lights());
        }

        if transforms.len() > self.cfg.max_instances as usize {
            return Err(Error::CapacityExceeded {
                what: "instance",
                requested: transforms.len(),
                capacity: self.cfg.max_instances as usize,
            });
        }
        if lights.len() > self.cfg.max_lights as usize {
            return Err(Error::CapacityExceeded {
                what: "light",
                requested: lights.len(),
                capacity: self.cfg.max_lights as usize,
            });
        }

        let staging = &state.param_staging;
        staging.write(0, bytemuck::cast_slice(&transforms))?;
        staging.write(self.param_cfg.material_indices_offset, bytemuck::cast_slice(&materials))?;
        staging.write(self.param_cfg.lights_offset, bytemuck::cast_slice(&lights))?;
        staging.write(self.param_cfg.env_offset, bytemuck::cast_slice(&packed))?;

        for env in envs.iter_mut() {
            env.advance_camera();
        }
        Ok(())
    }

    /// Copy staged parameters to device memory ahead of the kernels.
    pub(super) fn record_param_upload(&self, cmd: &mut CommandList, state: &PerBatchState<D>) {
        let size = self.param_cfg.total_param_bytes;
        cmd.copy_buffer(
            state.param_staging.handle(),
            state.param_device.handle(),
            &[CopyRegion {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        );
        cmd.barrier(Barrier::buffer(
            state.param_device.handle(),
            0,
            size,
            (Stage::Transfer, Access::TRANSFER_WRITE),
            (Stage::ComputeShader, Access::SHADER_READ),
        ));
    }

    /// Submit on the current render queue and block until done.
    pub(super) fn submit_and_wait(&self, cmd: CommandList, fence: FenceHandle) -> Result<()> {
        let queue = self.queues.compute_queue(self.cur_queue);
        queue.submit(&*self.device, cmd, Some(fence), &[])?;
        self.device.wait_fence(fence)?;
        self.device.reset_fence(fence)
    }

    fn submit_frame(&mut self, cmd: CommandList, batch: &RenderBatch<D>) -> Result<()> {
        let queue = self.queues.compute_queue(self.cur_queue);
        let state = &batch.state;
        match (self.presenter.as_mut(), state.swapchain_ready, state.render_signal) {
            (Some(presenter), Some(ready), Some(rendered)) => {
                let image = presenter.acquire_next(&*self.device, ready)?;
                queue.submit(&*self.device, cmd, Some(state.fence), &[rendered])?;
                presenter.present(&*self.device, queue, image, &[ready, rendered])
            }
            _ => queue.submit(&*self.device, cmd, Some(state.fence), &[]),
        }
    }

    fn run_denoiser(&mut self, fb: &FramebufferState<D>) -> Result<()> {
        let (Some(normal), Some(albedo)) = (&fb.normal, &fb.albedo) else {
            return Err(Error::config("denoise requires auxiliary outputs"));
        };
        let planes = DenoisePlanes {
            hdr: fb.hdr.handle(),
            albedo: albedo.handle(),
            normal: normal.handle(),
            batch_size: self.cfg.batch_size,
            framebuffer: &self.fb_cfg,
        };
        let queue = self.queues.compute_queue(self.cur_queue);
        match self.denoiser.as_mut() {
            Some(denoiser) => denoiser.denoise(&*self.device, queue, &planes),
            None => Ok(()),
        }
    }

    fn write_tiles(state: &PerBatchState<D>, tiles: &TileQueue) -> Result<()> {
        let buffer = state
            .tile_input
            .as_ref()
            .ok_or_else(|| Error::other("adaptive sampling without a tile input buffer"))?;
        let bytes: &[u8] = bytemuck::cast_slice(tiles.units());
        if bytes.len() as u64 > buffer.size() {
            return Err(Error::CapacityExceeded {
                what: "adaptive tile",
                requested: tiles.len(),
                capacity: (buffer.size()
                    / std::mem::size_of::<crate::layout::InputTile>() as u64)
                    as usize,
            });
        }
        buffer.write(0, bytes)
    }

    fn record_adaptive_readback(cmd: &mut CommandList, fb: &FramebufferState<D>) -> Result<()> {
        let (Some(adaptive), Some(adaptive_rb), Some(illum), Some(illum_rb)) = (
            &fb.adaptive,
            &fb.adaptive_readback,
            &fb.illuminance,
            &fb.illuminance_readback,
        ) else {
            return Err(Error::other("adaptive sampling without statistics buffers"));
        };
        cmd.barrier(Barrier::compute_to_transfer());
        for (src, dst) in [(adaptive, adaptive_rb), (illum, illum_rb)] {
            cmd.copy_buffer(
                src.handle(),
                dst.handle(),
                &[CopyRegion {
                    src_offset: 0,
                    dst_offset: 0,
                    size: src.size(),
                }],
            );
        }
        Ok(())
    }

    fn read_statistics(fb: &FramebufferState<D>) -> Result<(Vec<AdaptiveTile>, Vec<f32>)> {
        let (Some(adaptive_rb), Some(illum_rb)) = (&fb.adaptive_readback, &fb.illuminance_readback)
        else {
            return Err(Error::other("adaptive sampling without readback buffers"));
        };
        let mut stats = vec![0u8; adaptive_rb.size() as usize];
        adaptive_rb.read(0, &mut stats)?;
        let mut illum = vec![0u8; illum_rb.size() as usize];
        illum_rb.read(0, &mut illum)?;
        Ok((bytemuck::pod_collect_to_vec(&stats), bytemuck::pod_collect_to_vec(&illum)))
    }

    /// Initial pass over every tile, then refinement passes until every
    /// tile converged or the iteration cap is reached. Returns a fresh
    /// command list with the path tracer bound for the post passes.
    fn run_adaptive(
        &mut self,
        batch: &mut RenderBatch<D>,
        mut cmd: CommandList,
        env_maps: &EnvMapGroup<D>,
        bounds: Aabb,
    ) -> Result<CommandList> {
        let fb = &batch.fb;
        let zeroed = [
            fb.adaptive.as_ref(),
            Some(&fb.hdr),
            fb.illuminance.as_ref(),
            fb.normal.as_ref(),
            fb.albedo.as_ref(),
        ];
        for buffer in zeroed.into_iter().flatten() {
            cmd.fill_buffer(buffer.handle(), 0, buffer.size(), 0);
        }
        cmd.barrier(Barrier::transfer_to_compute());

        let mut tiles = TileQueue::new(&self.fb_cfg, self.cfg.batch_size, self.cfg.spp);
        tiles.fill_initial();
        Self::write_tiles(&batch.state, &tiles)?;
        cmd.dispatch(tiles.len() as u32, 1, 1);
        Self::record_adaptive_readback(&mut cmd, &batch.fb)?;
        self.submit_and_wait(cmd, batch.state.fence)?;

        let mut passes = 0u32;
        for _ in 0..self.cfg.adaptive.max_iterations {
            self.frame_counter = self.frame_counter.wrapping_add(self.cfg.batch_size);
            let (stats, illum) = Self::read_statistics(&batch.fb)?;
            if tiles.refine(&stats, &illum, &self.cfg.adaptive) == 0 {
                break;
            }
            self.advance(RenderStage::AdaptiveRefinement);
            passes += 1;

            let mut cmd = self.begin_pass(&batch.state, batch.cur_buffer, env_maps, bounds);
            Self::write_tiles(&batch.state, &tiles)?;
            cmd.barrier(Barrier::compute_to_compute());
            cmd.dispatch(tiles.len() as u32, 1, 1);
            Self::record_adaptive_readback(&mut cmd, &batch.fb)?;
            self.submit_and_wait(cmd, batch.state.fence)?;
        }
        tracing::debug!(passes, "adaptive refinement finished");

        Ok(self.begin_pass(&batch.state, batch.cur_buffer, env_maps, bounds))
    }

    /// Copy a device buffer to the host through a temporary readback buffer.
    pub(crate) fn read_buffer_blocking(&self, buffer: BufferHandle, bytes: u64) -> Result<Vec<u8>> {
        let readback = GpuBuffer::new(&self.device, &BufferDesc::readback("host readback", bytes))?;
        let mut cmd = CommandList::new();
        cmd.copy_buffer(
            buffer,
            readback.handle(),
            &[CopyRegion {
                src_offset: 0,
                dst_offset: 0,
                size: bytes,
            }],
        );
        self.run_blocking(cmd)?;
        let mut out = vec![0u8; bytes as usize];
        readback.read(0, &mut out)?;
        Ok(out)
    }

    /// Copy a texture's texels to the host.
    pub(crate) fn read_texture_blocking(&self, texture: &GpuTexture<D>) -> Result<Vec<u8>> {
        let readback_desc = BufferDesc::readback("texture readback", texture.byte_size());
        let readback = GpuBuffer::new(&self.device, &readback_desc)?;
        let mut cmd = CommandList::new();
        cmd.copy_texture_to_buffer(texture.handle(), readback.handle(), 0);
        self.run_blocking(cmd)?;
        let mut out = vec![0u8; texture.byte_size() as usize];
        readback.read(0, &mut out)?;
        Ok(out)
    }

    /// Submit on compute queue 0 with a temporary fence and wait.
    pub(super) fn run_blocking(&self, cmd: CommandList) -> Result<()> {
        let fence = self.device.create_fence()?;
        let result = self
            .queues
            .compute_queue(0)
            .submit(&*self.device, cmd, Some(fence), &[])
            .and_then(|_| self.device.wait_fence(fence));
        self.device.destroy_fence(fence);
        result
    }

    pub(super) fn bump_frame_counter(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(self.cfg.batch_size);
    }
}


/// Dirty flag of every environment, in order.
pub(super) fn dirty_flags<D: GpuDevice>(envs: &[Environment<D>]) -> Vec<bool> {
    envs.iter().map(Environment::is_dirty).collect()
}

/// Re-mark environments that were dirty before a frame that failed.
pub(super) fn restore_dirty<D: GpuDevice>(envs: &mut [Environment<D>], dirty: &[bool]) {
    for (env, &was_dirty) in envs.iter_mut().zip(dirty) {
        if was_dirty {
            env.mark_dirty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        use RenderStage::*;
        assert!(Idle.can_advance_to(RecordingTlas));
        assert!(RecordingDispatch.can_advance_to(RecordingPost));
        assert!(AdaptiveRefinement.can_advance_to(AdaptiveRefinement));
        assert!(Submitted.can_advance_to(RecordingTlas));
        assert!(!Idle.can_advance_to(RecordingDispatch));
        assert!(!RecordingPost.can_advance_to(RecordingTlas));
    }
}
