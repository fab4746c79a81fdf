//! lumen - driver binary.
//!
//! Opens a window, brings up the device, loads the configured scene, streams
//! its textures through the decode worker and runs the frame ring until the
//! window closes.

use std::sync::Arc;

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, trace, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

use lumen_core::{BlobStore, FrameClock, RendererConfig};
use lumen_renderer::gpu_types::LightCount;
use lumen_renderer::{
    AsyncDecodeWorker, DecodeRequest, DecodeTarget, FrameRing, IndefiniteArrayResource,
    MaterialTable, PointLightBuffer, PresentAttachments, PresentPass, SwapSurface, TextureKind,
    TextureRegistry,
};
use lumen_resources::{ImageCrateDecoder, SceneDescription, load_scene};
use lumen_rhi::context::DeviceContext;
use lumen_rhi::instance::Instance;
use lumen_rhi::physical_device::select_physical_device;
use lumen_rhi::surface::Surface;
use lumen_rhi::{GpuDevice, RhiResult, vk};

/// Preference key for the camera speed.
const CAMERA_SPEED_KEY: &str = "cameraMovementSpeed";
const DEFAULT_CAMERA_SPEED: f32 = 1.0;
const CAMERA_SPEED_STEP: f32 = 1.25;

const MAX_POINT_LIGHTS: u32 = 256;

/// Texture slots of a material, in the order the material table asks for them.
const MATERIAL_TEXTURE_KINDS: [TextureKind; 3] = [
    TextureKind::BaseColor,
    TextureKind::MetallicRoughness,
    TextureKind::Normal,
];

/// Per-frame payload of the ring.
///
/// The light index list is rewritten in the transfer step, so each frame
/// needs its own copy.
struct FrameResources {
    slot: usize,
    light_indices: IndefiniteArrayResource<LightCount, u32, DeviceContext>,
    light_index_set: vk::DescriptorSet,
}

impl FrameResources {
    fn new(context: &Arc<DeviceContext>, slot: usize, capacity: u32) -> RhiResult<Self> {
        let light_indices = IndefiniteArrayResource::new(
            context.clone(),
            capacity,
            &format!("light indices {}", slot),
        )?;
        let light_index_set = light_indices
            .create_descriptor_set(vk::ShaderStageFlags::FRAGMENT | vk::ShaderStageFlags::COMPUTE)?;
        Ok(Self {
            slot,
            light_indices,
            light_index_set,
        })
    }

    /// Publishes the lights this frame shades with.
    fn update_light_indices(&mut self, indices: &[u32]) -> RhiResult<()> {
        let count = u32::try_from(indices.len()).unwrap_or(u32::MAX);
        self.light_indices
            .update_whole(&LightCount::new(count), indices, 0)
    }
}

/// Descriptor sets shared by every frame.
struct SceneSets {
    lights: vk::DescriptorSet,
    materials: vk::DescriptorSet,
}

impl SceneSets {
    fn new(
        context: &DeviceContext,
        lights: &PointLightBuffer<DeviceContext>,
        materials: &MaterialTable<DeviceContext>,
    ) -> RhiResult<Self> {
        let stages = vk::ShaderStageFlags::FRAGMENT;
        let light_set = lights.create_descriptor_set(stages | vk::ShaderStageFlags::COMPUTE)?;
        let material_set = context.create_descriptor_set(&[materials.layout_binding(0, stages)])?;
        context.write_buffer_bindings(material_set, &[materials.buffer_binding(0)]);
        Ok(Self {
            lights: light_set,
            materials: material_set,
        })
    }
}

/// Everything that lives on the GPU side.
///
/// Field order is drop order: frames first, the instance last.
struct Gpu {
    ring: FrameRing<DeviceContext, FrameResources>,
    decoder: AsyncDecodeWorker<DeviceContext>,
    textures: TextureRegistry,
    lights: PointLightBuffer<DeviceContext>,
    materials: MaterialTable<DeviceContext>,
    scene_sets: SceneSets,
    light_indices: Vec<u32>,
    surface: SwapSurface,
    attachments: Vec<PresentAttachments>,
    pass: PresentPass,
    context: Arc<DeviceContext>,
    _instance: Instance,
}

impl Gpu {
    fn new(config: &RendererConfig, window: &Window) -> Result<Self> {
        let display = window.display_handle()?.as_raw();
        let handle = window.window_handle()?.as_raw();

        let instance = Instance::new(config.enable_validation, Some(display))
            .context("Failed to create Vulkan instance")?;
        let surface = Surface::new(&instance, display, handle)?;
        let physical = select_physical_device(instance.handle(), surface.handle(), surface.loader())
            .context("No GPU can drive this window")?;
        let context = DeviceContext::new(&instance, &physical)?;

        let size = window.inner_size();
        let surface = SwapSurface::new(
            &instance,
            context.clone(),
            surface,
            size.width,
            size.height,
            config.frames_in_flight,
        )?;

        let mut decoder = AsyncDecodeWorker::start(
            context.clone(),
            Arc::new(ImageCrateDecoder),
            config.staging_slots,
            config.staging_slot_size(),
        )?;
        let mut textures = TextureRegistry::new(context.clone(), config.frames_in_flight)?;

        let scene = match &config.scene_path {
            Some(path) => load_scene(path)
                .with_context(|| format!("Failed to load scene '{}'", path.display()))?,
            None => {
                info!("No scene configured (set LUMEN_SCENE to load one)");
                SceneDescription::default()
            }
        };

        let capacity = scene.materials.len().max(1) as u32;
        let mut materials = MaterialTable::new(context.clone(), capacity)?;
        let mut requests = Vec::new();
        let mut asked = 0usize;
        materials.extend_from_scene(&scene.materials, |path| {
            let material = (asked / MATERIAL_TEXTURE_KINDS.len()) as u32;
            let kind = MATERIAL_TEXTURE_KINDS[asked % MATERIAL_TEXTURE_KINDS.len()];
            asked += 1;

            let path = path?;
            let target = DecodeTarget::Material { material, kind };
            let (index, fresh) = textures.reserve(path, target);
            if fresh {
                requests.push(DecodeRequest::new(path, 4, target).with_srgb(kind.is_srgb()));
            }
            Some(index)
        })?;
        for request in requests {
            decoder.submit(request)?;
        }

        let light_capacity = MAX_POINT_LIGHTS.max(scene.point_lights.len() as u32);
        let mut lights = PointLightBuffer::new(context.clone(), light_capacity)?;
        lights.add_lights(&scene.point_lights)?;

        info!(
            "Scene ready: {} mesh(es), {} vertices, {} material(s), {} light(s), {} texture(s) queued",
            scene.meshes.len(),
            scene.vertex_count(),
            materials.len(),
            lights.count(),
            decoder.outstanding()
        );

        let scene_sets = SceneSets::new(&context, &lights, &materials)?;
        let light_indices: Vec<u32> = (0..lights.count()).collect();

        let ring = FrameRing::new(context.clone(), config.frames_in_flight, |slot, device| {
            FrameResources::new(device, slot, light_capacity)
        })?;
        let attachments = surface.all_attachments();

        Ok(Self {
            ring,
            decoder,
            textures,
            lights,
            materials,
            scene_sets,
            light_indices,
            surface,
            attachments,
            pass: PresentPass::new(),
            context,
            _instance: instance,
        })
    }

    /// Runs one frame. Surface staleness comes back as an error so the
    /// caller can rebuild.
    fn render(&mut self) -> RhiResult<()> {
        let Self {
            ring,
            decoder,
            textures,
            scene_sets,
            light_indices,
            surface,
            attachments,
            pass,
            context,
            ..
        } = self;

        ring.perform_frame(
            surface,
            |frame| {
                frame.update_light_indices(light_indices)?;
                let report = decoder.drain_results(|completion, staging| {
                    textures.upload_from_staging(completion, staging).map(drop)
                })?;
                if report.completed > 0 || !report.failures.is_empty() {
                    debug!(
                        "Frame slot {}: {} texture(s) uploaded, {} failed, {} pending",
                        frame.slot,
                        report.completed,
                        report.failures.len(),
                        decoder.outstanding()
                    );
                }
                Ok(())
            },
            |frame, cmd, image_index, _| {
                let target = &attachments[image_index as usize];
                let recorder = context.recorder(cmd);
                pass.record(
                    &recorder,
                    target,
                    |_| {
                        trace!(
                            "Slot {} draws with sets {:?} {:?} {:?}",
                            frame.slot,
                            scene_sets.lights,
                            scene_sets.materials,
                            frame.light_index_set
                        );
                        Ok(())
                    },
                    None,
                )
            },
        )?;
        textures.end_frame();
        Ok(())
    }

    fn rebuild(&mut self, size: PhysicalSize<u32>) -> RhiResult<()> {
        self.surface.rebuild(size.width, size.height)?;
        self.attachments = self.surface.all_attachments();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.ring.wait_all() {
            warn!("Waiting for frames in flight failed: {}", e);
        }
        self.decoder.stop();
        if let Err(e) = self.context.wait_idle() {
            warn!("Device wait idle failed: {}", e);
        }
        self.textures.release_retired();
        debug!(
            "Shut down with {} material(s), {} light(s) and {} texture(s)",
            self.materials.len(),
            self.lights.count(),
            self.textures.len()
        );
    }
}

struct App {
    config: RendererConfig,
    store: BlobStore,
    camera_speed: f32,
    clock: FrameClock,
    // Declared before the window: the surface must go first.
    gpu: Option<Gpu>,
    window: Option<Arc<Window>>,
    needs_rebuild: bool,
}

impl App {
    fn new(config: RendererConfig) -> Result<Self> {
        let store = BlobStore::open(&config.store_dir)
            .with_context(|| format!("Failed to open store at '{}'", config.store_dir.display()))?;
        let camera_speed = match store.fetch_f32(CAMERA_SPEED_KEY) {
            Ok(Some(speed)) => speed,
            Ok(None) => DEFAULT_CAMERA_SPEED,
            Err(e) => {
                warn!("Ignoring stored camera speed: {}", e);
                DEFAULT_CAMERA_SPEED
            }
        };
        info!("Camera movement speed: {}", camera_speed);

        Ok(Self {
            config,
            store,
            camera_speed,
            clock: FrameClock::new(),
            gpu: None,
            window: None,
            needs_rebuild: false,
        })
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = WindowAttributes::default()
            .with_title("lumen")
            .with_inner_size(PhysicalSize::new(
                self.config.window_width,
                self.config.window_height,
            ))
            .with_resizable(true);
        let window = Arc::new(event_loop.create_window(attrs)?);

        self.gpu = Some(Gpu::new(&self.config, &window)?);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(gpu), Some(window)) = (self.gpu.as_mut(), self.window.as_ref()) else {
            return;
        };

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return;
        }

        if self.needs_rebuild {
            if let Err(e) = gpu.rebuild(size) {
                error!("Failed to rebuild swap surface: {}", e);
                event_loop.exit();
                return;
            }
            self.needs_rebuild = false;
        }

        match gpu.render() {
            Ok(()) => {
                if let (_, Some(fps)) = self.clock.tick() {
                    info!("{:.1} fps", fps);
                }
            }
            Err(e) if e.is_surface_out_of_date() => {
                debug!("Swap surface out of date, rebuilding before next frame");
                self.needs_rebuild = true;
            }
            Err(e) => {
                error!("Render error: {}", e);
                event_loop.exit();
            }
        }
    }

    fn adjust_camera_speed(&mut self, key: KeyCode) {
        let speed = match key {
            KeyCode::Equal | KeyCode::NumpadAdd => self.camera_speed * CAMERA_SPEED_STEP,
            KeyCode::Minus | KeyCode::NumpadSubtract => self.camera_speed / CAMERA_SPEED_STEP,
            _ => return,
        };
        self.camera_speed = speed;
        debug!("Camera movement speed: {}", speed);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            error!("Initialization failed: {:#}", e);
            event_loop.exit();
            return;
        }
        info!("Initialization complete, entering main loop");
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_rebuild = true;
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.adjust_camera_speed(key),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.shutdown();
        }
        self.gpu = None;

        if let Err(e) = self.store.store_f32(CAMERA_SPEED_KEY, self.camera_speed) {
            warn!("Failed to save camera speed: {}", e);
        }
    }
}

fn main() -> Result<()> {
    lumen_core::init_logging();
    info!("Starting lumen");

    let config = RendererConfig::from_env().context("Invalid configuration")?;
    let mut app = App::new(config)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run_app(&mut app)?;

    Ok(())
}
