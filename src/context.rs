/*! Render context owning the Vulkan instance, surface, device, allocator and
 * swapchain. Immutable after construction except for the VSync-controlled
 * swapchain, which may be rebuilt on invalidation.
 */

use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::Arc,
};

use anyhow::{Context, Result};
use ash::{ext::debug_utils, khr, vk};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// VSync mode to use for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VSyncMode {
    Disabled,
    DoubleBuffering,
    TripleBuffering,
}

/// Swap image count and present mode derived from a [`VSyncMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPresentSetup {
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
}

impl SwapchainPresentSetup {
    pub(crate) fn for_vsync_mode(mode: VSyncMode, mailbox_supported: bool) -> Self {
        match mode {
            VSyncMode::Disabled => Self {
                image_count: 3,
                present_mode: if mailbox_supported {
                    vk::PresentModeKHR::MAILBOX
                } else {
                    vk::PresentModeKHR::FIFO
                },
            },
            VSyncMode::DoubleBuffering => Self {
                image_count: 2,
                present_mode: vk::PresentModeKHR::FIFO,
            },
            VSyncMode::TripleBuffering => Self {
                image_count: 3,
                present_mode: vk::PresentModeKHR::FIFO,
            },
        }
    }
}

/// Surface creation callback. The context calls this exactly once during
/// construction; it is the only window-system touchpoint.
pub type SurfaceCreateFn = dyn FnOnce(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>;

pub struct RenderContextCreateInfo {
    pub surface_create_fn: Box<SurfaceCreateFn>,
    pub instance_extensions: Vec<&'static CStr>,
    pub device_extensions: Vec<&'static CStr>,
    pub enable_ray_tracing: bool,
    pub vsync_mode: VSyncMode,
}

impl RenderContextCreateInfo {
    /// Convenience setup for a raw-window-handle window, using `ash-window`
    /// for surface creation and its required instance extensions.
    pub fn for_window(
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
        vsync_mode: VSyncMode,
    ) -> Result<Self> {
        let instance_extensions = ash_window::enumerate_required_extensions(display_handle)?
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();

        let surface_create_fn = Box::new(
            move |entry: &ash::Entry, instance: &ash::Instance| -> Result<vk::SurfaceKHR> {
                let surface = unsafe {
                    ash_window::create_surface(entry, instance, display_handle, window_handle, None)?
                };
                Ok(surface)
            },
        );

        Ok(Self {
            surface_create_fn,
            instance_extensions,
            device_extensions: vec![],
            enable_ray_tracing: true,
            vsync_mode,
        })
    }
}

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new(extensions: &[&'static CStr]) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("Hotaru").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names = extensions.iter().map(|ext| ext.as_ptr()).collect::<Vec<_>>();
        extension_names.push(debug_utils::NAME.as_ptr());

        let layer_strings = vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()];
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }

    fn get_physical_devices(&self, surface: &Surface) -> Result<Vec<PhysicalDevice>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|phys_device| PhysicalDevice::new_from_vulkan_handle(&self.raw, surface, phys_device))
            .collect::<Result<_>>()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

pub(crate) struct Surface {
    pub(crate) raw_ash: khr::surface::Instance,
    pub(crate) raw_vulkan: vk::SurfaceKHR,
}

impl Surface {
    fn new(instance: &Instance, surface_create_fn: Box<SurfaceCreateFn>) -> Result<Self> {
        let raw_ash = khr::surface::Instance::new(&instance.entry, &instance.raw);
        let raw_vulkan = surface_create_fn(&instance.entry, &instance.raw)?;

        Ok(Self {
            raw_ash,
            raw_vulkan,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.raw_ash.destroy_surface(self.raw_vulkan, None);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    fn new(index: u32, properties: vk::QueueFamilyProperties, supports_present: bool) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    fn supports_graphics(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)
    }

    fn supports_compute(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE)
    }

    fn supports_transfer(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::TRANSFER)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    name: String,
    device_type: vk::PhysicalDeviceType,
    queue_families: Vec<QueueFamily>,
    supported_extensions: Vec<String>,
    supported_present_modes: Vec<vk::PresentModeKHR>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(
        instance: &ash::Instance,
        surface: &Surface,
        raw: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap()
                .to_owned()
        };

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, prop)| {
                let present_support = unsafe {
                    surface.raw_ash.get_physical_device_surface_support(
                        raw,
                        index as _,
                        surface.raw_vulkan,
                    )?
                };
                Ok(QueueFamily::new(index as _, prop, present_support))
            })
            .collect::<Result<_>>()?;

        let extension_properties = unsafe { instance.enumerate_device_extension_properties(raw)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|prop| {
                let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
                name.to_str().unwrap().to_owned()
            })
            .collect();

        let supported_present_modes = unsafe {
            surface
                .raw_ash
                .get_physical_device_surface_present_modes(raw, surface.raw_vulkan)?
        };

        Ok(Self {
            raw,
            name,
            device_type: properties.device_type,
            queue_families,
            supported_extensions,
            supported_present_modes,
        })
    }

    fn supports_extensions(&self, extensions: &[&CStr]) -> bool {
        let supported = self
            .supported_extensions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();

        extensions
            .iter()
            .all(|ext| supported.contains(&ext.to_str().unwrap()))
    }

    fn supports_present(&self) -> bool {
        self.queue_families
            .iter()
            .any(|family| family.supports_graphics() && family.supports_present)
    }

    pub(crate) fn supports_present_mode(&self, mode: vk::PresentModeKHR) -> bool {
        self.supported_present_modes.contains(&mode)
    }
}

/// Queue handles selected at device creation. Graphics and present share one
/// family; transfer uses a dedicated family when available.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
}

pub(crate) struct DeviceQueues {
    pub(crate) graphics: Queue,
    pub(crate) present: Queue,
    pub(crate) transfer: Queue,
}

pub(crate) struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) debug_utils_device: debug_utils::Device,
    pub(crate) physical_device: PhysicalDevice,
    pub(crate) surface: Surface,
    pub(crate) instance: Instance,
}

impl DeviceShared {
    fn new(
        instance: Instance,
        surface: Surface,
        device_extensions: &[&'static CStr],
        enable_ray_tracing: bool,
    ) -> Result<(Self, DeviceQueues)> {
        let physical_devices = instance.get_physical_devices(&surface)?;
        let physical_device = select_physical_device(&physical_devices, device_extensions)?;
        log::info!("Physical device name: {}", physical_device.name);

        let (graphics_family, transfer_family) = select_queue_families(&physical_device)?;

        let raw = Self::new_ash_device(
            &instance,
            &physical_device,
            &[graphics_family, transfer_family],
            device_extensions,
            enable_ray_tracing,
        )?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: enable_ray_tracing,
            allocation_sizes: AllocationSizes::default(),
        })?;
        let allocator = Mutex::new(allocator);

        let debug_utils_device = debug_utils::Device::new(&instance.raw, &raw);

        let graphics = Queue {
            raw: unsafe { raw.get_device_queue(graphics_family.index, 0) },
            family_index: graphics_family.index,
        };
        let transfer = Queue {
            raw: unsafe { raw.get_device_queue(transfer_family.index, 0) },
            family_index: transfer_family.index,
        };
        let queues = DeviceQueues {
            graphics,
            present: graphics,
            transfer,
        };

        Ok((
            Self {
                allocator: ManuallyDrop::new(allocator),
                raw,
                debug_utils_device,
                physical_device,
                surface,
                instance,
            },
            queues,
        ))
    }

    fn new_ash_device(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_families: &[QueueFamily],
        device_extensions: &[&'static CStr],
        enable_ray_tracing: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];

        let queue_create_infos = {
            let mut indices = queue_families
                .iter()
                .map(|family| family.index)
                .collect::<Vec<_>>();

            indices.sort();
            indices.dedup();

            indices
                .iter()
                .map(|index| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(*index)
                        .queue_priorities(&queue_priorities)
                })
                .collect::<Vec<_>>()
        };

        let mut extension_names = vec![khr::swapchain::NAME];
        if enable_ray_tracing {
            extension_names.push(khr::acceleration_structure::NAME);
            extension_names.push(khr::ray_tracing_pipeline::NAME);
            extension_names.push(khr::deferred_host_operations::NAME);
        }
        extension_names.extend_from_slice(device_extensions);
        let extension_name_ptrs = extension_names
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<_>>();

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .buffer_device_address(enable_ray_tracing)
            .scalar_block_layout(true);
        let mut vulkan13_features =
            vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);
        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut device_features2 = vk::PhysicalDeviceFeatures2::default();
        unsafe {
            instance
                .raw
                .get_physical_device_features2(physical_device.raw, &mut device_features2);
        }
        device_features2 = device_features2
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);
        if enable_ray_tracing {
            device_features2 = device_features2
                .push_next(&mut acceleration_structure_features)
                .push_next(&mut ray_tracing_pipeline_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_name_ptrs)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)?
        };

        Ok(device)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            log::trace!("Logical device dropped");
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

/// Selects a physical device that can present to the surface and supports all
/// requested extensions, preferring discrete GPUs.
fn select_physical_device(
    devices: &[PhysicalDevice],
    required_extensions: &[&'static CStr],
) -> Result<PhysicalDevice> {
    let mut candidates = devices
        .iter()
        .filter(|device| {
            device.supports_present() && device.supports_extensions(required_extensions)
        })
        .collect::<Vec<_>>();

    candidates.sort_by_key(|device| match device.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 2,
    });

    candidates
        .first()
        .map(|device| (*device).clone())
        .ok_or_else(|| anyhow::anyhow!("No suitable GPU found for requested surface/extensions"))
}

/// Selects the graphics+present family and a transfer family. Falls back to
/// the graphics family when no dedicated transfer family exists.
fn select_queue_families(device: &PhysicalDevice) -> Result<(QueueFamily, QueueFamily)> {
    let graphics = device
        .queue_families
        .iter()
        .find(|family| {
            family.properties.queue_count > 0
                && family.supports_graphics()
                && family.supports_present
        })
        .copied()
        .ok_or_else(|| anyhow::anyhow!("No graphics queue family with present support"))?;

    let transfer = device
        .queue_families
        .iter()
        .find(|family| {
            family.properties.queue_count > 0
                && family.supports_transfer()
                && !family.supports_graphics()
                && !family.supports_compute()
        })
        .copied()
        .unwrap_or(graphics);

    Ok((graphics, transfer))
}

/// Snapshot of the swapchain state handed to invalidation callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainProperties {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

pub(crate) struct Swapchain {
    raw_ash: khr::swapchain::Device,
    raw_vulkan: vk::SwapchainKHR,
    images_raw: Vec<vk::Image>,
    pub(crate) image_views_raw: Vec<vk::ImageView>,
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    device: Arc<DeviceShared>,
}

impl Swapchain {
    fn new(
        device: Arc<DeviceShared>,
        setup: SwapchainPresentSetup,
        shared_format: Option<vk::SurfaceFormatKHR>,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let surface_format = match shared_format {
            Some(format) => format,
            None => {
                let formats = unsafe {
                    device.surface.raw_ash.get_physical_device_surface_formats(
                        device.physical_device.raw,
                        device.surface.raw_vulkan,
                    )?
                };

                *formats
                    .iter()
                    .find(|format| {
                        format.format == vk::Format::B8G8R8A8_UNORM
                            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                    })
                    .unwrap_or(&formats[0])
            }
        };

        let capabilities = unsafe {
            device
                .surface
                .raw_ash
                .get_physical_device_surface_capabilities(
                    device.physical_device.raw,
                    device.surface.raw_vulkan,
                )?
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            capabilities.max_image_extent
        };

        let mut image_count = setup.image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count != 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        log::debug!(
            "Swapchain extent: {} x {}, image count {}, present mode {:?}",
            extent.width,
            extent.height,
            image_count,
            setup.present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface.raw_vulkan)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(setup.present_mode)
            .old_swapchain(old_swapchain);

        let raw_ash = khr::swapchain::Device::new(&device.instance.raw, &device.raw);
        let raw_vulkan = unsafe { raw_ash.create_swapchain(&create_info, None)? };

        let images_raw = unsafe { raw_ash.get_swapchain_images(raw_vulkan)? };
        let image_views_raw = images_raw
            .iter()
            .map(|image| {
                let image_view_info = vk::ImageViewCreateInfo::default()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                Ok(unsafe { device.raw.create_image_view(&image_view_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device,
            raw_ash,
            raw_vulkan,
            images_raw,
            image_views_raw,
            surface_format,
            extent,
        })
    }

    pub(crate) fn acquire_next_image(
        &mut self,
        signal_semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        unsafe {
            self.raw_ash.acquire_next_image(
                self.raw_vulkan,
                u64::MAX,
                signal_semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Returns whether the swapchain is suboptimal for the surface.
    pub(crate) fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        image_index: u32,
    ) -> std::result::Result<bool, vk::Result> {
        let swapchains = [self.raw_vulkan];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.raw_ash.queue_present(queue, &present_info) }
    }

    pub(crate) fn image_count(&self) -> u32 {
        self.images_raw.len() as u32
    }

    pub(crate) fn properties(&self) -> SwapchainProperties {
        SwapchainProperties {
            format: self.surface_format.format,
            extent: self.extent,
            image_count: self.image_count(),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for image_view in self.image_views_raw.drain(..) {
                self.device.raw.destroy_image_view(image_view, None);
            }
            self.raw_ash.destroy_swapchain(self.raw_vulkan, None);
        }
    }
}

struct ContextConfig {
    vsync_mode: VSyncMode,
}

/// The render context manages the Vulkan instance, device, queues and
/// swapchain state. Members are internally mutable where recreation demands
/// it; pass the context around as an immutable reference.
pub struct RenderContext {
    pub(crate) swapchain: Mutex<Swapchain>,
    pub(crate) queues: DeviceQueues,
    config: Mutex<ContextConfig>,
    pub(crate) shared: Arc<DeviceShared>,
}

impl RenderContext {
    pub fn new(create_info: RenderContextCreateInfo) -> Result<Self> {
        let instance = Instance::new(&create_info.instance_extensions)?;
        let surface = Surface::new(&instance, create_info.surface_create_fn)?;
        let (shared, queues) = DeviceShared::new(
            instance,
            surface,
            &create_info.device_extensions,
            create_info.enable_ray_tracing,
        )?;
        let shared = Arc::new(shared);

        let setup = SwapchainPresentSetup::for_vsync_mode(
            create_info.vsync_mode,
            shared
                .physical_device
                .supports_present_mode(vk::PresentModeKHR::MAILBOX),
        );
        let swapchain = Mutex::new(Swapchain::new(
            shared.clone(),
            setup,
            None,
            vk::SwapchainKHR::null(),
        )?);

        Ok(Self {
            swapchain,
            queues,
            config: Mutex::new(ContextConfig {
                vsync_mode: create_info.vsync_mode,
            }),
            shared,
        })
    }

    /// Sets the VSync mode, rebuilding the swapchain. Setting the mode the
    /// context already uses is a no-op.
    pub fn set_vsync_mode(&self, vsync_mode: VSyncMode) -> Result<()> {
        {
            let mut config = self.config.lock();
            if config.vsync_mode == vsync_mode {
                return Ok(());
            }
            config.vsync_mode = vsync_mode;
        }

        self.recreate_swapchain()
    }

    pub fn vsync_mode(&self) -> VSyncMode {
        self.config.lock().vsync_mode
    }

    /// Rebuilds the swapchain at the current surface extent. The new chain is
    /// created before the previous one is destroyed so the driver can recycle
    /// swap images.
    pub fn recreate_swapchain(&self) -> Result<()> {
        self.device_wait_idle()
            .with_context(|| "Device lost while waiting for idle before swapchain recreation")?;

        let setup = SwapchainPresentSetup::for_vsync_mode(
            self.config.lock().vsync_mode,
            self.shared
                .physical_device
                .supports_present_mode(vk::PresentModeKHR::MAILBOX),
        );

        let mut swapchain = self.swapchain.lock();
        log::debug!("Recreating swapchain...");
        let new_swapchain = Swapchain::new(
            self.shared.clone(),
            setup,
            Some(swapchain.surface_format),
            swapchain.raw_vulkan,
        )?;
        let old_swapchain = std::mem::replace(&mut *swapchain, new_swapchain);
        drop(old_swapchain);
        log::debug!("Done recreating swapchain.");

        Ok(())
    }

    /// Queries the surface for its current pixel extent. A zero extent means
    /// the window is minimized and no image can be acquired.
    pub fn surface_extent(&self) -> Result<vk::Extent2D> {
        let capabilities = unsafe {
            self.shared
                .surface
                .raw_ash
                .get_physical_device_surface_capabilities(
                    self.shared.physical_device.raw,
                    self.shared.surface.raw_vulkan,
                )?
        };

        Ok(capabilities.current_extent)
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.lock().extent
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.lock().surface_format.format
    }

    pub fn swapchain_properties(&self) -> SwapchainProperties {
        self.swapchain.lock().properties()
    }

    pub fn device_wait_idle(&self) -> Result<()> {
        unsafe {
            self.shared.raw.device_wait_idle()?;
        }
        Ok(())
    }

    pub(crate) fn device(&self) -> &ash::Device {
        &self.shared.raw
    }

    /// Records commands into a transient command buffer, submits them on the
    /// given queue and blocks until the queue drains. Used for uploads and
    /// acceleration-structure builds outside the frame loop.
    pub(crate) fn execute_one_shot<F>(&self, queue: Queue, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let device = self.device();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue.family_index);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let result = (|| {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info)?[0] };

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                device.begin_command_buffer(command_buffer, &begin_info)?;
            }

            record(command_buffer);

            unsafe {
                device.end_command_buffer(command_buffer)?;

                let command_buffer_info =
                    vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer);
                let submit_info = vk::SubmitInfo2::default()
                    .command_buffer_infos(std::slice::from_ref(&command_buffer_info));
                device.queue_submit2(
                    queue.raw,
                    std::slice::from_ref(&submit_info),
                    vk::Fence::null(),
                )?;
                device.queue_wait_idle(queue.raw)?;
            }

            Ok(())
        })();

        unsafe {
            device.destroy_command_pool(pool, None);
        }

        result
    }

    pub(crate) fn execute_one_shot_graphics<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        self.execute_one_shot(self.queues.graphics, record)
    }

    pub(crate) fn execute_one_shot_transfer<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        self.execute_one_shot(self.queues.transfer, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vsync_mode_present_setup() {
        let disabled = SwapchainPresentSetup::for_vsync_mode(VSyncMode::Disabled, true);
        assert_eq!(disabled.image_count, 3);
        assert_eq!(disabled.present_mode, vk::PresentModeKHR::MAILBOX);

        let disabled_no_mailbox = SwapchainPresentSetup::for_vsync_mode(VSyncMode::Disabled, false);
        assert_eq!(disabled_no_mailbox.image_count, 3);
        assert_eq!(disabled_no_mailbox.present_mode, vk::PresentModeKHR::FIFO);

        let double = SwapchainPresentSetup::for_vsync_mode(VSyncMode::DoubleBuffering, true);
        assert_eq!(double.image_count, 2);
        assert_eq!(double.present_mode, vk::PresentModeKHR::FIFO);

        let triple = SwapchainPresentSetup::for_vsync_mode(VSyncMode::TripleBuffering, true);
        assert_eq!(triple.image_count, 3);
        assert_eq!(triple.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_vsync_mode_setup_is_stable() {
        // Same mode twice yields an identical setup, so a mode toggle X -> X
        // never forces a swapchain rebuild.
        for mode in [
            VSyncMode::Disabled,
            VSyncMode::DoubleBuffering,
            VSyncMode::TripleBuffering,
        ] {
            assert_eq!(
                SwapchainPresentSetup::for_vsync_mode(mode, true),
                SwapchainPresentSetup::for_vsync_mode(mode, true),
            );
        }
    }
}
