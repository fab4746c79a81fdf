//! Window surface ownership.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// RAII wrapper for a Vulkan surface.
///
/// The instance must outlive the surface.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Creates a surface for a native window.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceError`] if the platform has no Vulkan
    /// surface support or creation fails.
    pub fn new(
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> RhiResult<Self> {
        // SAFETY: the handles come from a live window and the instance was
        // created with the extensions this display needs.
        let handle = unsafe {
            ash_window::create_surface(instance.entry(), instance.handle(), display, window, None)
                .map_err(|e| RhiError::SurfaceError(format!("Failed to create surface: {}", e)))?
        };

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        info!("Vulkan surface created");

        Ok(Self { handle, loader })
    }

    /// Returns the raw Vulkan surface handle.
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Returns the surface extension loader.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        debug!("Vulkan surface destroyed");
    }
}
