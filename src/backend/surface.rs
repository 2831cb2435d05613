// Presentation surface
//
// The window system is chosen once, from the display handle, out of a small
// closed set. Each variant knows the instance extensions it needs and how to
// turn a native window into a `vk::SurfaceKHR`.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

use super::Instance;
use crate::error::GpuError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceBackend {
    Win32,
    Xlib,
    Xcb,
    Wayland,
}

impl SurfaceBackend {
    /// Pick the backend matching a native display handle
    pub fn from_display(display: RawDisplayHandle) -> Result<Self> {
        match display {
            RawDisplayHandle::Windows(_) => Ok(Self::Win32),
            RawDisplayHandle::Xlib(_) => Ok(Self::Xlib),
            RawDisplayHandle::Xcb(_) => Ok(Self::Xcb),
            RawDisplayHandle::Wayland(_) => Ok(Self::Wayland),
            other => Err(GpuError::UnsupportedWindowSystem(format!("{:?}", other)).into()),
        }
    }

    /// Instance extensions this backend needs to create surfaces
    pub fn required_extensions(self) -> [&'static CStr; 2] {
        let platform = match self {
            Self::Win32 => khr::Win32Surface::name(),
            Self::Xlib => khr::XlibSurface::name(),
            Self::Xcb => khr::XcbSurface::name(),
            Self::Wayland => khr::WaylandSurface::name(),
        };
        [khr::Surface::name(), platform]
    }

    /// # Safety
    /// The handles must refer to a live window that outlives the surface.
    unsafe fn create_surface(
        self,
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR> {
        let entry = instance.entry();
        let handle = instance.handle();

        let surface = match (self, display, window) {
            (Self::Win32, RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
                let hinstance = window.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(window.hwnd.get() as *const std::ffi::c_void);
                khr::Win32Surface::new(entry, handle).create_win32_surface(&create_info, None)?
            }
            (Self::Xlib, RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
                let dpy = display
                    .display
                    .context("Xlib display handle has no display pointer")?;
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.as_ptr() as *mut _)
                    .window(window.window);
                khr::XlibSurface::new(entry, handle).create_xlib_surface(&create_info, None)?
            }
            (Self::Xcb, RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
                let connection = display
                    .connection
                    .context("XCB display handle has no connection")?;
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection.as_ptr() as *mut _)
                    .window(window.window.get());
                khr::XcbSurface::new(entry, handle).create_xcb_surface(&create_info, None)?
            }
            (Self::Wayland, RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr() as *mut _)
                    .surface(window.surface.as_ptr() as *mut _);
                khr::WaylandSurface::new(entry, handle).create_wayland_surface(&create_info, None)?
            }
            (backend, _, window) => {
                return Err(GpuError::UnsupportedWindowSystem(format!(
                    "{:?} backend cannot use window handle {:?}",
                    backend, window
                ))
                .into());
            }
        };

        Ok(surface)
    }
}

/// A window's presentation surface; destroyed before the instance
pub struct Surface {
    surface: vk::SurfaceKHR,
    loader: khr::Surface,
    backend: SurfaceBackend,
    _instance: Arc<Instance>,
}

impl Surface {
    /// Create a surface for a native window.
    ///
    /// `instance` must have been created with `backend.required_extensions()`.
    ///
    /// # Safety
    /// The window behind the handles must stay alive for as long as the
    /// returned surface.
    pub unsafe fn new(
        instance: Arc<Instance>,
        backend: SurfaceBackend,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        let surface = backend
            .create_surface(&instance, display, window)
            .context("Failed to create window surface")?;
        let loader = khr::Surface::new(instance.entry(), instance.handle());

        log::info!("Created {:?} surface", backend);

        Ok(Arc::new(Self {
            surface,
            loader,
            backend,
            _instance: instance,
        }))
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn backend(&self) -> SurfaceBackend {
        self.backend
    }

    /// A failed query counts as "cannot present" after a warning
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
        };
        match supported {
            Ok(supported) => supported,
            Err(e) => {
                log::warn!("Present support query failed for queue family {}: {}", family, e);
                false
            }
        }
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .context("Failed to query surface capabilities")
        }
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .context("Failed to query surface formats")
        }
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .context("Failed to query surface present modes")
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
