// Physical device (GPU) selection.
//
// Every adapter is enumerated, its queue families are classified, and the
// adapter is scored. Adapters that cannot present to the window surface (or
// lack the swapchain extension) score `-1` and are never picked. Among the
// rest the strictly highest score wins; ties keep the first one enumerated.
//
// Weighting:
//
// | criterion                          | points |
// |------------------------------------|--------|
// | discrete GPU                       | 100    |
// | integrated GPU                     | 50     |
// | CPU / software rasteriser          | 10     |
// | compute family != graphics family  | 20     |
// | transfer family != graphics family | 10     |
// | compute family != transfer family  | 5      |
// | largest device-local heap          | 1/MiB  |

use anyhow::Result;
use ash::extensions::khr;
use ash::vk;
use std::ffi::CStr;

use super::{Instance, Surface};
use crate::error::GpuError;

/// Score given to adapters that must never be selected
pub const EXCLUDED: i64 = -1;

/// Queue family indices discovered on one adapter; `None` is unassigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Graphics family that can also present (when a surface is involved)
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Families to request queues from: graphics first, then compute and
    /// transfer only when they add a family not already listed.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for family in [self.graphics, self.compute, self.transfer].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }

    fn distinct(a: Option<u32>, b: Option<u32>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a != b)
    }
}

/// Classify queue families by flag matching.
///
/// `can_present` is asked only about graphics-capable families. Compute and
/// transfer prefer dedicated families; when none exists the first family
/// exposing the capability at all is used, which may be the graphics one.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let usable = || {
        families
            .iter()
            .enumerate()
            .filter(|(_, props)| props.queue_count > 0)
            .map(|(i, props)| (i as u32, props.queue_flags))
    };

    let graphics = usable()
        .find(|&(i, flags)| flags.contains(vk::QueueFlags::GRAPHICS) && can_present(i))
        .map(|(i, _)| i);

    let compute = usable()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .or_else(|| usable().find(|(_, flags)| flags.contains(vk::QueueFlags::COMPUTE)))
        .map(|(i, _)| i);

    let transfer = usable()
        .find(|(_, flags)| {
            flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .or_else(|| usable().find(|(_, flags)| flags.contains(vk::QueueFlags::TRANSFER)))
        .map(|(i, _)| i);

    QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    }
}

/// A physical device and everything learned about it during selection.
#[derive(Clone)]
pub struct AdapterCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    /// Swapchain extension available; `None` when selecting without a surface
    pub presentation: Option<bool>,
}

impl AdapterCandidate {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Size of the largest device-local heap in bytes
    pub fn device_local_heap(&self) -> u64 {
        let count = self.memory_properties.memory_heap_count as usize;
        self.memory_properties.memory_heaps[..count]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .max()
            .unwrap_or(0)
    }

    /// Whether the swapchain extension must be enabled on the logical device
    pub fn needs_swapchain(&self) -> bool {
        self.presentation.is_some()
    }
}

impl std::fmt::Debug for AdapterCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCandidate")
            .field("name", &self.name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .field("presentation", &self.presentation)
            .finish()
    }
}

/// Rate an adapter; higher is better, [`EXCLUDED`] means never select.
pub fn score_adapter(candidate: &AdapterCandidate) -> i64 {
    let families = &candidate.queue_families;

    if families.graphics.is_none() || candidate.presentation == Some(false) {
        return EXCLUDED;
    }

    let mut score = match candidate.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 50,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 0,
    };

    if QueueFamilyIndices::distinct(families.compute, families.graphics) {
        score += 20;
    }
    if QueueFamilyIndices::distinct(families.transfer, families.graphics) {
        score += 10;
    }
    if QueueFamilyIndices::distinct(families.compute, families.transfer) {
        score += 5;
    }

    score + (candidate.device_local_heap() / (1024 * 1024)) as i64
}

/// Index of the winning score: strictly highest non-negative, first on ties.
pub fn pick_best(scores: impl IntoIterator<Item = i64>) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (index, score) in scores.into_iter().enumerate() {
        if score < 0 {
            continue;
        }
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

/// Enumerate adapters and pick the best one.
///
/// With a surface, presenting to it from the graphics family and the
/// swapchain extension are both mandatory. Without one (headless use) those
/// checks are skipped.
pub fn select_adapter(instance: &Instance, surface: Option<&Surface>) -> Result<AdapterCandidate> {
    let handle = instance.handle();
    let devices = unsafe { handle.enumerate_physical_devices() }?;

    log::info!("Found {} GPU(s)", devices.len());

    let mut candidates = devices
        .into_iter()
        .map(|device| describe_adapter(handle, device, surface))
        .collect::<Result<Vec<_>>>()?;

    let scores: Vec<i64> = candidates.iter().map(score_adapter).collect();
    for (candidate, score) in candidates.iter().zip(&scores) {
        log::info!(
            "GPU '{}' ({}) - Score: {}",
            candidate.name(),
            candidate.device_type_name(),
            score
        );
    }

    let index = pick_best(scores.iter().copied()).ok_or(GpuError::NoSuitableAdapter)?;
    let selected = candidates.swap_remove(index);

    let version = selected.properties.api_version;
    log::info!(
        "Selected GPU: '{}' - Vulkan {}.{}.{}, queues {:?}",
        selected.name(),
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version),
        selected.queue_families
    );

    Ok(selected)
}

fn describe_adapter(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<&Surface>,
) -> Result<AdapterCandidate> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let queue_families = find_queue_families(&families, |family| {
        surface.map_or(true, |surface| surface.supports_present(device, family))
    });

    let presentation = match surface {
        Some(_) => Some(supports_swapchain_extension(instance, device)?),
        None => None,
    };

    Ok(AdapterCandidate {
        physical_device: device,
        properties,
        memory_properties,
        queue_families,
        presentation,
    })
}

fn supports_swapchain_extension(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
    Ok(has_extension(&extensions, khr::Swapchain::name()))
}

/// Whether `wanted` is among the driver-reported (nul-terminated) names
pub fn has_extension(extensions: &[vk::ExtensionProperties], wanted: &CStr) -> bool {
    extensions.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == wanted
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut ext = vk::ExtensionProperties::default();
        for (dst, &byte) in ext.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = byte as std::ffi::c_char;
        }
        ext
    }

    #[test]
    fn swapchain_extension_is_found_by_exact_name() {
        let listed = [extension(c"VK_KHR_maintenance1"), extension(khr::Swapchain::name())];
        assert!(has_extension(&listed, khr::Swapchain::name()));

        let prefix_only = [extension(c"VK_KHR_swap")];
        assert!(!has_extension(&prefix_only, khr::Swapchain::name()));
        assert!(!has_extension(&[], khr::Swapchain::name()));
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(
        device_type: vk::PhysicalDeviceType,
        heap_mib: u64,
        queue_families: QueueFamilyIndices,
    ) -> AdapterCandidate {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: heap_mib * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        AdapterCandidate {
            physical_device: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            memory_properties,
            queue_families,
            presentation: Some(true),
        }
    }

    fn graphics_only() -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: Some(0),
            compute: Some(0),
            transfer: Some(0),
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: Some(0),
                compute: Some(1),
                transfer: Some(2),
            }
        );
        assert_eq!(indices.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn fallback_pass_may_alias_graphics() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices, graphics_only());
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = find_queue_families(&families, |i| i == 1);
        assert_eq!(indices.graphics, Some(1));

        let none = find_queue_families(&families, |_| false);
        assert_eq!(none.graphics, None);
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(find_queue_families(&families, |_| true).graphics, Some(1));
    }

    #[test]
    fn transfer_without_flag_stays_unassigned() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.transfer, None);
        assert_eq!(indices.compute, None);
    }

    #[test]
    fn score_adds_type_queue_and_heap_terms() {
        let discrete = candidate(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            8192,
            QueueFamilyIndices {
                graphics: Some(0),
                compute: Some(1),
                transfer: Some(2),
            },
        );
        assert_eq!(score_adapter(&discrete), 100 + 20 + 10 + 5 + 8192);

        let integrated = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, 512, graphics_only());
        assert_eq!(score_adapter(&integrated), 50 + 512);

        let cpu = candidate(vk::PhysicalDeviceType::CPU, 0, graphics_only());
        assert_eq!(score_adapter(&cpu), 10);
    }

    #[test]
    fn unassigned_families_earn_no_bonus() {
        let adapter = candidate(
            vk::PhysicalDeviceType::OTHER,
            0,
            QueueFamilyIndices {
                graphics: Some(0),
                compute: None,
                transfer: None,
            },
        );
        assert_eq!(score_adapter(&adapter), 0);
    }

    #[test]
    fn adapters_without_presentation_are_excluded() {
        let mut no_extension = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 24_000, graphics_only());
        no_extension.presentation = Some(false);
        assert_eq!(score_adapter(&no_extension), EXCLUDED);

        let no_present_family = candidate(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            24_000,
            QueueFamilyIndices {
                graphics: None,
                compute: Some(1),
                transfer: Some(2),
            },
        );
        assert_eq!(score_adapter(&no_present_family), EXCLUDED);

        let weak = candidate(vk::PhysicalDeviceType::CPU, 0, graphics_only());
        let scores = [no_extension, no_present_family, weak].iter().map(score_adapter).collect::<Vec<_>>();
        assert_eq!(pick_best(scores), Some(2));
    }

    #[test]
    fn headless_candidates_skip_presentation_checks() {
        let mut headless = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, 0, graphics_only());
        headless.presentation = None;
        assert_eq!(score_adapter(&headless), 50);
        assert!(!headless.needs_swapchain());
    }

    #[test]
    fn highest_score_wins_and_ties_keep_first() {
        assert_eq!(pick_best([10, 50, 30]), Some(1));
        assert_eq!(pick_best([50, 70, 70, 10]), Some(1));
        assert_eq!(pick_best([0]), Some(0));
    }

    #[test]
    fn nothing_selectable_yields_none() {
        assert_eq!(pick_best([EXCLUDED, EXCLUDED]), None);
        assert_eq!(pick_best(std::iter::empty::<i64>()), None);
    }

    #[test]
    fn largest_device_local_heap_counts() {
        let mut adapter = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 256, graphics_only());
        adapter.memory_properties.memory_heap_count = 3;
        adapter.memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 4096 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        adapter.memory_properties.memory_heaps[2] = vk::MemoryHeap {
            size: 65536 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::empty(),
        };
        assert_eq!(adapter.device_local_heap(), 4096 * 1024 * 1024);
    }
}
