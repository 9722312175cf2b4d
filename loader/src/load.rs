//! Drives one complete handover: kernel, modules, address space, stack,
//! video, boot information, jump.

use log::info;

use shared::addr::{page_count, PAGE_SIZE};
use shared::protocol::{MEMORY_KERNEL_STACK, PLATFORM_BIOS, PLATFORM_UEFI};

use crate::allocator::{allocate_critical_pages_at, allocate_critical_pages_with_kind};
use crate::attributes::{build_attribute_array, AttributeArraySpec, KernelLocation};
use crate::binary::{binary_options_from_config, load_kernel, Bitness};
use crate::config::{Config, LoadableEntry, Scope, TypeMask, Value};
use crate::fs::FsTable;
use crate::modules::{load_module, ModuleArray};
use crate::paging::build_kernel_address_space;
use crate::services::{MemoryServices, Platform, Services};
use crate::video::set_video_mode;
use crate::{DIRECT_MAP_BASE, HIGHER_HALF_BASE};

/// Everything the trampoline needs to start the kernel.
#[derive(Clone, Copy, Debug)]
pub struct LaunchPlan {
    pub bitness: Bitness,
    pub entrypoint: u64,
    pub stack_address: u64,
    pub page_table_root: u64,
    pub attribute_array_address: u64,
}

/// Picks the entry named by the global `default-entry` key, falling back to
/// the first one in the file.
pub fn pick_loadable_entry<'a>(cfg: &Config<'a>) -> LoadableEntry<'a> {
    match cfg.get_string(cfg.root_scope(), "default-entry") {
        Some(name) => cfg
            .loadable_entry(name)
            .unwrap_or_else(|| panic!("no loadable entry called \"{name}\"")),
        None => cfg
            .first_loadable_entry()
            .unwrap_or_else(|| panic!("configuration file must contain at least one loadable entry")),
    }
}

/// Allocates the kernel stack per the `stack` key and returns its top.
fn pick_stack(cfg: &Config<'_>, scope: Scope, ms: &dyn MemoryServices) -> u64 {
    let mut address: Option<u64> = None;
    let mut size: u64 = 16 * 1024;

    match cfg.get(scope, "stack", TypeMask::STRING | TypeMask::OBJECT) {
        Some(value) => match value.value {
            Value::Str("auto") => {}
            Value::Str(other) => panic!("invalid value for \"stack\": \"{other}\""),
            Value::Object(object) => {
                match cfg.get(object, "allocate-at", TypeMask::STRING | TypeMask::UNSIGNED) {
                    Some(at) => match at.value {
                        Value::Str("anywhere") => {}
                        Value::Str(other) => {
                            panic!("invalid value for \"allocate-at\": \"{other}\"")
                        }
                        Value::Unsigned(fixed) => address = Some(fixed),
                        _ => unreachable!(),
                    },
                    None => {}
                }

                match cfg.get(object, "size", TypeMask::STRING | TypeMask::UNSIGNED) {
                    Some(requested) => match requested.value {
                        Value::Str("auto") => {}
                        Value::Str(other) => panic!("invalid value for \"size\": \"{other}\""),
                        Value::Unsigned(bytes) => size = bytes,
                        _ => unreachable!(),
                    },
                    None => {}
                }
            }
            _ => unreachable!(),
        },
        None => {}
    }

    let pages = page_count(size).max(1);

    let base = match address {
        Some(fixed) => allocate_critical_pages_at(
            ms,
            shared::addr::PhysAddr::new(fixed),
            pages,
            MEMORY_KERNEL_STACK,
        ),
        None => allocate_critical_pages_with_kind(ms, pages, MEMORY_KERNEL_STACK),
    };

    base.as_u64() + pages * PAGE_SIZE
}

/// Runs the whole load sequence and returns the plan for the final jump.
///
/// Order matters throughout: the video mode goes last among the things that
/// may still log through the firmware console, the attribute array seals the
/// memory map, and nothing may allocate after it does.
pub fn load<'a>(
    cfg: &Config<'a>,
    entry: &LoadableEntry<'a>,
    services: &Services<'_>,
    fs_table: &FsTable<'_>,
) -> LaunchPlan {
    let ms = services.memory;

    info!("loading entry \"{}\"", entry.name);

    let options = binary_options_from_config(cfg, entry);
    let fs_entry = fs_table
        .by_full_path(&options.path)
        .unwrap_or_else(|| panic!("no filesystem for the configured binary path"));

    let kernel = load_kernel(
        fs_entry.fs,
        options.path.path_within_partition,
        options.allocate_anywhere,
        services,
    );
    let is_higher_half = kernel.entrypoint >= HIGHER_HALF_BASE;

    let cmdline = cfg.get_string(entry.scope, "cmdline");

    let mut modules = ModuleArray::new(ms);
    let module_mask = TypeMask::STRING | TypeMask::OBJECT;
    let mut unnamed_count = 0;
    let mut module_value = cfg.get_first(entry.scope, "module", module_mask);
    while let Some(value) = module_value {
        modules.push(load_module(cfg, &value, fs_table, ms, &mut unnamed_count));
        module_value = cfg.next_matching(&value, module_mask);
    }

    let page_table_root = build_kernel_address_space(ms, &kernel);
    let mut stack_address = pick_stack(cfg, entry.scope, ms);

    let acpi_rsdp_address = services.platform.find_rsdp().unwrap_or(0);

    // Applied last among the allocating steps: once the mode switches, the
    // legacy console may be gone.
    let mut framebuffer = set_video_mode(cfg, entry.scope, services.video);

    if is_higher_half {
        // The kernel reads loader-placed structures through its direct map.
        if let Some(framebuffer) = framebuffer.as_mut() {
            framebuffer.physical_address += DIRECT_MAP_BASE;
        }
    }

    let spec = AttributeArraySpec {
        kernel: &kernel,
        location: KernelLocation::new(fs_entry, options.path.path_within_partition),
        framebuffer,
        cmdline,
        modules_base: modules.base(),
        module_count: modules.count(),
        acpi_rsdp_address,
    };

    let platform_type = match services.platform.provider() {
        Platform::Bios => PLATFORM_BIOS,
        Platform::Uefi => PLATFORM_UEFI,
    };

    // No allocation may happen between here and the jump: the memory map is
    // now stored inside the attribute array.
    let handover = build_attribute_array(&spec, platform_type, ms);
    if !ms.handover(handover.memory_map_handover_key) {
        panic!("memory map handover was rejected");
    }

    let mut attribute_array_address = handover.attribute_array_address;
    if is_higher_half {
        stack_address += DIRECT_MAP_BASE;
        attribute_array_address += DIRECT_MAP_BASE;
    }

    LaunchPlan {
        bitness: kernel.bitness,
        entrypoint: kernel.entrypoint,
        stack_address,
        page_table_root,
        attribute_array_address,
    }
}

#[cfg(target_os = "none")]
extern "C" {
    fn kernel_handover32(entrypoint: u32, esp: u32, arg0: u32, arg1: u32) -> !;
    fn kernel_handover64(entrypoint: u64, rsp: u64, cr3: u64, arg0: u64, arg1: u64) -> !;
}

/// Jumps to the kernel. The trampolines live in platform assembly.
#[cfg(target_os = "none")]
pub fn dispatch(plan: &LaunchPlan) -> ! {
    match plan.bitness {
        Bitness::Bits32 => unsafe {
            kernel_handover32(
                plan.entrypoint as u32,
                plan.stack_address as u32,
                plan.attribute_array_address as u32,
                shared::protocol::MAGIC32,
            )
        },
        Bitness::Bits64 => unsafe {
            kernel_handover64(
                plan.entrypoint,
                plan.stack_address,
                plan.page_table_root,
                plan.attribute_array_address,
                shared::protocol::MAGIC64,
            )
        },
    }
}
