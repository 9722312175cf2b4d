//! Picks and applies the framebuffer video mode.

use log::info;

use shared::protocol::Framebuffer;

use crate::config::{Config, Scope, TypeMask, Value};
use crate::services::{Resolution, VideoMode, VideoServices};

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 768;
pub const DEFAULT_BPP: u32 = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeConstraint {
    Exactly,
    AtLeast,
}

#[derive(Clone, Copy, Debug)]
pub struct RequestedMode {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub constraint: ModeConstraint,
    /// The entry asked for no framebuffer at all.
    pub disabled: bool,
}

impl Default for RequestedMode {
    fn default() -> Self {
        RequestedMode {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            bpp: DEFAULT_BPP,
            constraint: ModeConstraint::AtLeast,
            disabled: false,
        }
    }
}

/// Interprets the `video-mode` key: absent or `"auto"` means the default
/// mode, null or `"unset"` disables the framebuffer, and an object overrides
/// individual fields.
pub fn requested_mode_from_config(cfg: &Config<'_>, scope: Scope) -> RequestedMode {
    let mut mode = RequestedMode::default();

    let Some(value) = cfg.get(
        scope,
        "video-mode",
        TypeMask::OBJECT | TypeMask::STRING | TypeMask::NULL,
    ) else {
        return mode;
    };

    match value.value {
        Value::Null => mode.disabled = true,
        Value::Str("unset") => mode.disabled = true,
        Value::Str("auto") => {}
        Value::Str(other) => panic!("invalid value for \"video-mode\": \"{other}\""),
        Value::Object(object) => {
            if let Some(width) = cfg.get_unsigned(object, "width") {
                mode.width = width as u32;
            }
            if let Some(height) = cfg.get_unsigned(object, "height") {
                mode.height = height as u32;
            }
            if let Some(bpp) = cfg.get_unsigned(object, "bpp") {
                mode.bpp = bpp as u32;
            }
            if let Some(constraint) = cfg.get_string(object, "constraint") {
                mode.constraint = match constraint {
                    "at-least" => ModeConstraint::AtLeast,
                    "exactly" => ModeConstraint::Exactly,
                    other => panic!("invalid video mode constraint \"{other}\""),
                };
            }
        }
        _ => unreachable!(),
    }

    mode
}

/// Picks a mode satisfying `request` out of `modes`. `Exactly` takes the
/// first equal mode; `AtLeast` takes the last mode that covers the request
/// and still fits the native resolution.
pub fn pick_mode<'m>(
    modes: &'m [VideoMode],
    native: Resolution,
    request: &RequestedMode,
) -> Option<&'m VideoMode> {
    let mut picked = None;

    for mode in modes {
        if request.constraint == ModeConstraint::Exactly {
            if (mode.width, mode.height, mode.bpp) == (request.width, request.height, request.bpp)
            {
                return Some(mode);
            }
            continue;
        }

        let covers_request = mode.width >= request.width
            && mode.height >= request.height
            && mode.bpp >= request.bpp;
        let fits_native = mode.width <= native.width && mode.height <= native.height;

        if covers_request && fits_native {
            picked = Some(mode);
        }
    }

    picked
}

/// Resolves the configured mode against the firmware list and applies it.
/// Returns `None` when the entry asked for no framebuffer.
pub fn set_video_mode(
    cfg: &Config<'_>,
    scope: Scope,
    video: &dyn VideoServices,
) -> Option<Framebuffer> {
    let request = requested_mode_from_config(cfg, scope);
    if request.disabled {
        return None;
    }

    // Assume defaults if the query fails.
    let native = video.query_resolution().unwrap_or(Resolution {
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
    });

    let picked = pick_mode(video.modes(), native, &request).unwrap_or_else(|| {
        panic!(
            "failed to pick a video mode according to constraints ({}x{} {} bpp)",
            request.width, request.height, request.bpp
        )
    });

    info!(
        "picked video mode {}x{} {} bpp",
        picked.width, picked.height, picked.bpp
    );

    match video.set_mode(picked.id) {
        Some(framebuffer) => Some(framebuffer),
        None => panic!("failed to set picked video mode"),
    }
}
