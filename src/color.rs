use std::sync::atomic::{AtomicU8, Ordering};

use clap::ValueEnum;

/// Process-wide color mode, stored as the [ColorMode] discriminant.
static COLOR_MODE: AtomicU8 = AtomicU8::new(ColorMode::Auto as u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
#[repr(u8)]
pub enum ColorMode {
    Never,
    Auto,
    Always,
}

pub fn set_color_mode(color: ColorMode) {
    COLOR_MODE.store(color as u8, Ordering::Relaxed);
}

pub fn color_mode() -> ColorMode {
    match COLOR_MODE.load(Ordering::Relaxed) {
        0 => ColorMode::Never,
        2 => ColorMode::Always,
        _ => ColorMode::Auto,
    }
}

/// Whether diagnostics (Clang's included) and reports should be colored.
pub fn do_color() -> bool {
    match color_mode() {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => atty::is(atty::Stream::Stdout),
    }
}
