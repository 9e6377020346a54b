/// Board constants, selected at compile time via feature flags.
///
/// Builds without a board feature (the host simulator, tests) get the
/// `host` profile.

#[cfg(feature = "board-xiao")]
mod hw {
    pub const HAS_PSRAM: bool = true;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(all(feature = "board-m5stickc", not(feature = "board-xiao")))]
mod hw {
    pub const HAS_PSRAM: bool = false;
    pub const BOARD_NAME: &str = "m5stickc_plus2";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    pub const HAS_PSRAM: bool = false;
    pub const BOARD_NAME: &str = "host";
}

pub use hw::*;

/// Default scratch arena per loaded model. Boards with PSRAM can afford a
/// larger one.
pub const MODEL_ARENA_SIZE: usize = if HAS_PSRAM { 64 * 1024 } else { 32 * 1024 };
