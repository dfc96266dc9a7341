// error.rs -- Host-side error types.
//
// Device-side failures (heap exhaustion, overflow exhaustion, bucket
// contention) are not errors: they are counted in `HashStats` and the
// frame proceeds with partial data. The enums here cover the two hard
// classes: caller contract violations, rejected before any pass runs,
// and consistency violations reported by the debug checker, which
// indicate an implementation bug rather than a runtime condition.

use std::fmt;

/// Rejections raised by `SceneRep` before any pass touches the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// Depth frame dimensions disagree with the configured intrinsics.
    FrameSizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
    /// Color frame dimensions disagree with the depth frame.
    ColorSizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
    /// Mask buffer does not cover the full image.
    MaskSizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
    /// `HashParams::validate` rejected the configuration.
    InvalidParams(String),
}

impl fmt::Display for FusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionError::FrameSizeMismatch { expected, got } => write!(
                f,
                "depth frame is {}x{} but intrinsics are configured for {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            FusionError::ColorSizeMismatch { expected, got } => write!(
                f,
                "color frame is {}x{}, depth frame is {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            FusionError::MaskSizeMismatch { expected, got } => write!(
                f,
                "mask covers {}x{} pixels, image is {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            FusionError::InvalidParams(msg) => write!(f, "invalid hash params: {msg}"),
        }
    }
}

impl std::error::Error for FusionError {}

/// Violations reported by `SceneRep::check_consistency`.
///
/// Any of these means the allocator, integrator, or collector corrupted
/// the heap/table relationship. They cannot be produced by well-formed
/// input; tests treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// The same brick index appears more than once on the free stack.
    DuplicateFreePointer { brick: u32 },
    /// A free-stack entry names a brick outside the configured pool.
    FreePointerOutOfRange { brick: u32 },
    /// A brick index is on the free stack and also referenced by an
    /// occupied hash entry.
    FreeAndAllocated { brick: u32, slot: usize },
    /// Two occupied hash entries reference the same brick.
    DoubleAllocated { brick: u32, slot_a: usize, slot_b: usize },
    /// A brick index is neither free nor referenced by any entry.
    Leaked { brick: u32 },
    /// An occupied entry is not reachable by walking its bucket chain.
    Unreachable { slot: usize },
    /// An entry's brick index is out of range for the configured heap.
    PointerOutOfRange { slot: usize, ptr: i32 },
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyError::DuplicateFreePointer { brick } => {
                write!(f, "brick {brick} appears twice on the free stack")
            }
            ConsistencyError::FreePointerOutOfRange { brick } => {
                write!(f, "free stack holds out-of-range brick index {brick}")
            }
            ConsistencyError::FreeAndAllocated { brick, slot } => {
                write!(f, "brick {brick} is free but also held by entry {slot}")
            }
            ConsistencyError::DoubleAllocated { brick, slot_a, slot_b } => {
                write!(f, "brick {brick} held by entries {slot_a} and {slot_b}")
            }
            ConsistencyError::Leaked { brick } => {
                write!(f, "brick {brick} is neither free nor allocated")
            }
            ConsistencyError::Unreachable { slot } => {
                write!(f, "entry {slot} is occupied but not on its bucket chain")
            }
            ConsistencyError::PointerOutOfRange { slot, ptr } => {
                write!(f, "entry {slot} holds out-of-range brick pointer {ptr}")
            }
        }
    }
}

impl std::error::Error for ConsistencyError {}
