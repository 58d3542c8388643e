// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Element type tags and the ordering used by the selection kernels.
//!
//! Kernels never compare floats directly. Every supported element maps to a
//! `u32` key whose unsigned order is the selection order:
//!   * numeric order, with `-0.0` and `+0.0` sharing one key;
//!   * NaN (any payload, either sign) below `-inf`, so it is selected last.

use half::bf16;
use std::fmt;

/// Closed set of element type tags understood by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Pred,
    S32,
    U32,
    F16,
    BF16,
    F32,
    F64,
}

impl PrimitiveType {
    pub const fn byte_width(self) -> usize {
        match self {
            PrimitiveType::Pred => 1,
            PrimitiveType::F16 | PrimitiveType::BF16 => 2,
            PrimitiveType::S32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S32 => "s32",
            PrimitiveType::U32 => "u32",
            PrimitiveType::F16 => "f16",
            PrimitiveType::BF16 => "bf16",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
        }
    }

    /// Whether a top-k kernel instantiation exists for this tag.
    pub const fn supports_topk(self) -> bool {
        matches!(self, PrimitiveType::F32 | PrimitiveType::BF16)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for half::bf16 {}
}

/// Element types with a top-k kernel instantiation.
pub trait TopkElement:
    sealed::Sealed + bytemuck::Pod + Send + Sync + fmt::Debug + 'static
{
    const TYPE: PrimitiveType;

    /// Monotone key: `a` ranks above `b` iff `a.order_key() > b.order_key()`.
    fn order_key(self) -> u32;
}

impl TopkElement for f32 {
    const TYPE: PrimitiveType = PrimitiveType::F32;

    #[inline]
    fn order_key(self) -> u32 {
        f32_order_key(self)
    }
}

impl TopkElement for bf16 {
    const TYPE: PrimitiveType = PrimitiveType::BF16;

    #[inline]
    fn order_key(self) -> u32 {
        // bf16 -> f32 is exact, so the f32 key preserves order.
        f32_order_key(self.to_f32())
    }
}

const SIGN: u32 = 0x8000_0000;

#[inline]
pub(crate) fn f32_order_key(value: f32) -> u32 {
    if value.is_nan() {
        return 0;
    }
    // folds -0.0 onto +0.0
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    if bits & SIGN != 0 {
        !bits
    } else {
        bits | SIGN
    }
}
