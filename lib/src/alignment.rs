/// Generate `align_down_$suffix` / `align_up_$suffix` for one integer type.
///
/// `alignment` must be a power of two; zero is treated as a no-op so callers
/// can pass through unvalidated values without a branch of their own.
macro_rules! impl_align_fns {
    ($ty:ty, $suffix:ident) => {
        paste::paste! {
            /// Round `value` down to a multiple of `alignment` (power of two;
            /// zero returns the input unchanged).
            #[inline(always)]
            pub const fn [<align_down_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value & !(alignment - 1)
            }

            /// Round `value` up to a multiple of `alignment` (power of two;
            /// zero returns the input unchanged). Saturates instead of
            /// overflowing at the top of the range.
            #[inline(always)]
            pub const fn [<align_up_ $suffix>](value: $ty, alignment: $ty) -> $ty {
                if alignment == 0 {
                    return value;
                }
                value.saturating_add(alignment - 1) & !(alignment - 1)
            }
        }
    };
}

impl_align_fns!(u64, u64);
impl_align_fns!(usize, usize);
