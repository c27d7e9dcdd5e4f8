// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small helpers shared by the platform abstraction layer crates.

mod cache_padded;

pub use cache_padded::CachePadded;

use std::sync::OnceLock;

/// Returns the size of a virtual memory page on this host.
///
/// The value is queried once through `sysconf(_SC_PAGESIZE)` and cached.
///
/// # Panics
///
/// Panics if the host reports a page size that is not a power of two.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // Safety: `sysconf` has no preconditions
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = usize::try_from(raw).unwrap_or(4096);
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        page_size
    })
}

/// Rounds `value` up to the next multiple of `align`.
///
/// Returns `None` if the result would overflow a `usize`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[must_use]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Wraps a `const fn` stripping the "constness" when compiled under loom.
///
/// `loom` tracks additional state alongside each of its atomic types, which means their
/// constructors cannot be `const`. Types that wrap loom atomics therefore can't have `const`
/// constructors under `cfg(loom)` either, this macro emits both flavours.
///
/// # Example
///
/// ```rust
/// # use util::loom_const_fn;
///
/// struct Something { str: &'static str }
///
/// impl Something {
///     loom_const_fn! {
///         pub const fn new() -> Self {
///             Self { str: "Hello World" }
///         }
///     }
/// }
/// ```
#[macro_export]
macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis const fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let page_size = page_size();
        assert!(page_size >= 4096);
        assert_eq!(page_size, super::page_size());
    }

    #[test]
    fn align_up_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 4096), None);
        assert_eq!(checked_align_up(usize::MAX - 4095, 4096), Some(usize::MAX - 4095));
    }

    proptest::proptest! {
        #[test]
        fn align_up(value in 0usize..(1 << 40), shift in 0u32..16) {
            let align = 1usize << shift;
            let aligned = checked_align_up(value, align).unwrap();

            proptest::prop_assert_eq!(aligned % align, 0);
            proptest::prop_assert!(aligned >= value);
            proptest::prop_assert!(aligned - value < align);
        }
    }
}
