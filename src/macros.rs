//! # Internal Macros
//!
//! Boilerplate reducers for the on-disk header structs. Headers store
//! multi-byte fields as `zerocopy::little_endian` wrapper types so they
//! can be parsed by reference from unaligned buffers; this macro
//! generates the native-typed getters.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     version: U32,
//!     timestamp_first: U64,
//! }
//!
//! impl Header {
//!     zerocopy_getters! {
//!         version: u32,
//!         timestamp_first: u64,
//!     }
//! }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
