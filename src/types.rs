//! Type aliases for JIT-compiled routines.

/// Raw signature of one compiled chunk.
///
/// Arguments are `(t, y, params, general_helper, aux, out)`; the pointer
/// arguments address f64 arrays whose lengths are fixed at generation
/// time. Helper routines write `general_helper`, derivative and Jacobian
/// routines write `out`.
pub(crate) type ChunkFn =
    unsafe extern "C" fn(f64, *const f64, *const f64, *mut f64, *mut f64, *mut f64);
