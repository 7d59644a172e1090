use core::alloc::Layout;

use alloc::boxed::Box;

use crate::error::SvmError;

/// Returns a zero-initialized `Box` of `T` without constructing `T` on the
/// stack first. Page-sized hardware structures must never transit the stack.
///
/// Allocation failure is reported instead of aborting; callers decide whether
/// losing the virtual core is acceptable.
pub(crate) fn try_zeroed_box<T>() -> Result<Box<T>, SvmError> {
    let layout = Layout::new::<T>();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        return Err(SvmError::OutOfMemory);
    }
    Ok(unsafe { Box::from_raw(ptr) })
}
