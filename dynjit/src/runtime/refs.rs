//! Owning and borrowed handles to reference counted objects.
//!
//! A [Ref] owns exactly one reference: it can be moved but not implicitly copied, and releases its
//! reference when dropped. A [BorrowedRef] is a `Copy` view whose lifetime is tied to something
//! that does own a reference; it never touches the reference count. Converting between the two is
//! always explicit ([Ref::create] takes a new reference, [Ref::borrow] lends one).

use std::{fmt, marker::PhantomData, mem, ops::Deref, ptr::NonNull};

/// Something with an intrusive reference count.
pub trait RefCounted {
    fn incref(&self);

    /// Release one reference to the object at `ptr`, freeing it if that was the last.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own the reference being released.
    unsafe fn decref(ptr: NonNull<Self>);
}

#[repr(transparent)]
pub struct Ref<T: RefCounted> {
    ptr: NonNull<T>,
    phantom: PhantomData<T>,
}

impl<T: RefCounted> Ref<T> {
    /// Take ownership of the reference the caller owns to `ptr`: the reference count is not
    /// changed.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own the reference being transferred.
    pub unsafe fn steal(ptr: NonNull<T>) -> Self {
        Ref {
            ptr,
            phantom: PhantomData,
        }
    }

    /// As [Self::steal], mapping null to `None`.
    ///
    /// # Safety
    ///
    /// As [Self::steal] if `ptr` is non-null.
    pub unsafe fn steal_raw(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|p| Ref::steal(p))
    }

    /// Take a new reference to a borrowed object.
    pub fn create(b: BorrowedRef<'_, T>) -> Self {
        b.incref();
        Ref {
            ptr: b.ptr,
            phantom: PhantomData,
        }
    }

    /// Give up ownership without releasing the reference: the caller becomes responsible for it.
    pub fn release(self) -> NonNull<T> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn borrow(&self) -> BorrowedRef<'_, T> {
        BorrowedRef {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }

    /// Do `a` and `b` refer to the same object?
    pub fn ptr_eq(a: &Ref<T>, b: &Ref<T>) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        // We own exactly one reference.
        unsafe { T::decref(self.ptr) }
    }
}

impl<T: RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref::create(self.borrow())
    }
}

impl<T: RefCounted> Deref for Ref<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // The object stays alive for at least as long as we hold our reference.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: RefCounted + fmt::Display> fmt::Display for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[repr(transparent)]
pub struct BorrowedRef<'a, T: RefCounted> {
    ptr: NonNull<T>,
    phantom: PhantomData<&'a T>,
}

impl<'a, T: RefCounted> BorrowedRef<'a, T> {
    /// # Safety
    ///
    /// `ptr` must point to an object that some owner keeps alive for `'a`.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        BorrowedRef {
            ptr,
            phantom: PhantomData,
        }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn ptr_eq(self, other: BorrowedRef<'_, T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: RefCounted> Clone for BorrowedRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: RefCounted> Copy for BorrowedRef<'_, T> {}

impl<'a, T: RefCounted> Deref for BorrowedRef<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<'a, T: RefCounted> From<&'a Ref<T>> for BorrowedRef<'a, T> {
    fn from(r: &'a Ref<T>) -> Self {
        r.borrow()
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for BorrowedRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
