//! Process thread attribute list carrying a pseudoconsole.

use std::ffi::c_void;
use std::io;
use std::mem;

use windows::Win32::System::Threading::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST,
};

use super::win_err;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x0002_0016;

/// Owned, initialized attribute list. Deleted on `release` or drop.
pub struct ProcThreadAttributeList {
    // usize words keep the buffer pointer-aligned
    buffer: Vec<usize>,
    initialized: bool,
}

impl ProcThreadAttributeList {
    /// Build a one-entry list that attaches `pseudo_console` to the child.
    pub fn with_pseudo_console(pseudo_console: isize) -> io::Result<Self> {
        let mut size: usize = 0;
        // SAFETY: a null list with a size pointer only queries the size.
        let _ = unsafe {
            InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size)
        };
        if size == 0 {
            return Err(io::Error::last_os_error());
        }

        let words = (size + mem::size_of::<usize>() - 1) / mem::size_of::<usize>();
        let mut list = Self {
            buffer: vec![0; words],
            initialized: false,
        };

        // SAFETY: buffer holds at least `size` bytes.
        unsafe { InitializeProcThreadAttributeList(list.as_raw(), 1, 0, &mut size) }.map_err(win_err)?;
        list.initialized = true;

        // SAFETY: the attribute value is the pseudoconsole handle itself.
        unsafe {
            UpdateProcThreadAttribute(
                list.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(pseudo_console as *const c_void),
                mem::size_of::<isize>(),
                None,
                None,
            )
        }
        .map_err(win_err)?;

        Ok(list)
    }

    pub fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut c_void)
    }

    /// Delete the list. Further calls do nothing.
    pub fn release(&mut self) {
        if self.initialized {
            // SAFETY: the list was initialized and not yet deleted.
            unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
            self.initialized = false;
        }
    }
}

impl Drop for ProcThreadAttributeList {
    fn drop(&mut self) {
        self.release();
    }
}
