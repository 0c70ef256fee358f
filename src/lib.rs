//! Capture a buffer argument of a hooked function and print it as hex.
//!
//! A [`CaptureSession`] resolves an [`InterceptSite`] (an export, or a fixed
//! offset from a library's base), attaches to it through a host
//! [`Interceptor`], records the destination pointer and length on every
//! entry and, when the call returns, reads that many bytes from the target
//! process and writes `<label>: <hex>`.
//!
//! Reading remote memory is done through [`CopyAddress`]; [`Process`]
//! implements it for Linux, macOS and Windows.

#[macro_use] extern crate log;
extern crate libc;

use std::io;
use std::sync::Arc;

mod error;
pub mod config;
pub mod hex;
pub mod intercept;
pub mod modules;
pub mod session;
pub mod site;

#[cfg(test)]
mod testing;

pub use config::CaptureConfig;
pub use error::{Error, Result};
pub use intercept::{CallId, CallListener, Interceptor, Invocation};
pub use modules::ProcessModules;
pub use session::{CallContext, CaptureSession, OutputLine};
pub use site::{resolve, InterceptSite, Locator, ModuleResolver, SiteDescriptor};

pub trait CopyAddress {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()>;
}

impl<'a, T: CopyAddress + ?Sized> CopyAddress for &'a T {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
        (**self).copy_address(addr, buf)
    }
}

impl<T: CopyAddress + ?Sized> CopyAddress for Arc<T> {
    fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
        (**self).copy_address(addr, buf)
    }
}

pub trait TryIntoProcessHandle {
    fn try_into_process_handle(self) -> io::Result<platform::ProcessHandle>;
}

/// Trivial implementation of `TryIntoProcessHandle`.
impl TryIntoProcessHandle for platform::ProcessHandle {
    fn try_into_process_handle(self) -> io::Result<platform::ProcessHandle> {
        Ok(self)
    }
}

pub struct Process {
    handle: platform::ProcessHandle,
}

pub use platform::Pid;

impl Process {
    pub fn new<T>(process: T) -> io::Result<Process> where T: TryIntoProcessHandle {
        Ok(Process {
            handle: process.try_into_process_handle()?,
        })
    }
}

#[cfg(target_os="linux")]
mod platform {
    use libc::{pid_t, c_void, iovec, process_vm_readv};
    use std::io;
    use std::process::Child;

    use super::{CopyAddress, Process, TryIntoProcessHandle};

    pub type Pid = pid_t;
    pub type ProcessHandle = pid_t;

    impl<'a> TryIntoProcessHandle for &'a Child {
        fn try_into_process_handle(self) -> io::Result<ProcessHandle> {
            Ok(self.id() as pid_t)
        }
    }

    impl CopyAddress for Process {
        fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
            let local_iov = iovec {
                iov_base: buf.as_mut_ptr() as *mut c_void,
                iov_len: buf.len(),
            };
            let remote_iov = iovec {
                iov_base: addr as *mut c_void,
                iov_len: buf.len(),
            };
            let result = unsafe {
                process_vm_readv(self.handle, &local_iov, 1, &remote_iov, 1, 0)
            };
            if result == -1 {
                Err(io::Error::last_os_error())
            } else if result as usize != buf.len() {
                // A partial read means the range crossed into an unmapped page.
                Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                   format!("short read: {} of {} bytes", result, buf.len())))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(target_os="macos")]
mod platform {
    extern crate mach;

    use libc::{pid_t, c_int};
    use self::mach::kern_return::{kern_return_t, KERN_SUCCESS};
    use self::mach::port::{mach_port_t, mach_port_name_t, MACH_PORT_NULL};
    use self::mach::vm_types::{mach_vm_address_t, mach_vm_size_t};
    use self::mach::message::{mach_msg_type_number_t};
    use std::io;
    use std::ptr;
    use std::slice;

    use super::{CopyAddress, Process, TryIntoProcessHandle};

    #[allow(non_camel_case_types)] type vm_map_t = mach_port_t;
    #[allow(non_camel_case_types)] type vm_address_t = mach_vm_address_t;
    #[allow(non_camel_case_types)] type vm_size_t = mach_vm_size_t;

    pub type Pid = pid_t;
    pub type ProcessHandle = mach_port_name_t;

    extern "C" {
        fn vm_read(target_task: vm_map_t, address: vm_address_t, size: vm_size_t, data: &*mut u8, data_size: *mut mach_msg_type_number_t) -> kern_return_t;
    }

    fn task_for_pid(pid: pid_t) -> io::Result<mach_port_name_t> {
        let mut task: mach_port_name_t = MACH_PORT_NULL;

        unsafe {
            let result = mach::traps::task_for_pid(mach::traps::mach_task_self(), pid as c_int, &mut task);
            if result != KERN_SUCCESS {
                return Err(io::Error::last_os_error())
            }
        }

        Ok(task)
    }

    /// `pid_t` can be turned into a `mach_port_name_t` with `task_for_pid`.
    impl TryIntoProcessHandle for pid_t {
        fn try_into_process_handle(self) -> io::Result<ProcessHandle> {
            task_for_pid(self)
        }
    }

    impl CopyAddress for Process {
        fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
            let page_addr      = (addr as i64 & (-4096)) as mach_vm_address_t;
            let last_page_addr = ((addr as i64 + buf.len() as i64 + 4095) & (-4096)) as mach_vm_address_t;
            let page_size      = last_page_addr as usize - page_addr as usize;

            let read_ptr: *mut u8 = ptr::null_mut();
            let mut read_len: mach_msg_type_number_t = 0;

            let result = unsafe {
                vm_read(self.handle, page_addr as u64, page_size as vm_size_t, &read_ptr, &mut read_len)
            };

            if result != KERN_SUCCESS {
                return Err(io::Error::last_os_error())
            }

            // vm_read maps fresh pages into this task; they are ours to free.
            let release = || unsafe {
                mach::vm::mach_vm_deallocate(mach::traps::mach_task_self(), read_ptr as mach_vm_address_t, read_len as mach_vm_size_t);
            };

            if read_len != page_size as u32 {
                release();
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                          format!("mismatched read size for vm_read (expected {}, got {})", page_size, read_len)))
            }

            let read_buf = unsafe { slice::from_raw_parts(read_ptr, read_len as usize) };

            let offset = addr - page_addr as usize;
            let len = buf.len();
            buf.copy_from_slice(&read_buf[offset..(offset + len)]);
            release();

            Ok(())
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::process::Child;
    use std::ptr;

    use windows_sys::Win32::Foundation::{CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, FALSE, HANDLE};
    use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcess, PROCESS_VM_READ};

    use super::{CopyAddress, Process, TryIntoProcessHandle};

    pub type Pid = u32;
    pub type ProcessHandle = HANDLE;

    /// A pid can be turned into a `HANDLE` with `OpenProcess`.
    impl TryIntoProcessHandle for Pid {
        fn try_into_process_handle(self) -> io::Result<ProcessHandle> {
            let handle = unsafe { OpenProcess(PROCESS_VM_READ, FALSE, self) };
            if handle == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(handle)
            }
        }
    }

    /// The child keeps its own handle; the `Process` gets a duplicate.
    impl<'a> TryIntoProcessHandle for &'a Child {
        fn try_into_process_handle(self) -> io::Result<ProcessHandle> {
            let mut handle: HANDLE = 0;
            let ok = unsafe {
                let current = GetCurrentProcess();
                DuplicateHandle(current, self.as_raw_handle() as HANDLE, current, &mut handle,
                                0, FALSE, DUPLICATE_SAME_ACCESS)
            };
            if ok == FALSE {
                Err(io::Error::last_os_error())
            } else {
                Ok(handle)
            }
        }
    }

    /// A `Process` owns its handle, including one passed in directly.
    impl Drop for Process {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }

    impl CopyAddress for Process {
        fn copy_address(&self, addr: usize, buf: &mut [u8]) -> io::Result<()> {
            if buf.is_empty() {
                return Ok(());
            }

            if unsafe { ReadProcessMemory(self.handle,
                                          addr as *const c_void,
                                          buf.as_mut_ptr() as *mut c_void,
                                          buf.len(),
                                          ptr::null_mut()) } == FALSE
            {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

pub fn copy_address_raw<T>(addr: usize, length: usize, source: &T) -> io::Result<Vec<u8>>
    where T: CopyAddress + ?Sized
{
    debug!("copy_address_raw: addr: {:x} length: {}", addr, length);

    let mut copy = vec![0; length];
    if length == 0 {
        return Ok(copy);
    }

    source.copy_address(addr, &mut copy)
        .map_err(|e| {
            warn!("copy_address failed for {:x}: {:?}", addr, e);
            e
        })
        .and(Ok(copy))
}
