//! Module and export resolution in a live process.
//!
//! On Linux, libraries are found through `/proc/<pid>/maps` and exports are
//! read from the ELF dynamic symbol table of the mapped file. On Windows, a
//! Toolhelp module snapshot gives the base, and exports come from the PE
//! export directory of the module file.

use crate::error::Result;
use crate::site::ModuleResolver;
use crate::Pid;

pub struct ProcessModules {
    pid: Pid,
}

impl ProcessModules {
    pub fn new(pid: Pid) -> ProcessModules {
        ProcessModules { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl ModuleResolver for ProcessModules {
    fn base_address(&self, library: &str) -> Result<Option<usize>> {
        platform::base_address(self, library)
    }

    fn export_address(&self, library: &str, symbol: &str) -> Result<Option<usize>> {
        platform::export_address(self, library, symbol)
    }
}

#[cfg(target_os="linux")]
mod platform {
    use std::ffi::OsStr;
    use std::fs;
    use std::path::{Path, PathBuf};

    use goblin::elf::program_header::PT_LOAD;
    use goblin::elf::section_header::SHN_UNDEF;
    use goblin::elf::sym::{Sym, STT_FUNC, STT_GNU_IFUNC, STT_OBJECT};
    use goblin::elf::Elf;

    use super::ProcessModules;
    use crate::error::Result;

    #[derive(Debug, PartialEq, Eq)]
    pub(super) struct Mapping {
        pub start: usize,
        pub path: PathBuf,
    }

    /// File-backed mappings from the contents of a `maps` file. Anonymous and
    /// pseudo mappings (`[heap]`, `[vdso]`, ...) are skipped.
    pub(super) fn parse_maps(contents: &str) -> Vec<Mapping> {
        contents.lines().filter_map(parse_mapping).collect()
    }

    fn parse_mapping(line: &str) -> Option<Mapping> {
        // range, perms, offset, dev, inode, then the path padded with spaces
        let mut fields = line.splitn(6, char::is_whitespace);
        let range = fields.next()?;
        let path = fields.nth(4)?.trim_start();
        if !path.starts_with('/') {
            return None;
        }
        let path = path.strip_suffix(" (deleted)").unwrap_or(path);
        let (start, _end) = range.split_once('-')?;
        Some(Mapping {
            start: usize::from_str_radix(start, 16).ok()?,
            path: PathBuf::from(path),
        })
    }

    /// A library identifier matches either the full path or the file name.
    pub(super) fn matches_library(path: &Path, library: &str) -> bool {
        path == Path::new(library) || path.file_name() == Some(OsStr::new(library))
    }

    fn page_size() -> u64 {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as u64,
            _ => 4096,
        }
    }

    /// Base address and path of the first loaded library matching `library`.
    fn find_library(modules: &ProcessModules, library: &str) -> Result<Option<(usize, PathBuf)>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", modules.pid))?;
        let mappings = parse_maps(&maps);
        let path = match mappings.iter().find(|m| matches_library(&m.path, library)) {
            Some(m) => m.path.clone(),
            None => return Ok(None),
        };
        let base = mappings.iter().filter(|m| m.path == path).map(|m| m.start).min();
        Ok(base.map(|base| (base, path)))
    }

    pub(super) fn base_address(modules: &ProcessModules, library: &str) -> Result<Option<usize>> {
        Ok(find_library(modules, library)?.map(|(base, _)| base))
    }

    pub(super) fn export_address(modules: &ProcessModules, library: &str, symbol: &str) -> Result<Option<usize>> {
        let (base, path) = match find_library(modules, library)? {
            Some(found) => found,
            None => return Ok(None),
        };

        // Go through the target's root so libraries inside another mount
        // namespace are read from the right file.
        let image_path = Path::new(&format!("/proc/{}/root", modules.pid))
            .join(path.strip_prefix("/").unwrap_or(path.as_path()));
        debug!("reading exports of {} from {}", library, image_path.display());
        let image = fs::read(&image_path)?;
        let elf = Elf::parse(&image)?;

        let first_load = elf.program_headers.iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| ph.p_vaddr)
            .min()
            .unwrap_or(0);
        let bias = (base as u64).wrapping_sub(first_load & !(page_size() - 1));

        let address = elf.dynsyms.iter()
            .enumerate()
            .filter(|(index, sym)| is_default_export(&elf, *index, sym))
            .find(|(_, sym)| elf.dynstrtab.get_at(sym.st_name) == Some(symbol))
            .map(|(_, sym)| bias.wrapping_add(sym.st_value) as usize);
        Ok(address)
    }

    /// Defined code or data that a dynamic link against the library would bind
    /// to. Thread-local symbols have no fixed address, and hidden versions
    /// (`name@VER` as opposed to `name@@VER`) only serve old binaries.
    ///
    /// For `STT_GNU_IFUNC` this is the address of the resolver, not of the
    /// implementation it picks at load time.
    fn is_default_export(elf: &Elf, index: usize, sym: &Sym) -> bool {
        if sym.st_shndx == SHN_UNDEF as usize || sym.st_value == 0 {
            return false;
        }
        if !matches!(sym.st_type(), STT_FUNC | STT_OBJECT | STT_GNU_IFUNC) {
            return false;
        }
        match elf.versym.as_ref().and_then(|versym| versym.get_at(index)) {
            Some(version) => !version.is_hidden(),
            None => true,
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::OsString;
    use std::io;
    use std::mem;
    use std::os::windows::ffi::OsStringExt;
    use std::path::{Path, PathBuf};

    use goblin::pe::PE;
    use windows_sys::Win32::Foundation::{CloseHandle, FALSE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
        TH32CS_SNAPMODULE32,
    };

    use super::ProcessModules;
    use crate::error::Result;

    fn from_wide(wide: &[u16]) -> OsString {
        let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
        OsString::from_wide(&wide[..len])
    }

    /// Base address and path of the loaded module matching `library`. Module
    /// names compare case-insensitively, like the loader does.
    fn find_library(modules: &ProcessModules, library: &str) -> Result<Option<(usize, PathBuf)>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, modules.pid) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error().into());
        }

        let mut entry: MODULEENTRY32W = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<MODULEENTRY32W>() as u32;

        let mut found = None;
        let mut more = unsafe { Module32FirstW(snapshot, &mut entry) } != FALSE;
        while more {
            let name = from_wide(&entry.szModule);
            let path = PathBuf::from(from_wide(&entry.szExePath));
            if name.to_string_lossy().eq_ignore_ascii_case(library) || path == Path::new(library) {
                found = Some((entry.modBaseAddr as usize, path));
                break;
            }
            more = unsafe { Module32NextW(snapshot, &mut entry) } != FALSE;
        }

        unsafe { CloseHandle(snapshot) };
        Ok(found)
    }

    pub(super) fn base_address(modules: &ProcessModules, library: &str) -> Result<Option<usize>> {
        Ok(find_library(modules, library)?.map(|(base, _)| base))
    }

    pub(super) fn export_address(modules: &ProcessModules, library: &str, symbol: &str) -> Result<Option<usize>> {
        let (base, path) = match find_library(modules, library)? {
            Some(found) => found,
            None => return Ok(None),
        };
        debug!("reading exports of {} from {}", library, path.display());
        let image = std::fs::read(&path)?;
        let pe = PE::parse(&image)?;
        let address = pe.exports.iter()
            .filter(|export| export.reexport.is_none())
            .find(|export| export.name == Some(symbol))
            .map(|export| base + export.rva);
        Ok(address)
    }
}

#[cfg(not(any(target_os="linux", windows)))]
mod platform {
    use super::ProcessModules;
    use crate::error::{Error, Result};

    pub(super) fn base_address(_modules: &ProcessModules, _library: &str) -> Result<Option<usize>> {
        Err(Error::Unsupported("module resolution"))
    }

    pub(super) fn export_address(_modules: &ProcessModules, _library: &str, _symbol: &str) -> Result<Option<usize>> {
        Err(Error::Unsupported("module resolution"))
    }
}
