use std::fmt;

use crate::error::{Error, Result};

/// Where the watched function lives inside its library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    /// An exported symbol name.
    Export(String),
    /// A fixed byte offset from the library's base address.
    Offset(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteDescriptor {
    /// Shared-object or DLL name, or a full path to it.
    pub library: String,
    pub locator: Locator,
}

impl SiteDescriptor {
    pub fn export<L: Into<String>, S: Into<String>>(library: L, symbol: S) -> SiteDescriptor {
        SiteDescriptor {
            library: library.into(),
            locator: Locator::Export(symbol.into()),
        }
    }

    pub fn offset<L: Into<String>>(library: L, offset: u64) -> SiteDescriptor {
        SiteDescriptor {
            library: library.into(),
            locator: Locator::Offset(offset),
        }
    }

    fn not_found(&self) -> Error {
        Error::SiteNotFound {
            library: self.library.clone(),
            symbol: match self.locator {
                Locator::Export(ref symbol) => Some(symbol.clone()),
                Locator::Offset(_) => None,
            },
        }
    }
}

impl fmt::Display for SiteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locator {
            Locator::Export(ref symbol) => write!(f, "{}!{}", self.library, symbol),
            Locator::Offset(offset) => write!(f, "{}+{:#x}", self.library, offset),
        }
    }
}

/// A resolved function address. Fixed for the lifetime of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterceptSite {
    pub address: usize,
    pub descriptor: SiteDescriptor,
}

/// Module and export lookup in the target process.
///
/// `Ok(None)` means "not loaded" or "not exported"; errors are reserved for
/// failures to inspect the process at all.
pub trait ModuleResolver {
    fn base_address(&self, library: &str) -> Result<Option<usize>>;
    fn export_address(&self, library: &str, symbol: &str) -> Result<Option<usize>>;
}

impl<'a, T: ModuleResolver + ?Sized> ModuleResolver for &'a T {
    fn base_address(&self, library: &str) -> Result<Option<usize>> {
        (**self).base_address(library)
    }

    fn export_address(&self, library: &str, symbol: &str) -> Result<Option<usize>> {
        (**self).export_address(library, symbol)
    }
}

/// Turn a descriptor into a fixed address. The library must already be loaded;
/// nothing here waits or retries.
pub fn resolve<R>(resolver: &R, descriptor: &SiteDescriptor) -> Result<InterceptSite>
    where R: ModuleResolver + ?Sized
{
    let address = match descriptor.locator {
        Locator::Export(ref symbol) => resolver.export_address(&descriptor.library, symbol)?,
        Locator::Offset(offset) => resolver
            .base_address(&descriptor.library)?
            .and_then(|base| usize::try_from(offset).ok().and_then(|o| base.checked_add(o))),
    };

    match address {
        Some(address) => {
            info!("resolved {} to {:#x}", descriptor, address);
            Ok(InterceptSite { address, descriptor: descriptor.clone() })
        }
        None => {
            warn!("could not resolve {}", descriptor);
            Err(descriptor.not_found())
        }
    }
}
