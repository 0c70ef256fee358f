//! Capture configuration. Built once and handed to the session; never mutated.

use crate::site::SiteDescriptor;

pub const SMARTGLASS_ANDROID_LIBRARY: &str = "libSmartGlassCore.so";
pub const SMARTGLASS_KDF_EXPORT: &str = "xCryptLibKDF_Interop";

pub const SMARTGLASS_WINDOWS_LIBRARY: &str = "Microsoft.Xbox.SmartGlass.dll";
/// Offset of the KDF routine in the on-disk image.
pub const SMARTGLASS_KDF_OFFSET: u64 = 0x1A76B0;
/// Difference between the on-disk offset and where the section lands in memory.
pub const SMARTGLASS_SECTION_SHIFT: u64 = 0xC00;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub site: SiteDescriptor,
    /// 0-based argument holding the destination buffer address.
    pub pointer_arg: usize,
    /// 0-based argument holding the byte count. Only the low 32 bits are used.
    pub length_arg: usize,
    /// Written before the hex payload, followed by `": "`.
    pub label: String,
}

impl CaptureConfig {
    pub fn new<S: Into<String>>(site: SiteDescriptor, pointer_arg: usize, length_arg: usize, label: S) -> CaptureConfig {
        CaptureConfig {
            site,
            pointer_arg,
            length_arg,
            label: label.into(),
        }
    }

    /// SmartGlass core shared-secret derivation, located by export (Android).
    pub fn smartglass_android() -> CaptureConfig {
        CaptureConfig::new(
            SiteDescriptor::export(SMARTGLASS_ANDROID_LIBRARY, SMARTGLASS_KDF_EXPORT),
            1,
            2,
            "Shared Secret",
        )
    }

    /// SmartGlass core shared-secret derivation, located by offset (Windows 10).
    pub fn smartglass_windows() -> CaptureConfig {
        CaptureConfig::new(
            SiteDescriptor::offset(SMARTGLASS_WINDOWS_LIBRARY, SMARTGLASS_KDF_OFFSET + SMARTGLASS_SECTION_SHIFT),
            1,
            2,
            "SharedSecret",
        )
    }
}
