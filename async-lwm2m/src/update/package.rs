// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Update package formats.
//!
//! ```text
//! v1:    magic[8] version:u16 forced_error:u16 crc32:u32 payload
//! v2:    magic[8] version:u16 forced_error:u16 crc32:u32 linked[8]
//!        pkg_version_len:u8 pkg_version[..24] payload
//! multi: "MULTIPKG" version:u16 count:u16 len:u32*count packages
//! ```
//!
//! All integers are big-endian. The CRC covers the payload only.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Firmware Update (object 5) package magic.
pub const MAGIC_FW: [u8; 8] = *b"ANJAY_FW";

/// Software Management (object 9) package magic.
pub const MAGIC_SW: [u8; 8] = *b"ANJAY_SW";

/// Advanced Firmware Update application partition.
pub const MAGIC_APP: [u8; 8] = *b"AJAY_APP";

/// Advanced Firmware Update TEE partition.
pub const MAGIC_TEE: [u8; 8] = *b"AJAY_TEE";

/// Advanced Firmware Update bootloader partition.
pub const MAGIC_BOOT: [u8; 8] = *b"AJAYBOOT";

/// Advanced Firmware Update modem partition.
pub const MAGIC_MODEM: [u8; 8] = *b"AJAYMODE";

/// Multi-package container.
pub const MAGIC_MULTI: [u8; 8] = *b"MULTIPKG";

/// Number of entries in the v2 linked-slot table.
pub const LINKED_SLOTS: usize = 8;

/// Unused linked slot.
pub const LINKED_SLOT_EMPTY: u8 = 0xFF;

/// Longest package version string in a v2 header.
pub const MAX_PKG_VERSION_LEN: usize = 24;

const V1_HEADER_LEN: usize = 16;
const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC, as used by zlib) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Test hook embedded in a package header, selecting how the installer
/// misbehaves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ForcedError {
    /// Behave normally.
    None,
    /// Fail the download with Out of Memory.
    OutOfMemory,
    /// Fail the upgrade.
    FailedUpdate,
    /// Report success one scheduler tick after re-registration.
    DelayedSuccess,
    /// Report failure one scheduler tick after re-registration.
    DelayedFailedUpdate,
    /// Report success from inside perform-upgrade, without a restart.
    SetSuccessInPerformUpgrade,
    /// Report failure from inside perform-upgrade, without a restart.
    SetFailureInPerformUpgrade,
    /// Accept the upgrade and never report anything.
    DoNothing,
    /// Defer the upgrade.
    Defer,
    /// Fail a software install.
    FailureInPerformInstall,
    /// Fail a software uninstall.
    FailureInPerformUninstall,
    /// Fail a software activation.
    FailureInPerformActivate,
    /// Fail a software deactivation.
    FailureInPerformDeactivate,
    /// Fail the download with Not Enough Space.
    NoSpace,
}

impl ForcedError {
    /// Decodes the header field.
    pub fn from_u16(x: u16) -> Option<ForcedError> {
        Some(match x {
            0 => ForcedError::None,
            1 => ForcedError::OutOfMemory,
            2 => ForcedError::FailedUpdate,
            3 => ForcedError::DelayedSuccess,
            4 => ForcedError::DelayedFailedUpdate,
            5 => ForcedError::SetSuccessInPerformUpgrade,
            6 => ForcedError::SetFailureInPerformUpgrade,
            7 => ForcedError::DoNothing,
            8 => ForcedError::Defer,
            9 => ForcedError::FailureInPerformInstall,
            10 => ForcedError::FailureInPerformUninstall,
            11 => ForcedError::FailureInPerformActivate,
            12 => ForcedError::FailureInPerformDeactivate,
            13 => ForcedError::NoSpace,
            _ => return None,
        })
    }

    /// The header field value.
    pub fn as_u16(self) -> u16 {
        match self {
            ForcedError::None => 0,
            ForcedError::OutOfMemory => 1,
            ForcedError::FailedUpdate => 2,
            ForcedError::DelayedSuccess => 3,
            ForcedError::DelayedFailedUpdate => 4,
            ForcedError::SetSuccessInPerformUpgrade => 5,
            ForcedError::SetFailureInPerformUpgrade => 6,
            ForcedError::DoNothing => 7,
            ForcedError::Defer => 8,
            ForcedError::FailureInPerformInstall => 9,
            ForcedError::FailureInPerformUninstall => 10,
            ForcedError::FailureInPerformActivate => 11,
            ForcedError::FailureInPerformDeactivate => 12,
            ForcedError::NoSpace => 13,
        }
    }
}

impl Default for ForcedError {
    fn default() -> Self {
        ForcedError::None
    }
}

/// Why a package was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    /// Shorter than its header claims.
    #[error("package truncated")]
    Truncated,

    /// Unknown format version.
    #[error("unsupported package format version {0}")]
    UnsupportedVersion(u16),

    /// Unknown forced-error selector.
    #[error("unknown forced error {0}")]
    UnknownForcedError(u16),

    /// Package version string longer than allowed, or not UTF-8.
    #[error("malformed package version")]
    BadPackageVersion,

    /// Payload does not match the CRC.
    #[error("CRC mismatch: header {expected:08x}, payload {actual:08x}")]
    CrcMismatch {
        /// CRC from the header.
        expected: u32,
        /// CRC of the payload.
        actual: u32,
    },

    /// Intact package meant for something else.
    #[error("unexpected package magic {0:?}")]
    MagicMismatch([u8; 8]),

    /// Malformed multi-package container.
    #[error("malformed multi-package")]
    BadMultiPackage,
}

impl PackageError {
    /// True for errors that mean the bytes are damaged, as opposed to
    /// well-formed but unsuitable.
    pub fn is_integrity_failure(&self) -> bool {
        !matches!(self, PackageError::MagicMismatch(_))
    }
}

/// Parsed package header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageHeader {
    /// Magic.
    pub magic: [u8; 8],
    /// Format version, 1 or 2.
    pub version: u16,
    /// Test hook.
    pub forced_error: ForcedError,
    /// CRC-32 of the payload.
    pub crc: u32,
    /// Linked slots (v2), without empty entries.
    pub linked: Vec<u8>,
    /// Package version string (v2).
    pub package_version: Option<String>,
}

/// A parsed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Header.
    pub header: PackageHeader,
    /// Payload.
    pub payload: Vec<u8>,
}

/// Reads the forced-error selector from the first bytes of a package, as
/// soon as enough of it has arrived.
pub fn peek_forced_error(prefix: &[u8]) -> Option<ForcedError> {
    if prefix.len() < 12 || prefix[..8] == MAGIC_MULTI {
        return None;
    }
    ForcedError::from_u16(BigEndian::read_u16(&prefix[10..12]))
}

impl Package {
    /// Parses a v1 or v2 package without checking magic or CRC.
    pub fn parse(bytes: &[u8]) -> Result<Package, PackageError> {
        if bytes.len() < V1_HEADER_LEN {
            return Err(PackageError::Truncated);
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);
        let version = BigEndian::read_u16(&bytes[8..10]);
        let forced = BigEndian::read_u16(&bytes[10..12]);
        let forced_error =
            ForcedError::from_u16(forced).ok_or(PackageError::UnknownForcedError(forced))?;
        let crc = BigEndian::read_u32(&bytes[12..16]);

        let mut header = PackageHeader {
            magic,
            version,
            forced_error,
            crc,
            ..Default::default()
        };

        let payload_start = match version {
            1 => V1_HEADER_LEN,
            2 => {
                let slots_end = V1_HEADER_LEN + LINKED_SLOTS;
                if bytes.len() < slots_end + 1 {
                    return Err(PackageError::Truncated);
                }
                header.linked = bytes[V1_HEADER_LEN..slots_end]
                    .iter()
                    .copied()
                    .filter(|slot| *slot != LINKED_SLOT_EMPTY)
                    .collect();

                let len = bytes[slots_end] as usize;
                if len > MAX_PKG_VERSION_LEN {
                    return Err(PackageError::BadPackageVersion);
                }
                let start = slots_end + 1;
                if bytes.len() < start + len {
                    return Err(PackageError::Truncated);
                }
                let text = std::str::from_utf8(&bytes[start..start + len])
                    .map_err(|_| PackageError::BadPackageVersion)?;
                header.package_version = Some(text.to_string());
                start + len
            }
            other => return Err(PackageError::UnsupportedVersion(other)),
        };

        Ok(Package {
            header,
            payload: bytes[payload_start..].to_vec(),
        })
    }

    /// Parses and verifies a package meant for `expected_magic`.
    ///
    /// The CRC is checked first, so a damaged package is an integrity
    /// failure whatever its magic; an intact one with another magic is a
    /// [`PackageError::MagicMismatch`].
    pub fn verify(bytes: &[u8], expected_magic: &[u8; 8]) -> Result<Package, PackageError> {
        let package = Package::parse(bytes)?;
        let actual = crc32(&package.payload);
        if actual != package.header.crc {
            return Err(PackageError::CrcMismatch {
                expected: package.header.crc,
                actual,
            });
        }
        if package.header.magic != *expected_magic {
            return Err(PackageError::MagicMismatch(package.header.magic));
        }
        Ok(package)
    }

    /// The part of the package version before the first `.`; linked
    /// packages must share it.
    pub fn version_family(&self) -> Option<&str> {
        self.header
            .package_version
            .as_deref()
            .map(|v| v.split('.').next().unwrap_or(v))
    }
}

/// Builds a v1 package.
pub fn build_v1(magic: &[u8; 8], forced_error: ForcedError, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(V1_HEADER_LEN + payload.len());
    out.extend_from_slice(magic);
    // Writes into a Vec cannot fail.
    let _ = out.write_u16::<BigEndian>(1);
    let _ = out.write_u16::<BigEndian>(forced_error.as_u16());
    let _ = out.write_u32::<BigEndian>(crc32(payload));
    out.extend_from_slice(payload);
    out
}

/// Builds a v2 package. At most [`LINKED_SLOTS`] links and
/// [`MAX_PKG_VERSION_LEN`] bytes of version are kept.
pub fn build_v2(
    magic: &[u8; 8],
    forced_error: ForcedError,
    linked: &[u8],
    package_version: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(magic);
    let _ = out.write_u16::<BigEndian>(2);
    let _ = out.write_u16::<BigEndian>(forced_error.as_u16());
    let _ = out.write_u32::<BigEndian>(crc32(payload));

    let mut slots = [LINKED_SLOT_EMPTY; LINKED_SLOTS];
    for (slot, link) in slots.iter_mut().zip(linked) {
        *slot = *link;
    }
    out.extend_from_slice(&slots);

    let version = &package_version.as_bytes()[..package_version.len().min(MAX_PKG_VERSION_LEN)];
    out.push(version.len() as u8);
    out.extend_from_slice(version);
    out.extend_from_slice(payload);
    out
}

/// True if `bytes` starts like a multi-package.
pub fn is_multi(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes[..8] == MAGIC_MULTI
}

/// Splits a multi-package into its sub-packages.
pub fn split_multi(bytes: &[u8]) -> Result<Vec<&[u8]>, PackageError> {
    if !is_multi(bytes) || bytes.len() < 12 {
        return Err(PackageError::BadMultiPackage);
    }
    let version = BigEndian::read_u16(&bytes[8..10]);
    if version != 3 {
        return Err(PackageError::UnsupportedVersion(version));
    }
    let count = BigEndian::read_u16(&bytes[10..12]) as usize;
    let table_end = 12 + 4 * count;
    if bytes.len() < table_end {
        return Err(PackageError::Truncated);
    }

    let mut packages = Vec::with_capacity(count);
    let mut start = table_end;
    for i in 0..count {
        let len = BigEndian::read_u32(&bytes[12 + 4 * i..16 + 4 * i]) as usize;
        let end = start.checked_add(len).ok_or(PackageError::BadMultiPackage)?;
        if bytes.len() < end {
            return Err(PackageError::Truncated);
        }
        packages.push(&bytes[start..end]);
        start = end;
    }
    Ok(packages)
}

/// Builds a multi-package.
pub fn build_multi(packages: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC_MULTI);
    let _ = out.write_u16::<BigEndian>(3);
    let _ = out.write_u16::<BigEndian>(packages.len() as u16);
    for package in packages {
        let _ = out.write_u32::<BigEndian>(package.len() as u32);
    }
    for package in packages {
        out.extend_from_slice(package);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &[u8] = b"#!/bin/sh\necho updated\n";

    #[test]
    fn v1_layout() {
        let bytes = build_v1(&MAGIC_FW, ForcedError::None, SCRIPT);
        assert_eq!(b"ANJAY_FW", &bytes[..8]);
        assert_eq!(&[0u8, 1, 0, 0], &bytes[8..12]);
        assert_eq!(crc32(SCRIPT).to_be_bytes(), bytes[12..16]);

        let package = Package::verify(&bytes, &MAGIC_FW).unwrap();
        assert_eq!(SCRIPT, package.payload.as_slice());
        assert_eq!(ForcedError::None, package.header.forced_error);
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(0xCBF4_3926, crc32(b"123456789"));
    }

    #[test]
    fn integrity_and_magic() {
        let mut bytes = build_v1(&MAGIC_FW, ForcedError::None, SCRIPT);
        assert_eq!(
            Err(PackageError::MagicMismatch(MAGIC_SW)),
            Package::verify(&build_v1(&MAGIC_SW, ForcedError::None, SCRIPT), &MAGIC_FW)
        );

        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Package::verify(&bytes, &MAGIC_FW).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(!PackageError::MagicMismatch(MAGIC_SW).is_integrity_failure());

        assert_eq!(Err(PackageError::Truncated), Package::parse(&bytes[..10]));
    }

    #[test]
    fn v2_linked_slots() {
        let bytes = build_v2(&MAGIC_APP, ForcedError::DelayedSuccess, &[1, 3], "2.1.0", b"app");
        assert_eq!(&[1u8, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF], &bytes[16..24]);

        let package = Package::verify(&bytes, &MAGIC_APP).unwrap();
        assert_eq!(vec![1, 3], package.header.linked);
        assert_eq!(Some("2.1.0"), package.header.package_version.as_deref());
        assert_eq!(Some("2"), package.version_family());
        assert_eq!(b"app".to_vec(), package.payload);
        assert_eq!(Some(ForcedError::DelayedSuccess), peek_forced_error(&bytes));
    }

    #[test]
    fn multi() {
        let app = build_v1(&MAGIC_APP, ForcedError::None, b"a");
        let tee = build_v1(&MAGIC_TEE, ForcedError::None, b"bb");
        let bytes = build_multi(&[app.clone(), tee.clone()]);
        assert_eq!(None, peek_forced_error(&bytes));

        let parts = split_multi(&bytes).unwrap();
        assert_eq!(vec![app.as_slice(), tee.as_slice()], parts);
        assert_eq!(
            Err(PackageError::Truncated),
            split_multi(&bytes[..bytes.len() - 1])
        );
    }

    #[test]
    fn unknown_forced_error() {
        let mut bytes = build_v1(&MAGIC_FW, ForcedError::None, b"");
        bytes[11] = 99;
        assert_eq!(
            Err(PackageError::UnknownForcedError(99)),
            Package::parse(&bytes)
        );
    }
}
