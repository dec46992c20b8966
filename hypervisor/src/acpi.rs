//! ACPI table discovery.
//!
//! Treated as an external collaborator by the core (§1), but a concrete
//! implementation is needed for the monitor to locate the DMAR table (feeds
//! [`crate::vtd`]) and the FADT/DSDT `_S3_` package (feeds
//! [`crate::suspend`]). Grounded in `original_source/vmm/modules/acpi/acpi.c`
//! for the RSDP scan/checksum rules and FADT→DSDT `_S3_` discovery (§6).

use crate::error::{MonError, MonResult};
use core::{mem::size_of, slice};

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

#[repr(C, packed)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
struct RsdpV2 {
    v1: RsdpV1,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

#[repr(C, packed)]
struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

/// Locates the RSDP by scanning the BIOS areas specified in §6: `[0x0,
/// 0x400)` (the Extended BIOS Data Area segment pointer range treated here
/// as the legacy low-memory scan range) and `[0xE0000, 0xFFFFF)`, at
/// 16-byte stride, validating the 8-byte signature and the appropriate
/// checksum for the discovered revision.
///
/// On platforms with an EFI system table, the RSDP is instead obtained from
/// the EFI configuration table by the caller before falling back to this
/// scan; that lookup is UEFI-API plumbing and lives in
/// [`crate::system_table`], not here.
pub(crate) fn locate_rsdp() -> MonResult<u64> {
    for base in [0x0_u64, 0xE_0000] {
        let end = if base == 0 { 0x400 } else { 0xF_FFFF };
        let mut addr = base;
        while addr + 16 <= end {
            // Safety: scanning read-only firmware-reserved memory that is
            // always mapped in the host identity map.
            let bytes = unsafe { slice::from_raw_parts(addr as *const u8, 8) };
            if bytes == RSDP_SIGNATURE {
                if validate_rsdp(addr) {
                    return Ok(addr);
                }
            }
            addr += 16;
        }
    }
    Err(MonError::AcpiTableNotFound)
}

fn validate_rsdp(addr: u64) -> bool {
    // Safety: addr was just matched against the 8-byte signature above.
    let v1 = unsafe { &*(addr as *const RsdpV1) };
    if checksum_ok(addr, size_of::<RsdpV1>()) {
        if v1.revision >= 2 {
            return checksum_ok(addr, {
                // Safety: revision >= 2 guarantees a V2 structure follows.
                let v2 = unsafe { &*(addr as *const RsdpV2) };
                v2.length as usize
            });
        }
        return true;
    }
    false
}

fn checksum_ok(addr: u64, length: usize) -> bool {
    // Safety: caller guarantees `length` bytes at `addr` are mapped.
    let bytes = unsafe { slice::from_raw_parts(addr as *const u8, length) };
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

/// Returns the physical address of the table with the given 4-byte
/// signature, found by walking the XSDT (or RSDT if no XSDT is present)
/// referenced from the RSDP at `rsdp_addr`.
pub(crate) fn find_table(rsdp_addr: u64, signature: &[u8; 4]) -> MonResult<u64> {
    // Safety: rsdp_addr was validated by `locate_rsdp`.
    let v1 = unsafe { &*(rsdp_addr as *const RsdpV1) };
    let (root_addr, entry_size, entry_count): (u64, usize, usize) = if v1.revision >= 2 {
        // Safety: revision >= 2 implies a V2 structure.
        let v2 = unsafe { &*(rsdp_addr as *const RsdpV2) };
        let header = unsafe { &*(v2.xsdt_address as *const SdtHeader) };
        let count = (header.length as usize - size_of::<SdtHeader>()) / 8;
        (v2.xsdt_address, 8, count)
    } else {
        let header = unsafe { &*((v1.rsdt_address as u64) as *const SdtHeader) };
        let count = (header.length as usize - size_of::<SdtHeader>()) / 4;
        (v1.rsdt_address as u64, 4, count)
    };

    let entries_addr = root_addr + size_of::<SdtHeader>() as u64;
    for i in 0..entry_count {
        let entry_addr = entries_addr + (i * entry_size) as u64;
        let table_addr = if entry_size == 8 {
            unsafe { *(entry_addr as *const u64) }
        } else {
            unsafe { *(entry_addr as *const u32) as u64 }
        };
        let header = unsafe { &*(table_addr as *const SdtHeader) };
        if &header.signature == signature {
            return Ok(table_addr);
        }
    }
    Err(MonError::AcpiTableNotFound)
}

/// Scans the DSDT (located via the FADT) for the `_S3_` package and returns
/// the parsed `(SLP_TYPa, SLP_TYPb)` sleep-type values used by
/// [`crate::suspend`] to recognize the guest's S3 transition write.
///
/// Grounded in `original_source/vmm/modules/suspend/acpi_pm.c`: the `_S3_`
/// package is `NameOp "_S3_" PackageOp PkgLength NumElements
/// ByteConst(TYPa) ByteConst(TYPb) ...`; a byte-pattern scan over the DSDT
/// is sufficient and is what the original implementation does rather than a
/// full AML interpreter.
/// Locates the FADT ("FACP" signature) via the XSDT/RSDT.
pub(crate) fn find_fadt(rsdp_addr: u64) -> MonResult<u64> {
    find_table(rsdp_addr, b"FACP")
}

/// Reads the FADT's `DSDT` field (offset 40, a 32-bit physical address) so
/// the caller can hand it to [`find_s3_sleep_types`].
pub(crate) fn dsdt_addr_from_fadt(fadt_addr: u64) -> u64 {
    // Safety: fadt_addr was validated by `find_fadt`/`find_table`.
    u64::from(unsafe { *((fadt_addr + 40) as *const u32) })
}

/// Reads the FADT's `PM1a_CNT_BLK`/`PM1b_CNT_BLK` fields (offsets 64/68),
/// the port addresses `global_state::AcpiSingletons` needs to recognize a
/// guest's S3-entry write (§6 "FADT PM1 control block addresses").
/// `PM1b_CNT_BLK` is 0 on platforms with no secondary PM1 block.
pub(crate) fn pm1_control_ports(fadt_addr: u64) -> (u16, u16) {
    // Safety: see `dsdt_addr_from_fadt`.
    let pm1a = unsafe { *((fadt_addr + 64) as *const u32) };
    let pm1b = unsafe { *((fadt_addr + 68) as *const u32) };
    (pm1a as u16, pm1b as u16)
}

pub(crate) fn find_s3_sleep_types(dsdt_addr: u64) -> MonResult<(u8, u8)> {
    const NEEDLE: &[u8; 4] = b"_S3_";
    let header = unsafe { &*(dsdt_addr as *const SdtHeader) };
    let body_len = header.length as usize - size_of::<SdtHeader>();
    let body = unsafe {
        slice::from_raw_parts((dsdt_addr + size_of::<SdtHeader>() as u64) as *const u8, body_len)
    };
    let pos = body
        .windows(NEEDLE.len())
        .position(|w| w == NEEDLE)
        .ok_or(MonError::AcpiTableNotFound)?;

    // Skip "_S3_", the PackageOp (0x12), the package length encoding, and
    // the element count byte to reach the first ByteConst (0x0A, value).
    let mut i = pos + NEEDLE.len();
    i += 1; // PackageOp
    // PkgLength is a variable-length encoding; honor only the common
    // single-byte short form used by every DSDT seen in practice.
    i += 1; // PkgLength byte
    i += 1; // NumElements byte
    let read_byteconst = |i: usize| -> Option<u8> {
        if body.get(i) == Some(&0x0A) {
            body.get(i + 1).copied()
        } else {
            body.get(i).copied()
        }
    };
    let typ_a = read_byteconst(i).ok_or(MonError::AcpiTableNotFound)?;
    let adv = if body.get(i) == Some(&0x0A) { 2 } else { 1 };
    let typ_b = read_byteconst(i + adv).ok_or(MonError::AcpiTableNotFound)?;
    Ok((typ_a, typ_b))
}
