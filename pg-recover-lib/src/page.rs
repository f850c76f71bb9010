//! Page and line-pointer data model (spec §3 "Page", "Line pointer"),
//! adapted from the teacher's `PageHeaderData`/`ItemIdData` to parse
//! directly out of an in-memory page buffer (`&[u8]`) rather than a
//! streaming `Read`, since both the TOAST index builder and the WAL FPW
//! cache hold whole pages in memory.

use bitflags::bitflags;

use crate::error::WalError;

pub const PAGE_SIZE: usize = 8192;

bitflags! {
    /// Flags recorded in `pd_flags` (spec §3 "Page").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const HAS_FREE_LINES = 0x0001;
        const PAGE_FULL       = 0x0002;
        const ALL_VISIBLE     = 0x0004;
    }
}

/// Fixed 24-byte page header (spec §3 invariant
/// `lower ≤ upper ≤ special ≤ 8192`).
#[derive(Debug, Clone, Copy)]
pub struct PageHeaderData {
    pub lsn: u64,
    pub checksum: u16,
    pub flags: PageFlags,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
    pub prune_xid: u32,
}

pub const SIZE_OF_PAGE_HEADER: usize = 24;

pub fn read_page_header(page: &[u8]) -> Result<PageHeaderData, WalError> {
    if page.len() < SIZE_OF_PAGE_HEADER {
        return Err(WalError::InvalidPageHeader { lsn: 0, reason: "page shorter than fixed header" });
    }
    let lsn = u64::from_le_bytes(page[0..8].try_into().unwrap());
    let checksum = u16::from_le_bytes(page[8..10].try_into().unwrap());
    let flags = PageFlags::from_bits_truncate(u16::from_le_bytes(page[10..12].try_into().unwrap()));
    let lower = u16::from_le_bytes(page[12..14].try_into().unwrap());
    let upper = u16::from_le_bytes(page[14..16].try_into().unwrap());
    let special = u16::from_le_bytes(page[16..18].try_into().unwrap());
    let pagesize_version = u16::from_le_bytes(page[18..20].try_into().unwrap());
    let prune_xid = u32::from_le_bytes(page[20..24].try_into().unwrap());

    let header = PageHeaderData { lsn, checksum, flags, lower, upper, special, pagesize_version, prune_xid };
    if !(header.lower as usize <= header.upper as usize && header.upper as usize <= header.special as usize && header.special as usize <= page.len()) {
        return Err(WalError::InvalidPageHeader { lsn: 0, reason: "lower/upper/special ordering violated" });
    }
    Ok(header)
}

/// Line pointer status (spec §3 "Line pointer (ItemId)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpFlags {
    Unused,
    Normal,
    Redirect,
    Dead,
}

impl LpFlags {
    fn from_bits(bits: u8) -> LpFlags {
        match bits & 0x03 {
            0 => LpFlags::Unused,
            1 => LpFlags::Normal,
            2 => LpFlags::Redirect,
            _ => LpFlags::Dead,
        }
    }
}

/// One 32-bit line pointer packing `{offset, flags, length}` (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct ItemId {
    raw: u32,
}

impl ItemId {
    pub fn from_bytes(bytes: [u8; 4]) -> ItemId {
        ItemId { raw: u32::from_le_bytes(bytes) }
    }

    pub fn offset(&self) -> u16 {
        (self.raw & 0x7fff) as u16
    }

    pub fn flags(&self) -> LpFlags {
        LpFlags::from_bits(((self.raw >> 15) & 0x03) as u8)
    }

    pub fn length(&self) -> u16 {
        ((self.raw >> 17) & 0x7fff) as u16
    }
}

/// Read every line pointer in `page`'s item array (between the fixed
/// header and `pd_lower`).
pub fn read_item_identifiers(page: &[u8], header: &PageHeaderData) -> Result<Vec<ItemId>, WalError> {
    let lower = header.lower as usize;
    if lower < SIZE_OF_PAGE_HEADER || (lower - SIZE_OF_PAGE_HEADER) % 4 != 0 {
        return Err(WalError::InvalidPageHeader { lsn: 0, reason: "pd_lower not aligned to item array" });
    }
    let count = (lower - SIZE_OF_PAGE_HEADER) / 4;
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let start = SIZE_OF_PAGE_HEADER + i * 4;
        let bytes: [u8; 4] = page[start..start + 4].try_into().unwrap();
        items.push(ItemId::from_bytes(bytes));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[12..14].copy_from_slice(&(SIZE_OF_PAGE_HEADER as u16 + 4).to_le_bytes()); // lower: 1 item
        page[14..16].copy_from_slice(&8000u16.to_le_bytes()); // upper
        page[16..18].copy_from_slice(&(PAGE_SIZE as u16).to_le_bytes()); // special
        page
    }

    #[test]
    fn reads_header_and_validates_ordering() {
        let page = blank_page();
        let header = read_page_header(&page).unwrap();
        assert_eq!(header.lower as usize, SIZE_OF_PAGE_HEADER + 4);
        assert_eq!(header.special as usize, PAGE_SIZE);
    }

    #[test]
    fn rejects_out_of_order_offsets() {
        let mut page = blank_page();
        page[14..16].copy_from_slice(&0u16.to_le_bytes()); // upper < lower
        assert!(read_page_header(&page).is_err());
    }

    #[test]
    fn decodes_one_normal_item_pointer() {
        let page = blank_page();
        let header = read_page_header(&page).unwrap();
        let mut page = page;
        let item = (8000u32) | (1u32 << 15) | (100u32 << 17); // offset=8000, NORMAL, len=100
        page[SIZE_OF_PAGE_HEADER..SIZE_OF_PAGE_HEADER + 4].copy_from_slice(&item.to_le_bytes());
        let items = read_item_identifiers(&page, &header).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].offset(), 8000);
        assert_eq!(items[0].flags(), LpFlags::Normal);
        assert_eq!(items[0].length(), 100);
    }
}
