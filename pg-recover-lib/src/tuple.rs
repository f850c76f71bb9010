//! Component E: tuple decoder (spec §4.E), driving A-D across an
//! attribute list. Adapted from the teacher's `HeapTupleHeaderData`, now
//! parsed from a page-relative byte slice instead of a streaming `Read`.

use bitflags::bitflags;

use crate::attribute::{decode_attribute, AttributeDescriptor, FieldValue};
use crate::context::ScanContext;
use crate::error::DecodeError;
use crate::varlena::ToastPointer;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct Infomask2: u16 {
        const HEAP_NATTS_MASK = 0x07FF;
        const HEAP_KEYS_UPDATED = 0x2000;
        const HEAP_HOT_UPDATED = 0x4000;
        const HEAP_ONLY_TUPLE = 0x8000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct Infomask: u16 {
        const HEAP_HASNULL = 0x0001;
        const HEAP_HASVARWIDTH = 0x0002;
        const HEAP_HASEXTERNAL = 0x0004;
        const HEAP_HASOID_OLD = 0x0008;
        const HEAP_XMAX_KEYSHR_LOCK = 0x0010;
        const HEAP_COMBOCID = 0x0020;
        const HEAP_XMAX_EXCL_LOCK = 0x0040;
        const HEAP_XMAX_LOCK_ONLY = 0x0080;
        const HEAP_XMIN_COMMITTED = 0x0100;
        const HEAP_XMIN_INVALID = 0x0200;
        const HEAP_XMAX_COMMITTED = 0x0400;
        const HEAP_XMAX_INVALID = 0x0800;
        const HEAP_XMAX_IS_MULTI = 0x1000;
        const HEAP_UPDATED = 0x2000;
        const HEAP_MOVED_OFF = 0x4000;
        const HEAP_MOVED_IN = 0x8000;
    }
}

/// Fixed portion of a heap tuple header, 23 bytes on disk (spec §3
/// "Heap tuple").
#[derive(Debug, Clone, Copy)]
pub struct HeapTupleHeader {
    pub xmin: u32,
    pub xmax: u32,
    pub cid: u32,
    pub ctid_block: u32,
    pub ctid_offset: u16,
    pub infomask2: Infomask2,
    pub infomask: Infomask,
    pub t_hoff: u8,
}

pub const SIZE_OF_HEAP_TUPLE_HEADER_FIXED: usize = 23;

pub fn read_heap_tuple_header(tuple: &[u8]) -> Option<HeapTupleHeader> {
    if tuple.len() < SIZE_OF_HEAP_TUPLE_HEADER_FIXED {
        return None;
    }
    let xmin = u32::from_le_bytes(tuple[0..4].try_into().unwrap());
    let xmax = u32::from_le_bytes(tuple[4..8].try_into().unwrap());
    let cid = u32::from_le_bytes(tuple[8..12].try_into().unwrap());
    let ctid_block = u32::from_le_bytes(tuple[12..16].try_into().unwrap());
    let ctid_offset = u16::from_le_bytes(tuple[16..18].try_into().unwrap());
    let infomask2 = Infomask2::from_bits_truncate(u16::from_le_bytes(tuple[18..20].try_into().unwrap()));
    let infomask = Infomask::from_bits_truncate(u16::from_le_bytes(tuple[20..22].try_into().unwrap()));
    let t_hoff = tuple[22];
    Some(HeapTupleHeader { xmin, xmax, cid, ctid_block, ctid_offset, infomask2, infomask, t_hoff })
}

/// Just enough of the header to locate where attribute data begins;
/// used by the TOAST index builder, which only needs `t_hoff`.
pub fn peek_t_hoff(tuple: &[u8]) -> Option<usize> {
    read_heap_tuple_header(tuple).map(|h| h.t_hoff as usize)
}

impl HeapTupleHeader {
    pub fn natts(&self) -> usize {
        (self.infomask2.bits() & Infomask2::HEAP_NATTS_MASK.bits()) as usize
    }

    pub fn has_nulls(&self) -> bool {
        self.infomask.contains(Infomask::HEAP_HASNULL)
    }

    /// Xmax zero/invalid means live; a nonzero xmax without the
    /// lock-only bit means deleted or updated (spec §3 "Heap tuple").
    pub fn is_deleted_or_updated(&self) -> bool {
        self.xmax != 0 && !self.infomask.contains(Infomask::HEAP_XMAX_INVALID) && !self.infomask.contains(Infomask::HEAP_XMAX_LOCK_ONLY)
    }

    pub fn is_hot_updated(&self) -> bool {
        self.infomask2.contains(Infomask2::HEAP_HOT_UPDATED)
    }
}

/// One fully decoded row: a value per schema attribute (NULLs included).
#[derive(Debug, Clone)]
pub struct DecodedRow {
    pub fields: Vec<FieldValue>,
    /// True if the bytes consumed while decoding didn't exactly match the
    /// tuple's declared data length (spec §4.E step 4, `TrailingBytes`).
    pub trailing_bytes: bool,
}

/// Decode one heap tuple's attribute bytes against `schema`
/// (spec §4.E steps 1-4). `tuple` is the full tuple (header + data);
/// `toast` resolves any external TOAST pointer encountered.
pub fn decode_tuple(
    tuple: &[u8],
    schema: &[AttributeDescriptor],
    ctx: &ScanContext,
    mut toast: impl FnMut(&ToastPointer) -> Result<Vec<u8>, DecodeError>,
) -> Result<DecodedRow, DecodeError> {
    let header = read_heap_tuple_header(tuple).ok_or(DecodeError::ShortInput {
        offset: 0,
        needed: SIZE_OF_HEAP_TUPLE_HEADER_FIXED,
        available: tuple.len(),
    })?;

    let t_hoff = header.t_hoff as usize;
    if tuple.len() < t_hoff {
        return Err(DecodeError::ShortInput { offset: 0, needed: t_hoff, available: tuple.len() });
    }

    let null_bitmap: Option<&[u8]> = if header.has_nulls() {
        let nbytes = (schema.len().max(header.natts()) + 7) / 8;
        let start = SIZE_OF_HEAP_TUPLE_HEADER_FIXED;
        let end = (start + nbytes).min(t_hoff);
        Some(&tuple[start..end])
    } else {
        None
    };

    let data = &tuple[t_hoff..];
    let m = header.natts();
    let n = schema.len();
    let mut fields = Vec::with_capacity(n);
    let mut cursor = 0usize;

    for i in 0..n.min(m) {
        if let Some(bitmap) = null_bitmap {
            let byte = i / 8;
            let bit = i % 8;
            let is_null = byte >= bitmap.len() || (bitmap[byte] >> bit) & 1 == 0;
            if is_null {
                fields.push(FieldValue::Null);
                continue;
            }
        }

        let desc = &schema[i];
        let remaining = &data[cursor..];
        let (consumed, value) = decode_attribute(desc, remaining, t_hoff + cursor, ctx, &mut |ptr| toast(ptr))?;
        cursor += consumed;
        fields.push(value);
    }

    // Attributes declared in the schema beyond what this tuple version
    // physically stores (added by a later ALTER TABLE ADD COLUMN) render
    // as NULL (spec §4.E step 2).
    for _ in n.min(m)..n {
        fields.push(FieldValue::Null);
    }

    let trailing_bytes = cursor != data.len();
    Ok(DecodedRow { fields, trailing_bytes })
}

/// Compose an `UPDATE` statement comparing a pre-image and post-image row
/// pair (spec §4.E "Update-mode emission"). Returns `None` if every column
/// matches (a no-op update is not emitted).
pub fn diff_for_update(schema: &[AttributeDescriptor], old: &DecodedRow, new: &DecodedRow, key_column: usize) -> Option<(Vec<(String, String)>, (String, String))> {
    let mut changed = Vec::new();
    for (i, desc) in schema.iter().enumerate() {
        if i == key_column {
            continue;
        }
        let same = matches!(
            (&old.fields[i], &new.fields[i]),
            (FieldValue::Null, FieldValue::Null)
        ) || match (&old.fields[i], &new.fields[i]) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            _ => false,
        };
        if !same {
            if let FieldValue::Text(t) = &new.fields[i] {
                changed.push((desc.name.clone(), t.clone()));
            }
        }
    }
    if changed.is_empty() {
        return None;
    }
    let key_desc = &schema[key_column];
    let key_old = match &old.fields[key_column] {
        FieldValue::Text(t) => t.clone(),
        _ => String::new(),
    };
    Some((changed, (key_desc.name.clone(), key_old)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AlignCode;
    use crate::context::OutputMode;

    fn build_tuple(infomask2: u16, infomask: u16, t_hoff: u8, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; t_hoff as usize];
        buf[18..20].copy_from_slice(&infomask2.to_le_bytes());
        buf[20..22].copy_from_slice(&infomask.to_le_bytes());
        buf[22] = t_hoff;
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn decodes_two_int4_columns_no_nulls() {
        let schema = vec![
            AttributeDescriptor::new("a", "int4", 4, AlignCode::Int, -1),
            AttributeDescriptor::new("b", "int4", 4, AlignCode::Int, -1),
        ];
        let mut data = Vec::new();
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&2i32.to_le_bytes());
        let tuple = build_tuple(2, 0, 24, &data);
        let ctx = ScanContext::new("/tmp", OutputMode::Csv);
        let row = decode_tuple(&tuple, &schema, &ctx, |_| unreachable!()).unwrap();
        match (&row.fields[0], &row.fields[1]) {
            (FieldValue::Text(a), FieldValue::Text(b)) => {
                assert_eq!(a, "1");
                assert_eq!(b, "2");
            }
            _ => panic!("expected text fields"),
        }
    }

    #[test]
    fn null_bitmap_skips_attribute() {
        let schema = vec![
            AttributeDescriptor::new("a", "int4", 4, AlignCode::Int, -1),
            AttributeDescriptor::new("b", "int4", 4, AlignCode::Int, -1),
        ];
        let mut tuple = vec![0u8; 24];
        tuple[18..20].copy_from_slice(&2u16.to_le_bytes()); // natts=2
        tuple[20..22].copy_from_slice(&1u16.to_le_bytes()); // HEAP_HASNULL
        tuple[22] = 24;
        tuple[23] = 0b0000_0010; // bit1 set: attr1 not null, attr0 null
        tuple.extend_from_slice(&7i32.to_le_bytes());
        let ctx = ScanContext::new("/tmp", OutputMode::Csv);
        let row = decode_tuple(&tuple, &schema, &ctx, |_| unreachable!()).unwrap();
        assert!(matches!(row.fields[0], FieldValue::Null));
        match &row.fields[1] {
            FieldValue::Text(t) => assert_eq!(t, "7"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn schema_wider_than_tuple_fills_null() {
        let schema = vec![
            AttributeDescriptor::new("a", "int4", 4, AlignCode::Int, -1),
            AttributeDescriptor::new("b_added_later", "int4", 4, AlignCode::Int, -1),
        ];
        let tuple = build_tuple(1, 0, 24, &5i32.to_le_bytes());
        let ctx = ScanContext::new("/tmp", OutputMode::Csv);
        let row = decode_tuple(&tuple, &schema, &ctx, |_| unreachable!()).unwrap();
        assert!(matches!(row.fields[1], FieldValue::Null));
    }
}
