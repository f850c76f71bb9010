//! Component D: TOAST assembler (spec §4.D), grounded on
//! `original_source/read.c`'s `getToastHash`/`ToastChunkforOid` chunk-index
//! construction and `decode.c`'s `DeToast` reassembly loop.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::DecodeError;
use crate::varlena::{decompress_payload, CompressionMethod, ToastPointer};

const TOAST_PAGE_SIZE: usize = 8192;

/// Where one chunk of a TOASTed value lives on disk.
#[derive(Debug, Clone, Copy)]
struct ChunkLocation {
    block_number: u32,
    offset: u16,
    length: u16,
    chunk_seq: u32,
}

/// Index over a single TOAST relation's pages, built once and reused for
/// every value looked up against that relation (spec §4.D step 1 /
/// §5 "TOAST chunk index: built once ... thereafter read-only").
pub struct ToastIndex {
    /// Each value_oid may have more than one chunk run (an old and a new
    /// version can coexist); groups are tried in order until one fully
    /// satisfies `external_size` (spec §4.D "Ordering guarantee").
    groups: HashMap<u32, Vec<Vec<ChunkLocation>>>,
}

impl ToastIndex {
    /// Scan every page of `toast_path`, recording each tuple's
    /// `(value_oid, chunk_seq)` prefix and its page location.
    pub fn build(toast_path: &Path) -> Result<ToastIndex, DecodeError> {
        let mut file = File::open(toast_path).map_err(|_| DecodeError::AssemblyFailed {
            value_oid: 0,
            reason: format!("TOAST relation file not found: {}", toast_path.display()),
        })?;

        // per value_oid, chunk locations in file-scan order (not yet
        // deduplicated into contiguous sequence groups)
        let mut raw: HashMap<u32, Vec<ChunkLocation>> = HashMap::new();
        let mut block_number: u32 = 0;
        let mut page = vec![0u8; TOAST_PAGE_SIZE];
        loop {
            match file.read_exact(&mut page) {
                Ok(()) => {}
                Err(_) => break,
            }
            for (offset, length, value_oid, chunk_seq) in scan_toast_page(&page) {
                raw.entry(value_oid).or_default().push(ChunkLocation {
                    block_number,
                    offset,
                    length,
                    chunk_seq,
                });
            }
            block_number += 1;
        }

        let mut groups: HashMap<u32, Vec<Vec<ChunkLocation>>> = HashMap::new();
        for (oid, mut locs) in raw {
            locs.sort_by_key(|l| l.chunk_seq);
            // A new group starts whenever chunk_seq doesn't continue the
            // previous run (covers the old+new-version-coexist case).
            let mut runs: Vec<Vec<ChunkLocation>> = Vec::new();
            for loc in locs {
                match runs.last_mut() {
                    Some(run) if run.last().map(|l| l.chunk_seq + 1) == Some(loc.chunk_seq) => run.push(loc),
                    _ => runs.push(vec![loc]),
                }
            }
            groups.insert(oid, runs);
        }

        Ok(ToastIndex { groups })
    }
}

/// Walk one 8 KiB TOAST page's normal line pointers, returning
/// `(within-page offset, tuple length, value_oid, chunk_seq)` for each chunk
/// tuple found. The heap-tuple header precedes the
/// `(chunk_id u32, chunk_seq u32, ...)` payload, so this only needs
/// `t_hoff` to locate the prefix, not a full tuple decode.
fn scan_toast_page(page: &[u8]) -> Vec<(u16, u16, u32, u32)> {
    use crate::page::{read_item_identifiers, read_page_header, LpFlags};

    let mut found = Vec::new();
    let header = match read_page_header(page) {
        Ok(h) => h,
        Err(_) => return found,
    };
    let items = match read_item_identifiers(page, &header) {
        Ok(i) => i,
        Err(_) => return found,
    };
    for item in items {
        if item.flags() != LpFlags::Normal {
            continue;
        }
        let start = item.offset() as usize;
        let len = item.length() as usize;
        if start + len > page.len() || len < 8 {
            continue;
        }
        let tuple = &page[start..start + len];
        let t_hoff = match crate::tuple::peek_t_hoff(tuple) {
            Some(h) => h,
            None => continue,
        };
        if tuple.len() < t_hoff + 8 {
            continue;
        }
        let chunk_id = u32::from_le_bytes(tuple[t_hoff..t_hoff + 4].try_into().unwrap());
        let chunk_seq = u32::from_le_bytes(tuple[t_hoff + 4..t_hoff + 8].try_into().unwrap());
        found.push((start as u16, len as u16, chunk_id, chunk_seq));
    }
    found
}

/// Assembles TOAST pointers against one or more already-built indexes.
pub struct ToastAssembler<'a> {
    toast_path: &'a Path,
    index: &'a ToastIndex,
}

impl<'a> ToastAssembler<'a> {
    pub fn new(toast_path: &'a Path, index: &'a ToastIndex) -> Self {
        ToastAssembler { toast_path, index }
    }

    /// Reassemble the bytes referenced by `ptr` (spec §4.D steps 1-4).
    pub fn assemble(&self, ptr: &ToastPointer) -> Result<Vec<u8>, DecodeError> {
        let groups = self.index.groups.get(&ptr.value_oid).ok_or_else(|| DecodeError::AssemblyFailed {
            value_oid: ptr.value_oid,
            reason: "value_oid not present in TOAST index".to_string(),
        })?;

        let external_size = ptr.external_size.max(0) as usize;
        let mut file = File::open(self.toast_path).map_err(|_| DecodeError::AssemblyFailed {
            value_oid: ptr.value_oid,
            reason: format!("TOAST relation file not found: {}", self.toast_path.display()),
        })?;

        for group in groups {
            if let Ok(bytes) = self.try_group(&mut file, group, external_size) {
                let bytes = if ptr.compressed {
                    self.decompress_assembled(&bytes, ptr)?
                } else {
                    bytes
                };
                return Ok(bytes);
            }
        }

        Err(DecodeError::AssemblyFailed {
            value_oid: ptr.value_oid,
            reason: "no chunk group fully satisfied external_size".to_string(),
        })
    }

    fn try_group(&self, file: &mut File, group: &[ChunkLocation], external_size: usize) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(external_size);
        let mut page = vec![0u8; TOAST_PAGE_SIZE];
        for loc in group {
            if out.len() >= external_size {
                break;
            }
            file.seek(SeekFrom::Start(loc.block_number as u64 * TOAST_PAGE_SIZE as u64))
                .map_err(|_| DecodeError::AssemblyFailed { value_oid: 0, reason: "seek past end of TOAST file".to_string() })?;
            file.read_exact(&mut page)
                .map_err(|_| DecodeError::AssemblyFailed { value_oid: 0, reason: "short read of TOAST page".to_string() })?;
            let tuple_start = loc.offset as usize;
            let t_hoff = crate::tuple::peek_t_hoff(&page[tuple_start..])
                .ok_or_else(|| DecodeError::AssemblyFailed { value_oid: 0, reason: "malformed chunk tuple header".to_string() })?;
            // skip chunk_id/chunk_seq (8 bytes) then the chunk payload's own
            // varlena header (4 bytes, always the 4-byte uncompressed shape
            // for chunk payloads).
            let payload_start = tuple_start + t_hoff + 8 + 4;
            let tuple_end = tuple_start + loc.length as usize;
            if payload_start > page.len() || tuple_end > page.len() || payload_start > tuple_end {
                return Err(DecodeError::AssemblyFailed { value_oid: 0, reason: "chunk payload runs past page end".to_string() });
            }
            out.extend_from_slice(&page[payload_start..tuple_end]);
        }
        out.truncate(external_size.max(out.len().min(external_size)));
        if out.len() < external_size {
            return Err(DecodeError::AssemblyFailed { value_oid: 0, reason: "chunks exhausted before reaching external_size".to_string() });
        }
        Ok(out)
    }

    fn decompress_assembled(&self, bytes: &[u8], ptr: &ToastPointer) -> Result<Vec<u8>, DecodeError> {
        // The assembled buffer's own 4-byte compressed varlena header
        // records the method and raw size, per spec §4.D step 4.
        if bytes.len() < 8 {
            return Err(DecodeError::AssemblyFailed { value_oid: ptr.value_oid, reason: "compressed TOAST value too short for header".to_string() });
        }
        let tcinfo = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let raw_size = (tcinfo & 0x3fff_ffff) as usize;
        let method = if tcinfo >> 30 != 0 { CompressionMethod::Lz4 } else { CompressionMethod::Pglz };
        // Use the caller's workspace limit only for inline compressed
        // values; TOAST assembly always attempts the full decompression
        // since the value is already known to be large.
        let ctx = crate::context::ScanContext::new(".", crate::context::OutputMode::Csv);
        decompress_payload(&bytes[8..], raw_size, method, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_groups_split_on_sequence_gap() {
        let locs = vec![
            ChunkLocation { block_number: 0, offset: 0, length: 2000, chunk_seq: 0 },
            ChunkLocation { block_number: 1, offset: 0, length: 2000, chunk_seq: 1 },
            ChunkLocation { block_number: 2, offset: 0, length: 2000, chunk_seq: 0 },
        ];
        let mut runs: Vec<Vec<ChunkLocation>> = Vec::new();
        for loc in locs {
            match runs.last_mut() {
                Some(run) if run.last().map(|l| l.chunk_seq + 1) == Some(loc.chunk_seq) => run.push(loc),
                _ => runs.push(vec![loc]),
            }
        }
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 1);
    }
}
