//! IndexStore: the `.rwdx` on-disk container — save builds each section in
//! memory and writes header + directory + payloads; load memory-maps the
//! file read-only and decodes sections directly out of the mapping.
//!
//! Varints follow an inverted-polarity LEB128: each byte carries 7 bits of
//! payload low-endian, and the **terminal** byte (not the continuation
//! bytes) has its high bit set.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use rustc_hash::FxHashMap;

use crate::dictionary::{AttrId, Dictionary, DictionarySnapshot, ValueId};
use crate::error::{Error, Result};
use crate::people_index::{pack_value_key, pack_year_key, unpack_value_key, unpack_year_key, PeopleIndex};
use crate::posting::Posting;

const MAGIC: u32 = 0x5257_4458;
const VERSION: u32 = 1;

const SECTION_DICT: u32 = 1;
const SECTION_META: u32 = 2;
const SECTION_POSTINGS_VALUE: u32 = 3;
const SECTION_POSTINGS_YEAR: u32 = 4;

const CODEC_ARRAY: u64 = 1;
const CODEC_BITMAP: u64 = 2;

/// Appends `value` to `out` as a varint: continuation bytes carry 7 payload
/// bits with the high bit clear, the terminal byte has the high bit set.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte | 0x80);
            return;
        }
        out.push(byte);
    }
}

/// Reads a varint starting at `pos`, advancing `pos` past it.
fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::CorruptFile("truncated varint".to_string()))?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 != 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptFile("varint too long".to_string()));
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::CorruptFile("truncated string".to_string()))?;
    let s = std::str::from_utf8(&buf[*pos..end])
        .map_err(|e| Error::CorruptFile(format!("invalid utf8: {e}")))?
        .to_string();
    *pos = end;
    Ok(s)
}

fn encode_posting(out: &mut Vec<u8>, posting: &Posting) {
    match posting {
        Posting::Array(ids) => {
            write_varint(out, CODEC_ARRAY);
            write_varint(out, ids.len() as u64);
            let mut prev = 0u32;
            for &id in ids {
                write_varint(out, u64::from(id - prev));
                prev = id;
            }
        }
        Posting::Bitmap(bm) => {
            write_varint(out, CODEC_BITMAP);
            let mut bytes = Vec::with_capacity(bm.serialized_size());
            bm.serialize_into(&mut bytes).expect("serializing to Vec never fails");
            write_varint(out, bytes.len() as u64);
            out.extend_from_slice(&bytes);
        }
    }
}

fn decode_posting(buf: &[u8], pos: &mut usize) -> Result<Posting> {
    let codec = read_varint(buf, pos)?;
    match codec {
        CODEC_ARRAY => {
            let count = read_varint(buf, pos)? as usize;
            let mut ids = Vec::with_capacity(count);
            let mut prev = 0u32;
            for _ in 0..count {
                let gap = read_varint(buf, pos)? as u32;
                prev += gap;
                ids.push(prev);
            }
            Ok(Posting::Array(ids))
        }
        CODEC_BITMAP => {
            let len = read_varint(buf, pos)? as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| Error::CorruptFile("truncated bitmap body".to_string()))?;
            let bm = roaring::RoaringBitmap::deserialize_from(&buf[*pos..end])
                .map_err(|e| Error::CorruptFile(format!("bad bitmap: {e}")))?;
            *pos = end;
            Ok(Posting::Bitmap(bm))
        }
        other => Err(Error::CorruptFile(format!("unknown posting codec {other}"))),
    }
}

fn build_dict_section(dict: &DictionarySnapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(dict.attr_names.len() as u32).to_le_bytes());
    for (aid, name) in dict.attr_names.iter().enumerate() {
        write_string(&mut out, name);
        let values = &dict.value_tables[aid];
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            write_string(&mut out, value);
        }
    }
    out.extend_from_slice(&(dict.person_guids.len() as u32).to_le_bytes());
    for guid in &dict.person_guids {
        write_string(&mut out, guid);
    }
    out
}

fn parse_dict_section(buf: &[u8]) -> Result<DictionarySnapshot> {
    let mut pos = 0usize;
    let attr_count = read_u32(buf, &mut pos)? as usize;
    let mut attr_names = Vec::with_capacity(attr_count);
    let mut value_tables = Vec::with_capacity(attr_count);
    for _ in 0..attr_count {
        attr_names.push(read_string(buf, &mut pos)?);
        let value_count = read_u32(buf, &mut pos)? as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(read_string(buf, &mut pos)?);
        }
        value_tables.push(values);
    }

    let person_guids = if pos < buf.len() {
        let person_count = read_u32(buf, &mut pos)? as usize;
        let mut guids = Vec::with_capacity(person_count);
        for _ in 0..person_count {
            guids.push(read_string(buf, &mut pos)?);
        }
        guids
    } else {
        Vec::new()
    };

    Ok(DictionarySnapshot {
        attr_names,
        value_tables,
        person_guids,
    })
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::CorruptFile("truncated u32".to_string()))?;
    let value = u32::from_le_bytes(buf[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(value)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let end = pos
        .checked_add(8)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::CorruptFile("truncated u64".to_string()))?;
    let value = u64::from_le_bytes(buf[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(value)
}

struct SectionDirEntry {
    kind: u32,
    offset: u64,
    length: u64,
}

/// Reads and writes the `.rwdx` binary container format.
pub struct IndexStore;

impl IndexStore {
    /// Writes `dictionary` and `people_index` to `path` as a `.rwdx` file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on write failure.
    pub fn save(path: impl AsRef<Path>, dictionary: &Dictionary, people_index: &PeopleIndex) -> Result<()> {
        let dict_section = build_dict_section(&dictionary.export_full_snapshot());

        let mut value_count = 0u32;
        let mut value_section = Vec::new();
        for (key, posting) in people_index.enumerate_value_postings() {
            let (attr, value) = unpack_value_key(key);
            write_varint(&mut value_section, attr as u32 as u64);
            write_varint(&mut value_section, value as u32 as u64);
            encode_posting(&mut value_section, posting);
            value_count += 1;
        }

        let mut year_count = 0u32;
        let mut year_section = Vec::new();
        for (key, posting) in people_index.enumerate_year_postings() {
            let (attr, value, year) = unpack_year_key(key);
            write_varint(&mut year_section, attr as u32 as u64);
            write_varint(&mut year_section, value as u32 as u64);
            write_varint(&mut year_section, year as u64);
            encode_posting(&mut year_section, posting);
            year_count += 1;
        }

        let mut meta_section = Vec::new();
        meta_section.extend_from_slice(&people_index.universe_size().to_le_bytes());
        meta_section.extend_from_slice(&value_count.to_le_bytes());
        meta_section.extend_from_slice(&year_count.to_le_bytes());

        let sections: [(u32, &[u8]); 4] = [
            (SECTION_DICT, &dict_section),
            (SECTION_META, &meta_section),
            (SECTION_POSTINGS_VALUE, &value_section),
            (SECTION_POSTINGS_YEAR, &year_section),
        ];

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&MAGIC.to_le_bytes())?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?; // flags
        writer.write_all(&(sections.len() as u32).to_le_bytes())?;

        let header_len = 16u64;
        let directory_len = sections.len() as u64 * 20;
        let mut offset = header_len + directory_len;
        for (kind, payload) in &sections {
            writer.write_all(&kind.to_le_bytes())?;
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&(payload.len() as u64).to_le_bytes())?;
            offset += payload.len() as u64;
        }
        for (_, payload) in &sections {
            writer.write_all(payload)?;
        }
        writer.flush()?;
        tracing::info!(sections = sections.len(), value_count, year_count, "index saved");
        Ok(())
    }

    /// Memory-maps `path` read-only and decodes it into a `(Dictionary,
    /// PeopleIndex)` pair, already sealed.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadMagic`/`Error::UnsupportedVersion`/
    /// `Error::CorruptFile` if the file is malformed, `Error::Io` on I/O
    /// failure.
    pub fn load(path: impl AsRef<Path>) -> Result<(Dictionary, PeopleIndex)> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::load_from_bytes(&mmap)
    }

    /// Decodes a `.rwdx` container already held in memory (used by tests and
    /// by `load` over the mmap).
    ///
    /// # Errors
    ///
    /// See [`IndexStore::load`].
    pub fn load_from_bytes(buf: &[u8]) -> Result<(Dictionary, PeopleIndex)> {
        if buf.len() < 16 {
            return Err(Error::CorruptFile("file shorter than header".to_string()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let section_count = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;

        let mut pos = 16usize;
        let mut entries = Vec::with_capacity(section_count);
        for _ in 0..section_count {
            let kind = read_u32(buf, &mut pos)?;
            let offset = read_u64(buf, &mut pos)?;
            let length = read_u64(buf, &mut pos)?;
            entries.push(SectionDirEntry { kind, offset, length });
        }

        let section_bytes = |entry: &SectionDirEntry| -> Result<&[u8]> {
            let start = usize::try_from(entry.offset)
                .map_err(|_| Error::CorruptFile("offset overflow".to_string()))?;
            let end = start
                .checked_add(usize::try_from(entry.length).map_err(|_| Error::CorruptFile("length overflow".to_string()))?)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| Error::CorruptFile("section out of bounds".to_string()))?;
            Ok(&buf[start..end])
        };

        let dict_entry = entries
            .iter()
            .find(|e| e.kind == SECTION_DICT)
            .ok_or_else(|| Error::CorruptFile("missing Dict section".to_string()))?;
        let snapshot = parse_dict_section(section_bytes(dict_entry)?)?;
        let mut dictionary = Dictionary::new();
        dictionary.import_full_snapshot(snapshot);

        let meta_entry = entries
            .iter()
            .find(|e| e.kind == SECTION_META)
            .ok_or_else(|| Error::CorruptFile("missing Meta section".to_string()))?;
        let meta_bytes = section_bytes(meta_entry)?;
        let mut meta_pos = 0usize;
        let universe_size = read_u64(meta_bytes, &mut meta_pos)?;

        let mut postings_value = FxHashMap::default();
        if let Some(entry) = entries.iter().find(|e| e.kind == SECTION_POSTINGS_VALUE) {
            let bytes = section_bytes(entry)?;
            let mut pos = 0usize;
            while pos < bytes.len() {
                let attr = read_varint(bytes, &mut pos)? as u32 as AttrId;
                let value = read_varint(bytes, &mut pos)? as u32 as ValueId;
                let posting = decode_posting(bytes, &mut pos)?;
                postings_value.insert(pack_value_key(attr, value), posting);
            }
        }

        let mut postings_year = FxHashMap::default();
        if let Some(entry) = entries.iter().find(|e| e.kind == SECTION_POSTINGS_YEAR) {
            let bytes = section_bytes(entry)?;
            let mut pos = 0usize;
            while pos < bytes.len() {
                let attr = read_varint(bytes, &mut pos)? as u32 as AttrId;
                let value = read_varint(bytes, &mut pos)? as u32 as ValueId;
                let year = read_varint(bytes, &mut pos)? as i32;
                let posting = decode_posting(bytes, &mut pos)?;
                postings_year.insert(pack_year_key(attr, value, year), posting);
            }
        }

        let people_index = PeopleIndex::from_sealed_parts(postings_value, postings_year, universe_size);
        tracing::info!(universe_size, "index loaded");
        Ok((dictionary, people_index))
    }
}
