//! Stack map set of a code blob
//!
//! Layout: `u32 heap_size, u32 count`, then per map
//! `u32 pc_offset, u32 omv_count, u32 data_size`, the data, padding to 8.

use crate::format::{align_up, ByteReader, ByteWriter};
use crate::vm::OopMap;
use crate::{Error, Result};

pub fn encoded_size(maps: &[OopMap]) -> usize {
    8 + maps.iter().map(|m| align_up(12 + m.data.len())).sum::<usize>()
}

pub fn encode(maps: &[OopMap], w: &mut ByteWriter) {
    let heap_size = encoded_size(maps) - 8;
    w.put_u32(heap_size as u32);
    w.put_u32(maps.len() as u32);
    for map in maps {
        w.put_u32(map.pc_offset);
        w.put_u32(map.omv_count);
        w.put_u32(map.data.len() as u32);
        w.put_bytes(&map.data);
        w.align();
    }
}

pub fn decode(bytes: &[u8]) -> Result<Vec<OopMap>> {
    let mut r = ByteReader::new(bytes);
    let heap_size = r.u32()? as usize;
    let count = r.u32()? as usize;
    if heap_size != r.remaining() {
        return Err(Error::corruption(format!(
            "oop map set declares {} bytes, section holds {}",
            heap_size,
            r.remaining()
        )));
    }
    let mut maps = Vec::with_capacity(count.min(heap_size / 12));
    for i in 0..count {
        let pc_offset = r.u32()?;
        let omv_count = r.u32()?;
        let size = r.u32()? as usize;
        let data = r
            .bytes(size)
            .map_err(|_| Error::corruption(format!("oop map {} data runs past its section", i)))?
            .to_vec();
        r.align();
        maps.push(OopMap {
            pc_offset,
            omv_count,
            data,
        });
    }
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oop_map_set_codec() {
        let maps = vec![
            OopMap {
                pc_offset: 12,
                omv_count: 2,
                data: vec![1, 2, 3],
            },
            OopMap {
                pc_offset: 40,
                omv_count: 0,
                data: vec![],
            },
        ];
        let mut w = ByteWriter::new();
        encode(&maps, &mut w);
        assert_eq!(w.len(), encoded_size(&maps));
        assert_eq!(decode(w.as_slice()).unwrap(), maps);
    }

    #[test]
    fn test_size_mismatch_is_corruption() {
        let mut w = ByteWriter::new();
        encode(&[], &mut w);
        w.put_u64(0);
        assert!(decode(w.as_slice()).unwrap_err().is_corruption());
    }
}
