//! Little-endian f32 weight blobs
//!
//! Layout: 4-byte magic, u32 format version, u32 tensor count, then for each
//! tensor a u64 element count followed by the elements.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::{CoreError, Result};

const FORMAT_VERSION: u32 = 1;

/// Write tensors to `path`
pub fn write_blob(path: &Path, magic: &[u8; 4], tensors: &[&[f32]]) -> Result<()> {
    let io = |e| CoreError::storage("WEIGHTS_WRITE_FAILED", "Failed to write weight file", path, e);

    let file = File::create(path).map_err(io)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(magic).map_err(io)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(io)?;
    writer.write_u32::<LittleEndian>(tensors.len() as u32).map_err(io)?;
    for tensor in tensors {
        writer.write_u64::<LittleEndian>(tensor.len() as u64).map_err(io)?;
        for &value in tensor.iter() {
            writer.write_f32::<LittleEndian>(value).map_err(io)?;
        }
    }

    let file = writer.into_inner().map_err(|e| io(e.into_error()))?;
    file.sync_all().map_err(io)
}

/// Read tensors from `path`, checking the magic and each tensor's length
pub fn read_blob(path: &Path, magic: &[u8; 4], expected_lengths: &[usize]) -> Result<Vec<Vec<f32>>> {
    let io = |e| CoreError::storage("WEIGHTS_READ_FAILED", "Failed to read weight file", path, e);

    let file = File::open(path).map_err(io)?;
    let mut reader = BufReader::new(file);

    let mut found = [0u8; 4];
    std::io::Read::read_exact(&mut reader, &mut found).map_err(io)?;
    if &found != magic {
        return Err(CoreError::corrupt("WEIGHTS_BAD_MAGIC", "Weight file has an unexpected header", path));
    }

    let version = reader.read_u32::<LittleEndian>().map_err(io)?;
    if version != FORMAT_VERSION {
        return Err(CoreError::corrupt(
            "WEIGHTS_BAD_VERSION",
            format!("Unsupported weight format version {}", version),
            path,
        ));
    }

    let count = reader.read_u32::<LittleEndian>().map_err(io)? as usize;
    if count != expected_lengths.len() {
        return Err(CoreError::corrupt(
            "WEIGHTS_TENSOR_COUNT",
            format!("Expected {} tensors, found {}", expected_lengths.len(), count),
            path,
        ));
    }

    let mut tensors = Vec::with_capacity(count);
    for &expected in expected_lengths {
        let len = reader.read_u64::<LittleEndian>().map_err(io)? as usize;
        if len != expected {
            return Err(CoreError::corrupt(
                "WEIGHTS_TENSOR_SHAPE",
                format!("Expected tensor of {} elements, found {}", expected, len),
                path,
            ));
        }
        let mut data = vec![0f32; len];
        reader.read_f32_into::<LittleEndian>(&mut data).map_err(io)?;
        tensors.push(data);
    }

    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");

        write_blob(&path, b"TEST", &[&[1.0, 2.0, 3.0], &[-0.5]]).unwrap();
        let tensors = read_blob(&path, b"TEST", &[3, 1]).unwrap();
        assert_eq!(tensors, vec![vec![1.0, 2.0, 3.0], vec![-0.5]]);
    }

    #[test]
    fn test_shape_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");

        write_blob(&path, b"TEST", &[&[1.0, 2.0]]).unwrap();
        let err = read_blob(&path, b"TEST", &[3]).unwrap_err();
        assert_eq!(err.code(), "WEIGHTS_TENSOR_SHAPE");

        let err = read_blob(&path, b"NOPE", &[2]).unwrap_err();
        assert_eq!(err.code(), "WEIGHTS_BAD_MAGIC");
    }
}
