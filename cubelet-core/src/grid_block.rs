//! Compact binary form of a batch of cuboid rows.
//!
//! Dimension values are stored by column, each column split into blocks of
//! `BitPacker4x::BLOCK_LEN` values and bitpacked. The last block is padded with zeros.
//! Measure states follow, row by row.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! cuboid_id: u64 | num_dims: u32 | num_measures: u32 | num_rows: u32
//! for each dimension column, for each block: num_bits: u8 | packed bytes
//! for each row, for each measure: MeasureValue
//! ```
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitpacking::{BitPacker, BitPacker4x};
use likely_stable::unlikely;

use crate::cuboid::CuboidId;
use crate::error_bail;
use crate::grid_table::GridRow;
use crate::measure::{read_u32, read_u64, read_u8, MeasureValue};

const BLOCK_LEN: usize = BitPacker4x::BLOCK_LEN;

/// Smallest encoded measure state: a tag and an empty distinct set.
const MIN_MEASURE_BYTES: usize = 5;

/// Rows of one cuboid, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridBlock {
    cuboid_id: CuboidId,
    num_dims: usize,
    num_measures: usize,
    rows: Vec<GridRow>,
}

impl GridBlock {
    pub fn new(cuboid_id: CuboidId, num_measures: usize) -> Self {
        Self {
            cuboid_id,
            num_dims: cuboid_id.dimension_count(),
            num_measures,
            rows: Vec::new(),
        }
    }

    pub fn cuboid_id(&self) -> CuboidId {
        self.cuboid_id
    }

    pub fn rows(&self) -> &[GridRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<GridRow> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: GridRow) -> Result<()> {
        if unlikely(row.dims.len() != self.num_dims || row.measures.len() != self.num_measures) {
            error_bail!(
                "row width mismatch for grid block of cuboid {}, expected dims: {}, measures: {}, got dims: {}, measures: {}",
                self.cuboid_id,
                self.num_dims,
                self.num_measures,
                row.dims.len(),
                row.measures.len()
            );
        }

        self.rows.push(row);

        Ok(())
    }

    /// Estimated bytes of the rows, not the serialized size.
    pub fn estimated_bytes(&self) -> usize {
        self.rows.iter().map(|r| r.estimated_bytes()).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.rows.len() * (self.num_dims * 4 + 16));

        buf.extend_from_slice(&self.cuboid_id.bits().to_le_bytes());
        buf.extend_from_slice(&(self.num_dims as u32).to_le_bytes());
        buf.extend_from_slice(&(self.num_measures as u32).to_le_bytes());
        buf.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());

        let bitpacker = BitPacker4x::new();
        let mut column = [0u32; BLOCK_LEN];
        let mut compressed = [0u8; BLOCK_LEN * 4];

        for dim in 0..self.num_dims {
            for chunk in self.rows.chunks(BLOCK_LEN) {
                column.fill(0);
                for (i, row) in chunk.iter().enumerate() {
                    column[i] = row.dims[dim];
                }

                let num_bits = bitpacker.num_bits(&column);
                let size = bitpacker.compress(&column, &mut compressed, num_bits);

                buf.push(num_bits);
                buf.extend_from_slice(&compressed[..size]);
            }
        }

        for row in self.rows.iter() {
            for measure in row.measures.iter() {
                measure.write_to(&mut buf);
            }
        }

        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let cuboid_id = CuboidId::new(read_u64(bytes, &mut pos)?);
        let num_dims = read_u32(bytes, &mut pos)? as usize;
        let num_measures = read_u32(bytes, &mut pos)? as usize;
        let num_rows = read_u32(bytes, &mut pos)? as usize;

        if unlikely(num_dims != cuboid_id.dimension_count()) {
            error_bail!(
                "corrupted grid block, cuboid {} has {} dimensions, got: {}",
                cuboid_id,
                cuboid_id.dimension_count(),
                num_dims
            );
        }

        // At least one `num_bits` byte per dimension per block, and the smallest state per
        // measure per row.
        let min_bytes = num_dims
            .saturating_mul(num_rows.div_ceil(BLOCK_LEN))
            .saturating_add(
                num_rows
                    .saturating_mul(num_measures)
                    .saturating_mul(MIN_MEASURE_BYTES),
            );

        if unlikely(
            min_bytes > bytes.len() - pos || (num_dims == 0 && num_measures == 0 && num_rows > 1),
        ) {
            error_bail!(
                "corrupted grid block, {} rows of {} dimensions and {} measures don't fit in {} bytes",
                num_rows,
                num_dims,
                num_measures,
                bytes.len() - pos
            );
        }

        let bitpacker = BitPacker4x::new();
        let mut decompressed = [0u32; BLOCK_LEN];

        let mut dims = vec![Vec::with_capacity(num_dims); num_rows];

        for _ in 0..num_dims {
            let mut row_index = 0;

            while row_index < num_rows {
                let num_bits = read_u8(bytes, &mut pos)?;
                if unlikely(num_bits > 32) {
                    error_bail!("corrupted grid block, num_bits: {}, pos: {}", num_bits, pos);
                }

                let size = num_bits as usize * BLOCK_LEN / 8;
                if unlikely(pos + size > bytes.len()) {
                    error_bail!(
                        "corrupted grid block, need {} bytes at pos {}, len: {}",
                        size,
                        pos,
                        bytes.len()
                    );
                }

                bitpacker.decompress(&bytes[pos..pos + size], &mut decompressed, num_bits);
                pos += size;

                let n = (num_rows - row_index).min(BLOCK_LEN);
                for v in decompressed.iter().take(n) {
                    dims[row_index].push(*v);
                    row_index += 1;
                }
            }
        }

        let mut block = Self::new(cuboid_id, num_measures);
        block.rows.reserve(num_rows);

        for row_dims in dims.into_iter() {
            let mut measures = Vec::with_capacity(num_measures);
            for _ in 0..num_measures {
                measures.push(MeasureValue::read_from(bytes, &mut pos)?);
            }

            block.rows.push(GridRow::new(row_dims, measures));
        }

        if unlikely(pos != bytes.len()) {
            error_bail!(
                "corrupted grid block, {} trailing bytes",
                bytes.len() - pos
            );
        }

        Ok(block)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| anyhow!("invalid base64 grid block, error: {}", e))?;

        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::MeasureFunction;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_grid_block_base64() -> Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let cuboid_id = CuboidId::new(0b1011);

        let mut block = GridBlock::new(cuboid_id, 2);

        // More than one bitpacking block, and a partial last block.
        for i in 0..300u32 {
            block.push(GridRow::new(
                vec![i, rng.gen_range(0..5), rng.gen_range(0..100_000)],
                vec![
                    MeasureValue::Long(rng.gen_range(-100..100)),
                    MeasureFunction::CountDistinct.init(i as i64 % 7),
                ],
            ))?;
        }

        let decoded = GridBlock::from_base64(&block.to_base64())?;
        assert_eq!(decoded, block);

        Ok(())
    }

    #[test]
    fn test_empty_and_apex_block() -> Result<()> {
        let empty = GridBlock::new(CuboidId::new(0b11), 1);
        assert_eq!(GridBlock::from_bytes(&empty.to_bytes())?, empty);

        let mut apex = GridBlock::new(CuboidId::new(0), 1);
        apex.push(GridRow::new(vec![], vec![MeasureValue::Long(42)]))?;
        assert_eq!(GridBlock::from_bytes(&apex.to_bytes())?, apex);

        assert!(apex
            .push(GridRow::new(vec![1], vec![MeasureValue::Long(1)]))
            .is_err());

        Ok(())
    }

    #[test]
    fn test_corrupted_block() {
        let mut block = GridBlock::new(CuboidId::new(0b1), 1);
        block
            .push(GridRow::new(vec![3], vec![MeasureValue::Long(1)]))
            .unwrap();

        let bytes = block.to_bytes();
        assert!(GridBlock::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(GridBlock::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_row_count_beyond_bytes() -> Result<()> {
        let mut block = GridBlock::new(CuboidId::new(0b11), 1);
        block.push(GridRow::new(vec![1, 2], vec![MeasureValue::Long(1)]))?;

        let mut bytes = block.to_bytes();

        // Row count follows the cuboid id and the two column counts.
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(GridBlock::from_bytes(&bytes).is_err());

        bytes[16..20].copy_from_slice(&2u32.to_le_bytes());
        assert!(GridBlock::from_bytes(&bytes).is_err());

        bytes[16..20].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(GridBlock::from_bytes(&bytes)?, block);

        Ok(())
    }
}
