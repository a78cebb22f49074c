use anyhow::{anyhow, Result};
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_block::GridBlock;
use cubelet_core::grid_table::GridRow;

use crate::file_writer::cuboid_file_path;

/// Reads `GridBlock`s back from files written by `FileCuboidWriter`, file after file.
pub struct GridBlockFileReader {
    filenames: Vec<PathBuf>,
    lines: Option<Lines<BufReader<File>>>,
    pos: usize,
}

impl GridBlockFileReader {
    pub fn new(filenames: &[PathBuf]) -> Result<Self> {
        for filename in filenames {
            if !filename.exists() {
                error_bail!("File not found: {}", filename.display());
            }
        }

        Ok(Self {
            filenames: filenames.to_vec(),
            lines: None,
            pos: 0,
        })
    }

    /// Open the next file. Returns false if there are no more files.
    fn open_next_file(&mut self) -> Result<bool> {
        if self.pos >= self.filenames.len() {
            return Ok(false);
        }

        let filename = &self.filenames[self.pos];
        let file = File::open(filename)
            .map_err(|e| anyhow!("failed to open {}, error: {}", filename.display(), e))?;

        self.pos += 1;
        self.lines = Some(BufReader::new(file).lines());

        Ok(true)
    }

    /// All rows of the blocks, in file order.
    pub fn into_rows(self) -> Result<Vec<GridRow>> {
        let mut rows = Vec::new();
        for block in self {
            rows.extend(block?.into_rows());
        }

        Ok(rows)
    }
}

impl Iterator for GridBlockFileReader {
    type Item = Result<GridBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(lines) = self.lines.as_mut() {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => return Some(GridBlock::from_base64(&line)),
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => {}
                }
            }

            match self.open_next_file() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Rows of `cuboid_id` written under `dir`. Empty if the cuboid has no file.
pub fn read_cuboid_rows(dir: &Path, cuboid_id: CuboidId) -> Result<Vec<GridRow>> {
    let path = cuboid_file_path(dir, cuboid_id);
    if !path.exists() {
        return Ok(Vec::new());
    }

    GridBlockFileReader::new(&[path])?.into_rows()
}

/// Cuboids having a file under `dir`, sorted.
pub fn list_cuboids(dir: &Path) -> Result<Vec<CuboidId>> {
    let mut cuboids = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| anyhow!("failed to read dir {}, error: {}", dir.display(), e))?;

    for entry in entries {
        let path = entry?.path();

        if path.extension().and_then(|x| x.to_str()) != Some("grid") {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|x| x.to_str())
            .ok_or_else(|| anyhow!("invalid grid file name: {}", path.display()))?;

        match stem.parse::<u64>() {
            Ok(bits) => cuboids.push(CuboidId::new(bits)),
            Err(_) => info!("skip file not named by cuboid: {}", path.display()),
        }
    }

    cuboids.sort();

    Ok(cuboids)
}
