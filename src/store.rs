//! On-disk persistence of monitoring data.
//!
//! [`FileStore`] keeps every collected record in memory and writes them as
//! timestamped JSON files, together with a CSV summary of the latest cell
//! reading, whenever it is flushed.

use std::io;

#[cfg(feature = "serde")]
use crate::{
    monitor::Persistence,
    response::{CellPack, RuntimeSnapshot},
};
#[cfg(feature = "serde")]
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[cfg(feature = "serde")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Name of the CSV summary of the latest cell reading.
#[cfg(feature = "serde")]
pub const LATEST_CELL_CSV: &str = "latest_cell_data.csv";

/// Writes monitoring data below a data directory.
#[cfg(feature = "serde")]
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    runtime: Vec<RuntimeSnapshot>,
    cells: Vec<CellPack>,
}

#[cfg(feature = "serde")]
impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            runtime: Vec::new(),
            cells: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes all collected records and returns the paths of the written files.
    ///
    /// Nothing is written for an empty record kind.
    pub fn save(&self) -> Result<Vec<PathBuf>, Error> {
        fs::create_dir_all(&self.dir)?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let mut written = Vec::new();

        if !self.runtime.is_empty() {
            let path = self.dir.join(format!("runtime_{timestamp}.json"));
            write_json(&path, &self.runtime)?;
            log::info!("Saved runtime data to {}", path.display());
            written.push(path);
        }

        if let Some(latest) = self.cells.last() {
            let path = self.dir.join(format!("cell_{timestamp}.json"));
            write_json(&path, &self.cells)?;
            log::info!("Saved cell data to {}", path.display());
            written.push(path);

            let path = self.dir.join(LATEST_CELL_CSV);
            let mut writer = BufWriter::new(File::create(&path)?);
            write_cell_csv(&mut writer, latest)?;
            writer.flush()?;
            log::info!("Saved latest cell data as CSV to {}", path.display());
            written.push(path);
        }

        Ok(written)
    }
}

#[cfg(feature = "serde")]
impl Persistence for FileStore {
    fn append_runtime(&mut self, snapshot: &RuntimeSnapshot) {
        self.runtime.push(snapshot.clone());
    }

    fn append_cells(&mut self, pack: &CellPack) {
        self.cells.push(pack.clone());
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.save().map(|_| ())
    }
}

#[cfg(feature = "serde")]
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Writes the per-cell voltages followed by the pack summary.
#[cfg(feature = "serde")]
pub fn write_cell_csv<W: Write>(writer: &mut W, pack: &CellPack) -> io::Result<()> {
    writeln!(writer, "Cell,Voltage (V)")?;
    for (index, voltage) in pack.cells.iter().take(CellPack::MAX_CELLS).enumerate() {
        writeln!(writer, "cell{},{voltage:.3}", index + 1)?;
    }
    writeln!(writer)?;

    let summary = &pack.summary;
    writeln!(writer, "Parameter,Value")?;
    writeln!(writer, "Min Voltage,{:.3}", summary.min)?;
    writeln!(writer, "Max Voltage,{:.3}", summary.max)?;
    writeln!(writer, "Avg Voltage,{:.3}", summary.average)?;
    writeln!(writer, "Voltage Diff,{:.3}", summary.spread)?;
    writeln!(writer, "Total Voltage,{:.3}", summary.sum)?;
    writeln!(writer, "Temp 1 (°C),{}", pack.temperature1)?;
    writeln!(writer, "Temp 2 (°C),{}", pack.temperature2)?;
    writeln!(writer, "SOC (%),{}", pack.soc)?;
    Ok(())
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use tempfile::TempDir;

    fn cell_pack(soc: u8, millivolts: &[u16]) -> CellPack {
        let mut fields = vec![soc.to_string(), "21".to_string(), "22".to_string()];
        fields.extend(millivolts.iter().map(u16::to_string));
        fields.resize(CellPack::TEXT_FIELD_COUNT, String::new());
        CellPack::decode(&encode(0x0F, fields.join("_").as_bytes())).unwrap()
    }

    fn runtime() -> RuntimeSnapshot {
        RuntimeSnapshot::decode(&encode(0x03, &[0x00; 32])).unwrap()
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn cell_csv_layout() {
        let pack = cell_pack(90, &[3300, 3310, 3320]);
        let mut csv = Vec::new();
        write_cell_csv(&mut csv, &pack).unwrap();

        assert_eq!(
            String::from_utf8(csv).unwrap(),
            "Cell,Voltage (V)\n\
             cell1,3.300\n\
             cell2,3.310\n\
             cell3,3.320\n\
             \n\
             Parameter,Value\n\
             Min Voltage,3.300\n\
             Max Voltage,3.320\n\
             Avg Voltage,3.310\n\
             Voltage Diff,0.020\n\
             Total Voltage,9.930\n\
             Temp 1 (°C),21\n\
             Temp 2 (°C),22\n\
             SOC (%),90\n"
        );
    }

    #[test]
    fn empty_store_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let mut store = FileStore::new(&data_dir);

        store.flush().unwrap();
        assert!(data_dir.is_dir());
        assert!(files(&data_dir).is_empty());
    }

    #[test]
    fn flush_writes_accumulated_records() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path());
        store.append_runtime(&runtime());
        store.append_runtime(&runtime());
        store.append_cells(&cell_pack(80, &[3300, 3300]));
        store.append_cells(&cell_pack(81, &[3400, 3400]));

        let written = store.save().unwrap();
        assert_eq!(written.len(), 3);

        let names = files(dir.path());
        assert_eq!(names.len(), 3);
        assert!(names[0].starts_with("cell_") && names[0].ends_with(".json"));
        assert_eq!(names[1], LATEST_CELL_CSV);
        assert!(names[2].starts_with("runtime_") && names[2].ends_with(".json"));

        let runtime: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(&names[2])).unwrap())
                .unwrap();
        assert_eq!(runtime.as_array().unwrap().len(), 2);

        let cells: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(&names[0])).unwrap())
                .unwrap();
        assert_eq!(cells[1]["soc"], 81);

        let csv = fs::read_to_string(dir.path().join(LATEST_CELL_CSV)).unwrap();
        assert!(csv.contains("cell1,3.400\n"));
        assert!(csv.ends_with("SOC (%),81\n"));
    }

    #[test]
    fn runtime_only_skips_cell_files() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path());
        store.append_runtime(&runtime());

        store.flush().unwrap();
        let names = files(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("runtime_"));
    }
}
