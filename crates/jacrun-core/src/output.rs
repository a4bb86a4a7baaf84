//! Flat binary writer for kernel outputs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{HarnessError, Result};
use crate::layout::{reorder, DataOrder};

/// Writes `<dir>/<name>.bin` files of native-endian `f64`.
///
/// Arrays arrive in the layout the batch ran with and are written in the
/// configured data order.
#[derive(Clone, Debug)]
pub struct OutputWriter {
    dir: PathBuf,
    computed: DataOrder,
    written: DataOrder,
    num: usize,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>, computed: DataOrder, written: DataOrder, num: usize) -> Self {
        Self {
            dir: dir.into(),
            computed,
            written,
            num,
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.bin"))
    }

    /// Write one array of `per_condition` values per condition.
    pub fn write(&self, name: &str, per_condition: usize, data: &[f64]) -> Result<PathBuf> {
        if data.len() != per_condition * self.num {
            return Err(HarnessError::HostArrayLength {
                name: name.to_string(),
                expected: per_condition * self.num,
                actual: data.len(),
            });
        }
        fs::create_dir_all(&self.dir).map_err(|source| HarnessError::io(&self.dir, source))?;

        let path = self.path_for(name);
        let reordered;
        let data = if self.computed == self.written || per_condition == 1 {
            data
        } else {
            reordered = reorder(data, self.computed, self.written, self.num, per_condition);
            reordered.as_slice()
        };
        write_f64(&path, data)?;
        info!(path = %path.display(), values = data.len(), order = %self.written, "wrote output");
        Ok(path)
    }
}

fn write_f64(path: &Path, data: &[f64]) -> Result<()> {
    fs::write(path, bytemuck::cast_slice::<f64, u8>(data)).map_err(|source| HarnessError::io(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::read_f64_file;

    #[test]
    fn writes_named_file_in_target_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path().join("out"), DataOrder::SpeciesMajor, DataOrder::ConditionMajor, 2);
        // species-major: [c0s0, c1s0, c0s1, c1s1, c0s2, c1s2]
        let path = writer.write("dy", 3, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]).unwrap();
        assert_eq!(path, dir.path().join("out").join("dy.bin"));
        assert_eq!(read_f64_file(&path).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path(), DataOrder::ConditionMajor, DataOrder::ConditionMajor, 4);
        assert!(matches!(
            writer.write("jac", 2, &[0.0; 7]),
            Err(HarnessError::HostArrayLength { expected: 8, actual: 7, .. })
        ));
    }
}
