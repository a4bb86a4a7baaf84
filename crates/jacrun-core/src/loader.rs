//! Binary condition file reader
//!
//! The file holds `count` records of `NS + 2` native-endian `f64`:
//! `[T, P, species_0 .. species_{NS-1}]`. Temperature and pressure land in
//! their own arrays; concentrations are stored species-major when the
//! requested order differs from the native one, condition-major otherwise.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::{HarnessError, Result};
use crate::layout::{reorder, DataOrder};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Upper bound on up-front reservation for declared record counts.
const RESERVE_LIMIT: usize = 1 << 16;

/// Host-side condition arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionSet {
    /// Temperature per condition
    pub temperature: Vec<f64>,
    /// Pressure per condition
    pub pressure: Vec<f64>,
    /// `num * num_species` concentrations in [`Self::order`]
    pub concentrations: Vec<f64>,
    pub num: usize,
    pub num_species: usize,
    pub order: DataOrder,
}

/// Load `count` conditions from the file at `path`.
///
/// The file length is checked against the declared count before any
/// condition array is allocated.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_conditions(
    path: impl AsRef<Path>,
    count: usize,
    num_species: usize,
    native: DataOrder,
    requested: DataOrder,
) -> Result<ConditionSet> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| HarnessError::io(path, source))?;
    let file_len = file.metadata().map_err(|source| HarnessError::io(path, source))?.len();

    let record_len = num_species + 2;
    let expected = expected_values(count, record_len)?;
    let available = usize::try_from(file_len / F64_BYTES as u64).unwrap_or(usize::MAX);
    if available < expected {
        return Err(HarnessError::Format {
            path: path.to_path_buf(),
            record: available / record_len,
            expected,
            actual: available,
        });
    }

    read_conditions(BufReader::new(file), path, count, num_species, native, requested)
}

/// Read `count` conditions from `reader`. `path` is only used in errors.
///
/// Arrays grow as records arrive, so a declared count larger than the
/// stream fails with [`HarnessError::Format`] without allocating for it.
pub fn read_conditions<R: Read>(
    mut reader: R,
    path: impl Into<PathBuf>,
    count: usize,
    num_species: usize,
    native: DataOrder,
    requested: DataOrder,
) -> Result<ConditionSet> {
    let path = path.into();
    let record_len = num_species + 2;
    let expected = expected_values(count, record_len)?;

    let order = if requested != native {
        DataOrder::SpeciesMajor
    } else {
        DataOrder::ConditionMajor
    };

    let hint = count.min(RESERVE_LIMIT);
    let mut temperature = Vec::with_capacity(hint);
    let mut pressure = Vec::with_capacity(hint);
    let mut concentrations = Vec::with_capacity(hint * num_species);
    let mut bytes = vec![0u8; record_len * F64_BYTES];

    for record in 0..count {
        let filled = read_full(&mut reader, &mut bytes).map_err(|source| HarnessError::io(&path, source))?;
        if filled < bytes.len() {
            return Err(HarnessError::Format {
                path,
                record,
                expected,
                actual: record * record_len + filled / F64_BYTES,
            });
        }

        let mut values = bytes
            .chunks_exact(F64_BYTES)
            .map(bytemuck::pod_read_unaligned::<f64>);
        temperature.push(values.next().unwrap_or_default());
        pressure.push(values.next().unwrap_or_default());
        concentrations.extend(values);
    }

    if order == DataOrder::SpeciesMajor {
        concentrations = reorder(
            &concentrations,
            DataOrder::ConditionMajor,
            DataOrder::SpeciesMajor,
            count,
            num_species,
        );
    }

    debug!(count, num_species, %order, "loaded conditions");
    Ok(ConditionSet {
        temperature,
        pressure,
        concentrations,
        num: count,
        num_species,
        order,
    })
}

/// Total values `count` records hold.
fn expected_values(count: usize, record_len: usize) -> Result<usize> {
    count
        .checked_mul(record_len)
        .ok_or_else(|| {
            HarnessError::invalid_config(format!(
                "{count} conditions of {record_len} values overflow the addressable size"
            ))
        })
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
